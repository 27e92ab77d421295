mod common;

use common::{fixture_json, fixture_path, init_registry, manifest};
use spend_engine::worker::{self, Job, WorkQueue, Worker};
use spend_engine::LoadMode;
use std::sync::Arc;

#[tokio::test]
async fn test_worker_loads_queued_sources() {
    // Given: two datasets and their uploaded sources
    let registry = Arc::new(init_registry());
    let mut jobs = Vec::new();
    for name in ["queued-a", "queued-b"] {
        registry.create(manifest(name)).await.unwrap();
        let package = registry.package();
        let source = package
            .ingest_path(fixture_path("data/cra.csv"))
            .await
            .unwrap();
        jobs.push(Job::LoadSource {
            dataset: name.to_string(),
            package: package.id().to_string(),
            filename: source.filename,
            mode: LoadMode::Replace,
        });
    }

    // When: the jobs run through the queue
    let (queue, receiver) = worker::channel();
    for job in jobs {
        queue.enqueue(job).unwrap();
    }
    drop(queue);
    let failures = Worker::new(registry.clone()).run(receiver).await;

    // Then
    assert_eq!(failures, 0);
    for name in ["queued-a", "queued-b"] {
        let dataset = registry.get(name).await.unwrap();
        assert_eq!(registry.fact_table(&dataset).count().await.unwrap(), 5);
    }
}

#[tokio::test]
async fn test_jobs_for_one_dataset_run_one_at_a_time() {
    // Given: a loaded dataset with a model
    let registry = Arc::new(init_registry());
    let mut dataset = registry.create(manifest("serial")).await.unwrap();
    let package = registry.package();
    let source = package
        .ingest_path(fixture_path("data/cra.csv"))
        .await
        .unwrap();
    registry
        .load_source(&mut dataset, source.clone(), LoadMode::Replace)
        .await
        .unwrap();
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();

    // When: reloads and recomputations race for the same dataset
    let (queue, receiver) = worker::channel();
    for _ in 0..3 {
        queue
            .enqueue(Job::LoadSource {
                dataset: "serial".to_string(),
                package: package.id().to_string(),
                filename: source.filename.clone(),
                mode: LoadMode::Replace,
            })
            .unwrap();
        queue
            .enqueue(Job::ComputeCardinalities {
                dataset: "serial".to_string(),
            })
            .unwrap();
    }
    drop(queue);
    let failures = Worker::new(registry.clone()).run(receiver).await;

    // Then: every replace started from an empty table
    assert_eq!(failures, 0);
    let dataset = registry.get("serial").await.unwrap();
    assert_eq!(registry.fact_table(&dataset).count().await.unwrap(), 5);
    assert_eq!(dataset.cardinalities()["region"], 2);
}

#[tokio::test]
async fn test_failed_jobs_are_counted() {
    let registry = Arc::new(init_registry());
    let (queue, receiver) = worker::channel();
    queue
        .enqueue(Job::ComputeCardinalities {
            dataset: "missing".to_string(),
        })
        .unwrap();
    drop(queue);

    let failures = Worker::new(registry).run(receiver).await;

    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_enqueue_after_shutdown_fails() {
    let (queue, receiver) = worker::channel();
    drop(receiver);

    let result = queue.enqueue(Job::ComputeCardinalities {
        dataset: "late".to_string(),
    });

    assert!(result.is_err());
}
