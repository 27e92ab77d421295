mod common;

use common::{fixture_json, init_registry, load_fixture, manifest};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::json;
use spend_engine::cube::{AggregateQuery, Cut};
use spend_engine::{Dataset, DatasetRegistry, EngineError, LoadMode};

async fn loaded_cra(registry: &DatasetRegistry, name: &str) -> Dataset {
    let mut dataset = registry.create(manifest(name)).await.unwrap();
    let source = load_fixture(registry, "cra.csv").await;
    registry
        .load_source(&mut dataset, source, LoadMode::Replace)
        .await
        .unwrap();
    dataset
}

/// Drops an unreadable part into the dataset's fact table.
async fn corrupt_part(registry: &DatasetRegistry, dataset: &Dataset) -> ObjectPath {
    let table = registry.fact_table(dataset);
    let path = registry.warehouse().path(&format!(
        "facts/{}/part-corrupt-000000.parquet",
        table.table_name()
    ));
    registry
        .warehouse()
        .put(&path, b"not a parquet file".to_vec())
        .await
        .unwrap();
    path
}

#[tokio::test]
async fn test_model_is_absent_without_fact_table() {
    // Given: a dataset with a schema section but no data
    let registry = init_registry();
    let mut dataset = registry.create(manifest("no-data")).await.unwrap();

    // When
    let cardinalities = registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();

    // Then: the schema is stored, but nothing materializes
    assert!(cardinalities.is_none());
    assert!(registry.model(&mut dataset).await.unwrap().is_none());
    assert!(registry.cube(&mut dataset).await.unwrap().is_none());
    let stored = registry.get("no-data").await.unwrap();
    assert_eq!(stored.model_spec(), Some(&fixture_json("model/cra.json")));
}

#[tokio::test]
async fn test_assign_model_computes_cardinalities() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-model").await;

    let cardinalities = registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap()
        .expect("model materializes");

    assert_eq!(cardinalities["time"], 2);
    assert_eq!(cardinalities["region"], 2);
    assert_eq!(cardinalities["function"], 2);

    let stored = registry.get("cra-model").await.unwrap();
    assert_eq!(stored.cardinalities(), &cardinalities);
    assert!(registry.to_dict(&mut dataset).await.unwrap().has_model);
}

#[tokio::test]
async fn test_assigning_the_same_model_twice_is_stable() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-twice").await;
    let model = fixture_json("model/cra.json");

    registry.assign_model(&mut dataset, model.clone()).await.unwrap();
    let first = registry.get("cra-twice").await.unwrap().data;
    registry.assign_model(&mut dataset, model).await.unwrap();
    let second = registry.get("cra-twice").await.unwrap().data;

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_model_is_memoized_until_invalidated() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-cache").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();

    let first = registry.model(&mut dataset).await.unwrap().unwrap();
    let again = registry.model(&mut dataset).await.unwrap().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &again));

    dataset.invalidate_model();
    let rebuilt = registry.model(&mut dataset).await.unwrap().unwrap();
    assert!(!std::sync::Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(*first, *rebuilt);
}

#[tokio::test]
async fn test_model_referencing_missing_columns_does_not_materialize() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-broken").await;
    let broken = json!({
        "dimensions": {"region": {"attributes": {"name": {"column": "nowhere"}}}},
        "measures": {"amount": {"column": "amount"}}
    });

    assert!(matches!(
        registry.validate_model(&dataset, &broken).await,
        Err(EngineError::Validation { .. })
    ));
    registry.assign_model(&mut dataset, broken).await.unwrap();
    assert!(registry.model(&mut dataset).await.unwrap().is_none());

    let text_measure = json!({"measures": {"region": {"column": "region"}}});
    assert!(registry.validate_model(&dataset, &text_measure).await.is_err());
}

#[tokio::test]
async fn test_query_aggregates_with_drilldowns_and_cuts() {
    // Given
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-query").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let cube = registry.cube(&mut dataset).await.unwrap().unwrap();

    // When: totals without drilldowns
    let totals = cube.query(&AggregateQuery::default()).await.unwrap();

    // Then
    assert_eq!(totals.aggregates, vec!["amount.sum", "_count"]);
    assert_eq!(totals.summary["amount.sum"], json!(450.75));
    assert_eq!(totals.summary["_count"], json!(5));
    assert_eq!(totals.total_cell_count, 1);

    // When: drilling down by region within 2011
    let query = AggregateQuery {
        aggregates: vec!["amount.sum".into(), "_count".into()],
        cuts: vec![Cut::new("time.year", "2011")],
        drilldowns: vec!["region".into()],
        page: 1,
        pagesize: None,
    };
    let result = cube.query(&query).await.unwrap();

    // Then: one cell per region, ordered by region
    assert_eq!(result.total_cell_count, 2);
    assert_eq!(result.drilldowns, vec!["region.name"]);
    assert_eq!(result.cuts, vec!["time.year:2011"]);
    assert_eq!(result.cells[0]["region.name"], json!("North"));
    assert_eq!(result.cells[0]["amount.sum"], json!(75.25));
    assert_eq!(result.cells[1]["region.name"], json!("South"));
    assert_eq!(result.cells[1]["_count"], json!(1));
    assert_eq!(result.summary["amount.sum"], json!(150.25));

    // And: the same query yields the same answer
    let again = cube.query(&query).await.unwrap();
    assert_eq!(again.cells, result.cells);
}

#[tokio::test]
async fn test_query_paging() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-pages").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let cube = registry.cube(&mut dataset).await.unwrap().unwrap();

    let page = |page| AggregateQuery {
        drilldowns: vec!["time.year".into(), "region".into()],
        page,
        pagesize: Some(3),
        ..AggregateQuery::default()
    };
    let first = cube.query(&page(1)).await.unwrap();
    let second = cube.query(&page(2)).await.unwrap();

    assert_eq!(first.total_cell_count, 4);
    assert_eq!(first.cells.len(), 3);
    assert_eq!(second.cells.len(), 1);
    assert_eq!(second.cells[0]["time.year"], json!(2011));
    assert_eq!(second.cells[0]["region.name"], json!("South"));
}

#[tokio::test]
async fn test_unknown_references_are_rejected() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-unknown").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let cube = registry.cube(&mut dataset).await.unwrap().unwrap();

    for query in [
        AggregateQuery {
            drilldowns: vec!["galaxy".into()],
            ..AggregateQuery::default()
        },
        AggregateQuery {
            aggregates: vec!["amount.median".into()],
            ..AggregateQuery::default()
        },
        AggregateQuery {
            aggregates: vec!["budget.sum".into()],
            ..AggregateQuery::default()
        },
        AggregateQuery {
            cuts: vec![Cut::new("region.population", "3")],
            ..AggregateQuery::default()
        },
    ] {
        let result = cube.query(&query).await;
        assert!(
            matches!(result, Err(EngineError::Validation { .. })),
            "{:?} should be rejected",
            query
        );
    }
}

#[tokio::test]
async fn test_members_and_facts() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-members").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let cube = registry.cube(&mut dataset).await.unwrap().unwrap();

    // members carry every attribute of the dimension
    let members = cube.members("function", &[]).await.unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[0]["function.code"], json!("07"));
    assert_eq!(members[0]["function.label"], json!("Health"));

    let southern = cube
        .members("function", &[Cut::new("region.name", "South")])
        .await
        .unwrap();
    assert_eq!(southern.len(), 2);

    let regions = cube.members("region.name", &[]).await.unwrap();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[1]["region.name"], json!("South"));
    assert!(cube.members("galaxy", &[]).await.is_err());

    // raw rows, filtered and paged
    let facts = cube
        .facts(&[Cut::new("region.name", "North")], 1, Some(2))
        .await
        .unwrap();
    assert_eq!(facts.total_fact_count, 3);
    assert_eq!(facts.data.len(), 2);
    assert_eq!(facts.data[0]["year"], json!(2010));
    assert_eq!(facts.data[0]["cofog_code"], json!("07"));
}

#[tokio::test]
async fn test_reload_refreshes_cardinalities() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-reload").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();

    let source = load_fixture(&registry, "cra-2012.csv").await;
    registry
        .load_source(&mut dataset, source, LoadMode::Append)
        .await
        .unwrap();

    let stored = registry.get("cra-reload").await.unwrap();
    assert_eq!(stored.cardinalities()["time"], 3);
    assert_eq!(stored.cardinalities()["region"], 3);
    assert_eq!(stored.cardinalities()["function"], 3);
}

#[tokio::test]
async fn test_model_is_dropped_with_its_fact_table() {
    // Given: a dataset whose model has been materialized
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-dropped").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    assert!(registry.model(&mut dataset).await.unwrap().is_some());

    // When: the fact table goes away
    assert!(registry.fact_table(&dataset).drop().await.unwrap());

    // Then: the memoized model goes with it
    assert!(registry.model(&mut dataset).await.unwrap().is_none());
    assert!(registry.cube(&mut dataset).await.unwrap().is_none());
    assert!(!registry.to_dict(&mut dataset).await.unwrap().has_model);

    // And: reloading brings it back
    let source = load_fixture(&registry, "cra.csv").await;
    registry
        .load_source(&mut dataset, source, LoadMode::Replace)
        .await
        .unwrap();
    assert!(registry.cube(&mut dataset).await.unwrap().is_some());
}

#[tokio::test]
async fn test_pages_past_the_end_are_empty() {
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-far-page").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let cube = registry.cube(&mut dataset).await.unwrap().unwrap();

    let result = cube
        .query(&AggregateQuery {
            drilldowns: vec!["region".into()],
            page: usize::MAX,
            pagesize: Some(2),
            ..AggregateQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(result.total_cell_count, 2);
    assert_eq!(result.page, usize::MAX);
    assert!(result.cells.is_empty());

    let facts = cube.facts(&[], usize::MAX, Some(2)).await.unwrap();
    assert_eq!(facts.total_fact_count, 5);
    assert!(facts.data.is_empty());

    let last = cube.facts(&[], 3, Some(2)).await.unwrap();
    assert_eq!(last.data.len(), 1);
}

#[tokio::test]
async fn test_failed_cardinalities_keep_the_new_schema() {
    // Given: a modelled dataset with an unreadable part in its fact table
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-unreadable").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let corrupt = corrupt_part(&registry, &dataset).await;

    let mut relabelled = fixture_json("model/cra.json");
    relabelled["measures"]["amount"]["label"] = json!("Spending");

    // When
    let result = registry.assign_model(&mut dataset, relabelled.clone()).await;

    // Then: the error surfaces, the schema write stands
    assert!(result.is_err());
    let stored = registry.get("cra-unreadable").await.unwrap();
    assert_eq!(stored.model_spec(), Some(&relabelled));
    assert!(stored.cardinalities().is_empty());

    // And: a later refresh recovers once the table is readable again
    registry.warehouse().store().delete(&corrupt).await.unwrap();
    let mut dataset = registry.get("cra-unreadable").await.unwrap();
    let cardinalities = registry
        .refresh_cardinalities(&mut dataset)
        .await
        .unwrap()
        .expect("model materializes");
    assert_eq!(cardinalities["region"], 2);
    assert_eq!(
        registry.get("cra-unreadable").await.unwrap().cardinalities(),
        &cardinalities
    );
}

#[tokio::test]
async fn test_committed_load_survives_failed_cardinalities() {
    // Given: a modelled dataset with an unreadable part in its fact table
    let registry = init_registry();
    let mut dataset = loaded_cra(&registry, "cra-committed").await;
    registry
        .assign_model(&mut dataset, fixture_json("model/cra.json"))
        .await
        .unwrap();
    let corrupt = corrupt_part(&registry, &dataset).await;

    // When: appending, which commits rows before the refresh
    let source = load_fixture(&registry, "cra-2012.csv").await;
    let report = registry
        .load_source(&mut dataset, source, LoadMode::Append)
        .await
        .unwrap();

    // Then: the load counts, the previous cardinalities stay
    assert_eq!(report.rows, 1);
    let stored = registry.get("cra-committed").await.unwrap();
    assert_eq!(stored.cardinalities()["time"], 2);

    registry.warehouse().store().delete(&corrupt).await.unwrap();
    assert_eq!(registry.fact_table(&stored).count().await.unwrap(), 6);
    let mut dataset = stored;
    let cardinalities = registry
        .refresh_cardinalities(&mut dataset)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cardinalities["time"], 3);
}
