mod common;

use common::{fixture_json, init_registry, manifest};
use serde_json::json;
use spend_engine::{EngineError, Viewer};
use uuid::Uuid;

#[tokio::test]
async fn test_create_and_lookup_dataset_from_manifest() {
    // Given: a registry and a full ingestion manifest
    let registry = init_registry();
    let manifest = fixture_json("meta/cra.json");

    // When: creating the dataset
    let created = registry.create(manifest).await.expect("dataset created");

    // Then: it can be looked up by name with its attributes intact
    let found = registry
        .lookup_by_name("cra")
        .await
        .unwrap()
        .expect("dataset is registered");
    assert_eq!(found.id, created.id);
    assert_eq!(found.label.as_deref(), Some("Country Regional Analysis"));
    assert_eq!(found.currency.as_deref(), Some("GBP"));
    assert!(found.languages.contains("en"));
    assert!(found.territories.contains("GB"));
    assert!(!found.private);
    assert!(found.created_at <= found.updated_at);

    // And: unknown sections of the manifest are kept in the metadata document
    assert_eq!(found.data.extra.get("source"), Some(&json!("HM Treasury")));

    // And: no fact table exists yet
    assert!(!registry.fact_table(&found).exists().await.unwrap());
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let registry = init_registry();
    registry.create(manifest("budget")).await.unwrap();

    let result = registry.create(manifest("budget")).await;

    assert!(
        matches!(result, Err(EngineError::Conflict { ref name }) if name == "budget"),
        "unexpected result: {:?}",
        result
    );
}

#[tokio::test]
async fn test_invalid_manifests_are_rejected() {
    let registry = init_registry();

    for manifest in [
        json!([1, 2, 3]),
        json!({"fields": []}),
        json!({"dataset": {"label": "No name"}}),
        json!({"dataset": {"name": "has spaces"}}),
        json!({"dataset": {"name": ""}}),
    ] {
        let result = registry.create(manifest.clone()).await;
        assert!(
            matches!(result, Err(EngineError::Validation { .. })),
            "{} should be rejected, got {:?}",
            manifest,
            result
        );
    }
}

#[tokio::test]
async fn test_update_patches_only_present_keys() {
    // Given
    let registry = init_registry();
    let mut dataset = registry.create(manifest("patched")).await.unwrap();
    let created_updated_at = dataset.updated_at;

    // When: changing the label and clearing the currency
    registry
        .update(&mut dataset, json!({"label": "Renamed", "currency": null}))
        .await
        .unwrap();

    // Then
    let stored = registry.get("patched").await.unwrap();
    assert_eq!(stored.label.as_deref(), Some("Renamed"));
    assert_eq!(stored.currency, None);
    assert!(stored.updated_at >= created_updated_at);
    assert_eq!(stored.label, dataset.label);

    // And: the name cannot change
    let result = registry
        .update(&mut dataset, json!({"name": "something-else"}))
        .await;
    assert!(matches!(result, Err(EngineError::Validation { .. })));
    assert_eq!(dataset.name, "patched");
    assert_eq!(dataset.label.as_deref(), Some("Renamed"));
}

#[tokio::test]
async fn test_private_datasets_are_visible_to_managers_and_admins_only() {
    // Given: one public and one private dataset with a manager
    let registry = init_registry();
    let manager = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    registry.create(manifest("public-one")).await.unwrap();
    let mut hidden = registry.create(manifest("private-one")).await.unwrap();
    registry
        .update(&mut hidden, json!({"private": true}))
        .await
        .unwrap();
    registry.add_manager(&hidden, manager).await.unwrap();

    let names = |datasets: Vec<spend_engine::Dataset>| {
        datasets.into_iter().map(|d| d.name).collect::<Vec<_>>()
    };

    // Then
    let anonymous = registry
        .list_visible(&Viewer::anonymous(), true)
        .await
        .unwrap();
    assert_eq!(names(anonymous), vec!["public-one"]);

    let strangers = registry
        .list_visible(&Viewer::account(stranger), true)
        .await
        .unwrap();
    assert_eq!(names(strangers), vec!["public-one"]);

    let managers = registry
        .list_visible(&Viewer::account(manager), true)
        .await
        .unwrap();
    assert_eq!(names(managers), vec!["private-one", "public-one"]);

    let admins = registry
        .list_visible(&Viewer::admin(stranger), true)
        .await
        .unwrap();
    assert_eq!(admins.len(), 2);

    assert!(registry.is_visible(&hidden, &Viewer::account(manager)).await.unwrap());
    assert!(!registry.is_visible(&hidden, &Viewer::anonymous()).await.unwrap());
    assert!(registry.can_write(&hidden, &Viewer::account(manager)).await.unwrap());

    // When: the manager is removed
    assert!(registry.remove_manager(&hidden, manager).await.unwrap());

    // Then: the dataset is hidden from them again
    assert!(!registry.is_visible(&hidden, &Viewer::account(manager)).await.unwrap());
}

#[tokio::test]
async fn test_ordered_listing_sorts_by_label_then_name() {
    let registry = init_registry();
    let mut b = registry.create(manifest("b")).await.unwrap();
    let mut a = registry.create(manifest("a")).await.unwrap();
    registry.create(json!({"dataset": {"name": "unlabelled"}})).await.unwrap();
    registry.update(&mut b, json!({"label": "Alpha"})).await.unwrap();
    registry.update(&mut a, json!({"label": "Alpha"})).await.unwrap();

    let listed: Vec<String> = registry
        .list_visible(&Viewer::anonymous(), true)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();

    assert_eq!(listed, vec!["unlabelled", "a", "b"]);
}

#[tokio::test]
async fn test_delete_removes_dataset_and_fact_table() {
    // Given: a dataset with loaded data
    let registry = init_registry();
    let mut dataset = registry.create(manifest("doomed")).await.unwrap();
    let source = common::load_fixture(&registry, "abc.csv").await;
    registry
        .load_source(&mut dataset, source, spend_engine::LoadMode::Replace)
        .await
        .unwrap();
    let fact_table = registry.fact_table(&dataset);
    assert!(fact_table.exists().await.unwrap());

    // When
    registry.delete(dataset).await.unwrap();

    // Then
    assert!(registry.lookup_by_name("doomed").await.unwrap().is_none());
    assert!(!fact_table.exists().await.unwrap());
    assert!(matches!(
        registry.get("doomed").await,
        Err(EngineError::DatasetNotFound { .. })
    ));

    // And: the name can be reused
    registry.create(manifest("doomed")).await.unwrap();
}

#[tokio::test]
async fn test_to_dict_projection() {
    let registry = init_registry();
    let mut dataset = registry.create(fixture_json("meta/cra.json")).await.unwrap();

    let view = registry.to_dict(&mut dataset).await.unwrap();
    assert_eq!(view.name, "cra");
    assert_eq!(view.api_url, "/api/3/datasets/cra");
    assert_eq!(view.languages, vec!["en"]);
    assert!(!view.has_model);

    let full = registry.to_full_dict(&mut dataset).await.unwrap();
    assert_eq!(full["dataset"]["name"], json!("cra"));
    assert_eq!(full["source"], json!("HM Treasury"));
}
