use std::sync::Arc;

use admeasure_cloud::handlers::artifacts::{LookupError, DELETE_BATCH_SIZE};
use admeasure_cloud::test_helpers::{InMemoryArtifactStore, FAKE_STORE_URL};
use admeasure_cloud::{ArtifactClient, StoreError};

fn client_with(store: &Arc<InMemoryArtifactStore>) -> ArtifactClient {
    ArtifactClient::new(store.clone())
}

#[test]
fn prefix_delete_is_batched_and_leaves_other_keys() {
    let store = Arc::new(InMemoryArtifactStore::with_page_size(5000));
    for index in 0..2500 {
        store.seed(&format!("eval/old/site-{index:04}/console.json"), b"[]");
    }
    store.seed("eval/new/site-0/console.json", b"[]");
    let client = client_with(&store);

    let deleted = client.delete_prefix("eval/old/").expect("delete");
    assert_eq!(deleted, 2500);
    assert_eq!(store.delete_batches(), vec![DELETE_BATCH_SIZE, DELETE_BATCH_SIZE, 500]);
    assert_eq!(store.keys(), vec!["eval/new/site-0/console.json".to_string()]);
}

#[test]
fn prefix_delete_follows_pagination() {
    let store = Arc::new(InMemoryArtifactStore::with_page_size(3));
    for index in 0..7 {
        store.seed(&format!("tmp/{index}"), b"x");
    }
    let client = client_with(&store);

    assert_eq!(client.delete_prefix("tmp/").expect("delete"), 7);
    assert!(store.keys().is_empty());
}

#[test]
fn deleting_an_empty_prefix_is_a_no_op() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let client = client_with(&store);
    assert_eq!(client.delete_prefix("nothing/").expect("delete"), 0);
    assert!(store.delete_batches().is_empty());
}

#[test]
fn prefix_enumeration_spans_pages_lazily() {
    let store = Arc::new(InMemoryArtifactStore::with_page_size(2));
    for plan in ["a", "b", "c", "d", "e"] {
        store.seed(&format!("eval/{plan}/news-0/console.json"), b"[]");
        store.seed(&format!("eval/{plan}/plan.json"), b"{}");
    }
    let client = client_with(&store);

    let mut prefixes = client.enumerate_prefixes("eval/", "/");
    let first = prefixes.next().expect("first entry").expect("listing");
    assert_eq!(first, "eval/a/");
    assert_eq!(store.list_calls(), 1);

    let rest: Vec<String> = prefixes
        .collect::<Result<_, StoreError>>()
        .expect("listing");
    assert_eq!(rest, vec!["eval/b/", "eval/c/", "eval/d/", "eval/e/"]);
    assert_eq!(store.list_calls(), 3);
}

#[test]
fn resource_urls_carry_no_signature() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let client = client_with(&store);
    let url = client.resource_url("main.js").expect("url");
    assert_eq!(url, format!("{FAKE_STORE_URL}/resources/main.js"));
}

#[test]
fn uploaded_resources_are_public_under_resources() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let client = client_with(&store);
    let dir = tempfile::tempdir().expect("tempdir");
    let bundle = dir.path().join("main.js");
    std::fs::write(&bundle, b"console.log('run')").expect("write bundle");

    let key = client.upload_resource(&bundle).expect("upload");
    assert_eq!(key, "resources/main.js");
    assert!(store.is_public(&key));
    assert_eq!(store.body(&key).as_deref(), Some(&b"console.log('run')"[..]));
}

#[test]
fn absent_objects_fall_back_to_the_default() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let client = client_with(&store);
    assert_eq!(client.get_or("missing", b"{}".to_vec()).expect("get"), b"{}");
}

#[test]
fn step_url_reads_the_part_file() {
    let store = Arc::new(InMemoryArtifactStore::new());
    store.seed(
        "eval/2024-05-01T10:00:00/news.json",
        br#"{"urls": ["https://a.example", "https://b.example"]}"#,
    );
    let client = client_with(&store);

    let url = client
        .step_url("eval/2024-05-01T10:00:00/news-1/console.json")
        .expect("url");
    assert_eq!(url, "https://b.example");

    let error = client
        .step_url("eval/2024-05-01T10:00:00/news-7")
        .expect_err("index out of range");
    assert!(matches!(error, LookupError::MissingUrl { index: 7, .. }));

    let error = client.step_url("news").expect_err("not a step");
    assert!(matches!(error, LookupError::Identifier(_)));
}
