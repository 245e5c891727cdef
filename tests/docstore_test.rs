use futures::StreamExt;
use lead_finder::docstore::{
    fields, DocPath, DocumentStore, SqliteDocumentStore, StoreError, WriteOp,
};
use serde_json::json;
use tokio::time::{timeout, Duration};

async fn setup_store() -> SqliteDocumentStore {
    SqliteDocumentStore::connect("sqlite::memory:").await.unwrap()
}

fn path(id: &str) -> DocPath {
    DocPath::new("reviewed_leads", id)
}

#[tokio::test]
async fn set_update_delete_roundtrip() {
    let store = setup_store().await;
    let p = path("p1");

    store
        .set(&p, fields([("name", json!("Blue Dental")), ("status", json!("waiting"))]))
        .await
        .unwrap();
    store
        .update(&p, fields([("status", json!("completed"))]))
        .await
        .unwrap();
    let doc = store.get(&p).await.unwrap().unwrap();
    assert_eq!(doc.id, "p1");
    assert_eq!(doc.data["name"], "Blue Dental");
    assert_eq!(doc.data["status"], "completed");

    // Set replaces the whole document.
    store.set(&p, fields([("name", json!("Renamed"))])).await.unwrap();
    let doc = store.get(&p).await.unwrap().unwrap();
    assert!(doc.data.get("status").is_none());

    store.delete(&p).await.unwrap();
    assert!(store.get(&p).await.unwrap().is_none());
    // Deleting again is fine.
    store.delete(&p).await.unwrap();
}

#[tokio::test]
async fn update_of_missing_document_is_not_found() {
    let store = setup_store().await;
    let err = store
        .update(&path("ghost"), fields([("status", json!("stopped"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(p) if p.id == "ghost"));
}

#[tokio::test]
async fn merge_keeps_stored_fields() {
    let store = setup_store().await;
    let p = path("p1");
    store
        .set(&p, fields([("status", json!("completed"))]))
        .await
        .unwrap();
    store
        .commit(vec![WriteOp::Merge {
            path: p.clone(),
            data: fields([("status", json!("waiting")), ("city", json!("Lima"))]),
        }])
        .await
        .unwrap();
    let doc = store.get(&p).await.unwrap().unwrap();
    assert_eq!(doc.data["status"], "completed");
    assert_eq!(doc.data["city"], "Lima");

    store
        .commit(vec![WriteOp::Merge {
            path: path("p2"),
            data: fields([("status", json!("waiting"))]),
        }])
        .await
        .unwrap();
    assert!(store.get(&path("p2")).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_batch_applies_nothing() {
    let store = setup_store().await;
    let before = store
        .commit(vec![WriteOp::Set {
            path: path("keep"),
            data: fields([("category", json!("VIP"))]),
        }])
        .await
        .unwrap();

    let err = store
        .commit(vec![
            WriteOp::Set {
                path: path("new"),
                data: fields([("name", json!("New"))]),
            },
            WriteOp::Update {
                path: path("keep"),
                fields: fields([("category", json!("General"))]),
            },
            WriteOp::Update {
                path: path("missing"),
                fields: fields([("category", json!("General"))]),
            },
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    assert!(store.get(&path("new")).await.unwrap().is_none());
    let kept = store.get(&path("keep")).await.unwrap().unwrap();
    assert_eq!(kept.data["category"], "VIP");

    // A rejected batch does not consume a revision.
    let next = store.delete(&path("keep")).await.unwrap();
    assert_eq!(next, before + 1);
}

#[tokio::test]
async fn collection_subscription_sees_every_commit() {
    let store = setup_store().await;
    store
        .set(&path("a"), fields([("name", json!("A"))]))
        .await
        .unwrap();

    let mut sub = store.listen_collection("reviewed_leads").await.unwrap();
    let initial = sub.next().await.unwrap().unwrap();
    assert_eq!(initial.revision, 1);
    assert_eq!(initial.data.len(), 1);

    let rev = store
        .set(&path("b"), fields([("name", json!("B"))]))
        .await
        .unwrap();
    let next = sub.next().await.unwrap().unwrap();
    assert_eq!(next.revision, rev);
    let ids: Vec<&str> = next.data.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    // Writes to other collections still push a snapshot.
    let rev = store
        .set(
            &DocPath::new("settings", "app_config"),
            fields([("categories", json!(["General"]))]),
        )
        .await
        .unwrap();
    let next = sub.next().await.unwrap().unwrap();
    assert_eq!(next.revision, rev);
    assert_eq!(next.data.len(), 2);
}

#[tokio::test]
async fn document_subscription_reports_absence() {
    let store = setup_store().await;
    let settings = DocPath::new("settings", "app_config");
    let mut sub = store.listen_document(&settings).await.unwrap();
    assert!(sub.next().await.unwrap().unwrap().data.is_none());

    store
        .set(&settings, fields([("categories", json!(["General", "VIP"]))]))
        .await
        .unwrap();
    let snap = sub.next().await.unwrap().unwrap();
    let doc = snap.data.unwrap();
    assert_eq!(doc.data["categories"], json!(["General", "VIP"]));

    store.delete(&settings).await.unwrap();
    assert!(sub.next().await.unwrap().unwrap().data.is_none());
}

#[tokio::test]
async fn dropping_a_subscription_unsubscribes() {
    let store = setup_store().await;
    let first = store.listen_collection("reviewed_leads").await.unwrap();
    let mut second = store
        .listen_document(&DocPath::new("settings", "app_config"))
        .await
        .unwrap();
    assert_eq!(store.listener_count(), 2);

    drop(first);
    assert_eq!(store.listener_count(), 1);

    store
        .set(&path("a"), fields([("name", json!("A"))]))
        .await
        .unwrap();
    second.next().await.unwrap().unwrap();
    let pushed = timeout(Duration::from_secs(1), second.next()).await.unwrap();
    assert!(pushed.is_some());

    drop(second);
    assert_eq!(store.listener_count(), 0);
}

#[tokio::test]
async fn file_backed_store_persists_between_connections() {
    let td = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", td.path().join("leads.db").display());

    let store = SqliteDocumentStore::connect(&url).await.unwrap();
    store
        .set(&path("p1"), fields([("name", json!("Blue Dental"))]))
        .await
        .unwrap();
    store.pool().close().await;

    let reopened = SqliteDocumentStore::connect(&url).await.unwrap();
    let doc = reopened.get(&path("p1")).await.unwrap().unwrap();
    assert_eq!(doc.data["name"], "Blue Dental");
}
