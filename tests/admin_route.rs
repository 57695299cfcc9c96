use chrono::Utc;
use mailrag::routes::admin::{
    DatabaseStatusResponse, DeleteResponse, IngestedDetailResponse, IngestedStatusResponse,
    OkResponse, StatusResponse, database_status, delete_email, ingested_detail, ingested_status,
    mark_processed, mark_unprocessed, reset_index, session_debug, session_reset,
};
use mailrag::session::SessionManager;
use mailrag::test_support::{TestDatabase, TestDatabaseError, TestRocketBuilder};
use mailrag::vector_store::{NewChunk, UpsertEmail, VectorStore};
use rocket::http::{ContentType, Status};
use rocket::local::asynchronous::Client;
use rocket::routes;
use rocket::serde::json::json;

async fn seed(store: &VectorStore, doc_id: &str) {
    store
        .upsert_email(&UpsertEmail {
            doc_id: doc_id.to_string(),
            sender: "alice@example.com".to_string(),
            recipient: "bob@example.com".to_string(),
            cc: String::new(),
            bcc: String::new(),
            subject: "Quarterly report".to_string(),
            email_date: Utc::now(),
            attachments: Vec::new(),
            action_score: Some(3),
            importance_score: Some(4),
            reply_by: None,
            embed_model: "nomic-embed-text".to_string(),
            triage_model: "llama3".to_string(),
        })
        .await
        .expect("upsert email");

    store
        .replace_chunks(
            doc_id,
            &[NewChunk { chunk_index: 0, chunk_text: "body text".to_string(), embedding: vec![0.1; 768] }],
        )
        .await
        .expect("replace chunks");
}

#[tokio::test]
async fn admin_routes_cover_lifecycle() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping admin route test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool.clone());
    seed(&store, "doc-1").await;

    let sessions = SessionManager::new();

    let rocket = TestRocketBuilder::new()
        .mount_routes(
            "/",
            routes![
                delete_email,
                reset_index,
                mark_processed,
                mark_unprocessed,
                ingested_status,
                ingested_detail,
                session_debug,
                session_reset,
                database_status,
            ],
        )
        .build()
        .manage(store)
        .manage(sessions);

    let client = Client::tracked(rocket).await.expect("valid rocket instance");

    let response = client
        .post("/admin/mark_processed")
        .header(ContentType::JSON)
        .body(json!({"id": "doc-1"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let body: OkResponse = response.into_json().await.expect("JSON response");
    assert!(body.ok);

    let response = client
        .post("/admin/ingested_detail")
        .header(ContentType::JSON)
        .body(json!({"id": "doc-1"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let detail: IngestedDetailResponse = response.into_json().await.expect("JSON response");
    assert_eq!(detail.doc_id, "doc-1");
    assert!(detail.metadata.processed);
    assert_eq!(detail.metadata.subject, "Quarterly report");

    let response = client
        .post("/admin/ingested_status")
        .header(ContentType::JSON)
        .body(json!({"ids": ["doc-1", "doc-missing"]}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let status: IngestedStatusResponse = response.into_json().await.expect("JSON response");
    assert_eq!(status.ingested, vec!["doc-1".to_string()]);
    assert_eq!(status.processed, vec!["doc-1".to_string()]);

    let response = client.get("/admin/database/status").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let counts: DatabaseStatusResponse = response.into_json().await.expect("JSON response");
    assert_eq!(counts.email_count, 1);
    assert_eq!(counts.chunk_count, 1);

    let response = client
        .post("/admin/session/reset")
        .header(ContentType::JSON)
        .body(json!({"session_id": "nonexistent"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let status: StatusResponse = response.into_json().await.expect("JSON response");
    assert_eq!(status.status, "ok");

    let response = client
        .post("/admin/session/debug")
        .header(ContentType::JSON)
        .body(json!({"session_id": "nonexistent"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotFound);

    let response = client
        .post("/admin/delete")
        .header(ContentType::JSON)
        .body(json!({"id": "doc-1"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let deleted: DeleteResponse = response.into_json().await.expect("JSON response");
    assert_eq!(deleted.chunks_deleted, 1);

    let response = client.get("/admin/database/status").dispatch().await;
    let counts: DatabaseStatusResponse = response.into_json().await.expect("JSON response");
    assert_eq!(counts.email_count, 0);

    seed(&store, "doc-2").await;
    let response = client.post("/admin/reset").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let response = client.get("/admin/database/status").dispatch().await;
    let counts: DatabaseStatusResponse = response.into_json().await.expect("JSON response");
    assert_eq!(counts.email_count, 0);
    assert_eq!(counts.chunk_count, 0);

    test_db.close().await.expect("failed to drop test database");
}
