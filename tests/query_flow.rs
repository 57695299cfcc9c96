use chrono::Utc;
use httpmock::MockServer;
use mailrag::config::RagConfig;
use mailrag::model_gateway::ModelGateway;
use mailrag::orchestrator::QueryOrchestrator;
use mailrag::routes::query::{
    CompleteQueryResponse, StartQueryResponse, complete_query, start_query, submit_evidence,
};
use mailrag::session::SessionManager;
use mailrag::test_support::{TestDatabase, TestDatabaseError, TestRocketBuilder};
use mailrag::vector_store::{NewChunk, UpsertEmail, VectorStore};
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous::Client;
use rocket::routes;
use rocket::serde::json::json;
use serde_json::Value;
use std::time::Duration;

fn test_config(gateway_url: String) -> RagConfig {
    RagConfig {
        database_url: String::new(),
        model_gateway_url: gateway_url,
        embed_model: "nomic-embed-text".to_string(),
        chat_model: "llama3.1".to_string(),
        summarize_model: "llama3.1".to_string(),
        triage_model: "llama3.1".to_string(),
        ollama_timeout: Duration::from_secs(5),
        chunk_size: 1200,
        chunk_overlap: 150,
        max_evidence_chars_per_email: 6000,
        new_content_max_chars: 4000,
        quoted_max_lines: 40,
        quoted_max_chars: 2000,
        attachment_max_chars: 1500,
        max_attachments: 5,
        summarize_max_input_chars: 8000,
        quoted_context_summarize: true,
        attachment_summarize: true,
        // Every session in these tests is single-turn at Phase 1, so the
        // rewrite call is skipped regardless of this flag; left on to match
        // the production default.
        query_rewrite: true,
        include_unrehydrated_metadata: false,
        default_mode: "assistive".to_string(),
        pending_query_ttl: Duration::from_secs(600),
        session_idle_ttl: Duration::from_secs(86400),
        tail_max: 24,
        keep_recent: 8,
        history_max_chars: 8000,
    }
}

async fn seed_email(store: &VectorStore, doc_id: &str, subject: &str, embedding: Vec<f32>) {
    store
        .upsert_email(&UpsertEmail {
            doc_id: doc_id.to_string(),
            sender: "alice@example.com".to_string(),
            recipient: "bob@example.com".to_string(),
            cc: String::new(),
            bcc: String::new(),
            subject: subject.to_string(),
            email_date: Utc::now(),
            attachments: Vec::new(),
            action_score: Some(40),
            importance_score: Some(60),
            reply_by: None,
            embed_model: "nomic-embed-text".to_string(),
            triage_model: "llama3.1".to_string(),
        })
        .await
        .expect("upsert email");

    store
        .replace_chunks(
            doc_id,
            &[NewChunk { chunk_index: 0, chunk_text: subject.to_string(), embedding }],
        )
        .await
        .expect("replace chunks");
}

fn raw_message(doc_id: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "Message-Id: <{doc_id}>\r\nFrom: alice@example.com\r\nTo: bob@example.com\r\n\
         Subject: {subject}\r\nDate: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
         Content-Type: text/plain\r\n\r\n{body}\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn three_phase_happy_path_answers_with_sources() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping query flow test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let mock_server = MockServer::start();
    let _embed_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/embeddings");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "embedding": vec![0.02_f32; 768] }));
    });
    let _chat_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/chat");
        then.status(200).header("content-type", "application/json").json_body(json!({
            "message": { "content": "The Project Falcon launch date is March 15 [Email 1]." }
        }));
    });

    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool);
    seed_email(&store, "falcon-launch@x", "Project Falcon launch date", vec![0.02; 768]).await;
    seed_email(&store, "falcon-reply@x", "Re: Project Falcon launch date", vec![0.02; 768]).await;

    let client = build_client(&mock_server, store).await;

    let start_response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s1", "question": "When is the Project Falcon launch date?"}).to_string())
        .dispatch()
        .await;
    assert_eq!(start_response.status(), Status::Ok);
    let start_body: StartQueryResponse = start_response.into_json().await.expect("JSON response");
    assert_eq!(start_body.status, "need_messages");
    assert!(!start_body.message_ids.is_empty());

    for message_id in &start_body.message_ids {
        let raw = raw_message(message_id, "Project Falcon launch date", "March 15 is confirmed.");
        let response = client
            .post("/query/evidence")
            .header(ContentType::Binary)
            .header(Header::new("X-RAG-Request-Id", start_body.request_id.clone()))
            .header(Header::new("X-Thunderbird-Message-Id", message_id.clone()))
            .body(raw)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
    }

    let complete_response = client
        .post("/query/complete")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s1", "request_id": start_body.request_id}).to_string())
        .dispatch()
        .await;
    assert_eq!(complete_response.status(), Status::Ok);
    let complete_body: CompleteQueryResponse =
        complete_response.into_json().await.expect("JSON response");
    let lower = complete_body.answer.to_ascii_lowercase();
    assert!(
        ["march", "falcon", "launch", "15"].iter().any(|needle| lower.contains(needle)),
        "answer did not reference the expected content: {}",
        complete_body.answer
    );
    assert!(!complete_body.sources.is_empty());

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn missing_evidence_allows_retry_after_upload() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping query flow test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let mock_server = MockServer::start();
    let _embed_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/embeddings");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "embedding": vec![0.02_f32; 768] }));
    });
    let _chat_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "message": { "content": "The launch date is March 15." } }));
    });

    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool);
    seed_email(&store, "falcon-launch@x", "Project Falcon launch date", vec![0.02; 768]).await;
    seed_email(&store, "falcon-reply@x", "Re: Project Falcon launch date", vec![0.02; 768]).await;

    let client = build_client(&mock_server, store).await;

    let start_response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s2", "question": "When is the launch?"}).to_string())
        .dispatch()
        .await;
    let start_body: StartQueryResponse = start_response.into_json().await.expect("JSON response");
    assert!(start_body.message_ids.len() >= 2);

    // Upload evidence for every id except the first.
    for message_id in start_body.message_ids.iter().skip(1) {
        let raw = raw_message(message_id, "Project Falcon launch date", "March 15 is confirmed.");
        client
            .post("/query/evidence")
            .header(ContentType::Binary)
            .header(Header::new("X-RAG-Request-Id", start_body.request_id.clone()))
            .header(Header::new("X-Thunderbird-Message-Id", message_id.clone()))
            .body(raw)
            .dispatch()
            .await;
    }

    let incomplete = client
        .post("/query/complete")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s2", "request_id": start_body.request_id}).to_string())
        .dispatch()
        .await;
    assert_eq!(incomplete.status(), Status::BadRequest);
    let problem: Value = incomplete.into_json().await.expect("JSON response");
    let missing = problem["missing"].as_array().expect("missing array present");
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].as_str().unwrap(), start_body.message_ids[0]);

    let remaining_id = &start_body.message_ids[0];
    let raw = raw_message(remaining_id, "Project Falcon launch date", "March 15 is confirmed.");
    let upload = client
        .post("/query/evidence")
        .header(ContentType::Binary)
        .header(Header::new("X-RAG-Request-Id", start_body.request_id.clone()))
        .header(Header::new("X-Thunderbird-Message-Id", remaining_id.clone()))
        .body(raw)
        .dispatch()
        .await;
    assert_eq!(upload.status(), Status::Ok);

    let complete = client
        .post("/query/complete")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s2", "request_id": start_body.request_id}).to_string())
        .dispatch()
        .await;
    assert_eq!(complete.status(), Status::Ok);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn session_id_mismatch_on_complete_is_rejected() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping query flow test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let mock_server = MockServer::start();
    let _embed_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/embeddings");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "embedding": vec![0.02_f32; 768] }));
    });
    let _chat_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "message": { "content": "The launch date is March 15." } }));
    });

    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool);
    seed_email(&store, "falcon-launch@x", "Project Falcon launch date", vec![0.02; 768]).await;

    let client = build_client(&mock_server, store).await;

    let start_response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s1", "question": "When is the launch?"}).to_string())
        .dispatch()
        .await;
    let start_body: StartQueryResponse = start_response.into_json().await.expect("JSON response");

    let response = client
        .post("/query/complete")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s2", "request_id": start_body.request_id}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn no_retrieval_still_returns_a_usable_request_id() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping query flow test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let mock_server = MockServer::start();
    let _embed_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/embeddings");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "embedding": vec![0.02_f32; 768] }));
    });
    let _chat_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/chat");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "message": { "content": "No evidence to go on." } }));
    });

    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool);
    let client = build_client(&mock_server, store).await;

    let start_response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s3", "question": "Anything about quarterly goals?"}).to_string())
        .dispatch()
        .await;
    assert_eq!(start_response.status(), Status::Ok);
    let start_body: StartQueryResponse = start_response.into_json().await.expect("JSON response");
    assert_eq!(start_body.status, "no_retrieval");
    assert!(start_body.message_ids.is_empty());

    let complete_response = client
        .post("/query/complete")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s3", "request_id": start_body.request_id}).to_string())
        .dispatch()
        .await;
    assert_eq!(complete_response.status(), Status::Ok);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn empty_question_is_rejected_as_bad_request() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping query flow test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let mock_server = MockServer::start();
    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool);
    let client = build_client(&mock_server, store).await;

    let response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(json!({"session_id": "s1", "question": "   "}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);

    let response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(json!({"session_id": "", "question": "anything?"}).to_string())
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn validated_filter_is_echoed_back_as_retrieval_sql() {
    let test_db = match TestDatabase::new_from_env().await {
        Ok(db) => db,
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping query flow test: TEST_DATABASE_URL not set");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let mock_server = MockServer::start();
    let _embed_mock = mock_server.mock(|when, then| {
        when.method(httpmock::Method::POST).path("/api/embeddings");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "embedding": vec![0.02_f32; 768] }));
    });

    let pool = test_db.pool_clone();
    let store = VectorStore::new(pool);
    seed_email(&store, "falcon-launch@x", "Project Falcon launch date", vec![0.02; 768]).await;
    let client = build_client(&mock_server, store).await;

    let response = client
        .post("/query")
        .header(ContentType::JSON)
        .body(
            json!({
                "session_id": "s1",
                "question": "When is the launch?",
                "filter": "e.processed = false"
            })
            .to_string(),
        )
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let body: StartQueryResponse = response.into_json().await.expect("JSON response");
    let sql = body.retrieval_sql.expect("retrieval_sql present when filter supplied");
    assert!(sql.contains("e.processed = false"));

    let rejected = client
        .post("/query")
        .header(ContentType::JSON)
        .body(
            json!({
                "session_id": "s1",
                "question": "When is the launch?",
                "filter": "pg_sleep(10) > 0"
            })
            .to_string(),
        )
        .dispatch()
        .await;
    assert_eq!(rejected.status(), Status::BadRequest);

    test_db.close().await.expect("failed to drop test database");
}

async fn build_client(mock_server: &MockServer, store: VectorStore) -> Client {
    let config = test_config(mock_server.base_url());
    let http_client = reqwest::Client::new();
    let gateway = ModelGateway::new(config.model_gateway_url.clone(), http_client, config.ollama_timeout);
    let sessions = SessionManager::new();
    let orchestrator = QueryOrchestrator::new();

    let rocket = TestRocketBuilder::new()
        .mount_routes("/", routes![start_query, submit_evidence, complete_query])
        .build()
        .manage(config)
        .manage(gateway)
        .manage(store)
        .manage(sessions)
        .manage(orchestrator);

    Client::tracked(rocket).await.expect("valid rocket instance")
}
