use ai_buddy::config::{AppConfig, ServingSettings, TranslatorSettings, TtsSettings};
use ai_buddy::constants::MESSAGE_RUN_STEP;
use ai_buddy::serving::ServingClient;
use ai_buddy::services::Services;
use ai_buddy::store::{Step, StepType};
use ai_buddy::translate::Translator;
use ai_buddy::tts::TtsClient;
use ai_buddy::constants::DEFAULT_HOST;
use ai_buddy::web_server::{bind_listener, router, serve_on};
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app() -> AppConfig {
    AppConfig::from_toml_str(
        r#"
[chatbot]
name = "AI Buddy"
welcome_message = "Hi, ask me about your car."
language = "en"
languages = ["en", "hi", "ta"]
"#,
        |_| None,
    )
    .unwrap()
}

fn services() -> Services {
    Services::in_memory(
        app(),
        ServingClient::new(ServingSettings {
            host: "http://127.0.0.1:9".to_string(),
            token: "unused".to_string(),
            endpoint_name: "buddy".to_string(),
        }),
    )
}

fn server_for(services: Arc<Services>) -> TestServer {
    TestServer::new(router(services, Path::new(env!("CARGO_MANIFEST_DIR")))).unwrap()
}

/// Stores a user message, its run step and the answer, returning (user, answer) ids.
async fn seed_exchange(services: &Services, thread_id: &str) -> (String, String) {
    services
        .data_layer
        .update_thread(
            thread_id,
            Some("Range question".into()),
            Some("driver-7".into()),
            None,
            Some(vec!["ev".into()]),
        )
        .await
        .unwrap();

    let mut user = Step::new(thread_id, None, "You", StepType::UserMessage);
    user.input = "What is my range?".to_string();
    let mut run = Step::new(thread_id, Some(user.id.clone()), MESSAGE_RUN_STEP, StepType::Run);
    run.input = user.input.clone();
    let mut answer = Step::new(
        thread_id,
        Some(run.id.clone()),
        "AI Buddy",
        StepType::AssistantMessage,
    );
    answer.output = "About 400 km.".to_string();
    for step in [&user, &run, &answer] {
        services.data_layer.create_step(step).await.unwrap();
    }
    (user.id, answer.id)
}

#[tokio::test]
async fn test_health() {
    let server = server_for(Arc::new(services()));
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["chatbot"], "AI Buddy");
}

#[tokio::test]
async fn test_index_renders_chatbot() {
    let server = server_for(Arc::new(services()));
    let response = server.get("/").await;
    response.assert_status_ok();
    let html = response.text();
    assert!(html.contains("<title>AI Buddy</title>"));
    assert!(html.contains(r#"<option value="ta">"#));
    assert!(html.contains("/static/chat.js"));
    assert!(!html.contains("Internal Server Error"));
}

#[tokio::test]
async fn test_broken_template_is_a_server_error() {
    let assets = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(assets.path().join("templates")).unwrap();
    std::fs::write(
        assets.path().join("templates/index.html"),
        "<title>{{ chatbot_name|no_such_filter }}</title>",
    )
    .unwrap();
    let server = TestServer::new(router(Arc::new(services()), assets.path())).unwrap();

    let response = server.get("/").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().contains("no_such_filter"));
}

#[tokio::test]
async fn test_static_files() {
    let server = server_for(Arc::new(services()));
    server.get("/static/chat.js").await.assert_status_ok();
    server
        .get("/static/nope.js")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_threads_with_filters() {
    let services = Arc::new(services());
    seed_exchange(&services, "thread-a").await;
    services
        .data_layer
        .update_thread("thread-b", Some("Other".into()), Some("driver-9".into()), None, None)
        .await
        .unwrap();
    let server = server_for(services);

    let body: Value = server.get("/api/threads").await.json();
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["page_info"]["current_page"], 1);

    let body: Value = server
        .get("/api/threads")
        .add_query_param("user_id", "driver-7")
        .await
        .json();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["id"], "thread-a");

    let body: Value = server
        .get("/api/threads")
        .add_query_param("tag", "ev")
        .await
        .json();
    assert_eq!(body["data"][0]["userId"], "driver-7");

    let body: Value = server
        .get("/api/threads")
        .add_query_param("page", 2)
        .add_query_param("page_size", 1)
        .await
        .json();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["page_info"]["has_previous"], true);
    assert_eq!(body["page_info"]["has_next"], false);
}

#[tokio::test]
async fn test_huge_page_is_empty() {
    let services = Arc::new(services());
    seed_exchange(&services, "thread-a").await;
    let server = server_for(services);

    let response = server
        .get("/api/threads")
        .add_query_param("page", 100_000)
        .add_query_param("page_size", 100_000)
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["data"].as_array().unwrap().is_empty());
    assert_eq!(body["page_info"]["has_next"], false);
}

#[tokio::test]
async fn test_invalid_page_is_rejected() {
    let server = server_for(Arc::new(services()));
    let response = server.get("/api/threads").add_query_param("page", 0).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("page"));
}

#[tokio::test]
async fn test_thread_lifecycle() {
    let services = Arc::new(services());
    seed_exchange(&services, "thread-a").await;
    let server = server_for(services);

    let body: Value = server.get("/api/threads/thread-a").await.json();
    assert_eq!(body["name"], "Range question");
    assert_eq!(body["steps"].as_array().unwrap().len(), 3);

    let body: Value = server.get("/api/threads/thread-a/author").await.json();
    assert_eq!(body["author"], "driver-7");

    server
        .delete("/api/threads/thread-a")
        .await
        .assert_status(StatusCode::NO_CONTENT);
    server
        .get("/api/threads/thread-a")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .delete("/api/threads/thread-a")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_feedback_roundtrip() {
    let services = Arc::new(services());
    let (user_id, answer_id) = seed_exchange(&services, "thread-a").await;
    let server = server_for(services.clone());

    let response = server
        .put("/api/feedback")
        .json(&json!({ "forId": answer_id, "value": 1, "comment": "spot on" }))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["message_id"], user_id.as_str());

    let thread = services.data_layer.get_thread("thread-a").await.unwrap().unwrap();
    assert_eq!(thread.feedback.len(), 1);
    assert_eq!(thread.feedback[0].user_message, "What is my range?");

    let body: Value = server.delete(&format!("/api/feedback/{}", user_id)).await.json();
    assert_eq!(body["deleted"], true);
    let body: Value = server.delete(&format!("/api/feedback/{}", user_id)).await.json();
    assert_eq!(body["deleted"], false);
}

#[tokio::test]
async fn test_delete_step() {
    let services = Arc::new(services());
    let (user_id, _) = seed_exchange(&services, "thread-a").await;
    let server = server_for(services.clone());

    server
        .delete(&format!("/api/steps/{}", user_id))
        .await
        .assert_status(StatusCode::NO_CONTENT);
    assert!(services.data_layer.get_step(&user_id).await.unwrap().is_none());
    server
        .delete(&format!("/api/steps/{}", user_id))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_feedback_for_unknown_step() {
    let server = server_for(Arc::new(services()));
    server
        .put("/api/feedback")
        .json(&json!({ "forId": "missing", "value": 1 }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disabled_backends_return_503() {
    let server = server_for(Arc::new(services()));
    server
        .post("/api/translate")
        .json(&json!({ "text": "hello", "to": ["hi"] }))
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
    server
        .post("/api/tts")
        .json(&json!({ "text": "hello" }))
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_translate_endpoint() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .and(header("Ocp-Apim-Subscription-Region", "centralindia"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "translations": [
                { "text": "नमस्ते", "to": "hi" },
                { "text": "வணக்கம்", "to": "ta" }
            ]
        }])))
        .mount(&upstream)
        .await;

    let mut services = services();
    services.translator = Some(Translator::new(TranslatorSettings {
        endpoint: format!("{}/translate", upstream.uri()),
        key: "k".to_string(),
        region: "centralindia".to_string(),
    }));
    let server = server_for(Arc::new(services));

    let response = server
        .post("/api/translate")
        .json(&json!({ "text": "hello", "to": ["hi", "ta"] }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["translations"][1]["to"], "ta");
    assert_eq!(body["translations"][0]["text"], "नमस्ते");
}

#[tokio::test]
async fn test_translate_json_document() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "translations": [{ "text": "अनुवाद", "to": "hi" }]
        }])))
        .mount(&upstream)
        .await;

    let mut services = services();
    services.translator = Some(Translator::new(TranslatorSettings {
        endpoint: format!("{}/translate", upstream.uri()),
        key: "k".to_string(),
        region: "centralindia".to_string(),
    }));
    let server = server_for(Arc::new(services));

    let response = server
        .post("/api/translate")
        .json(&json!({ "json": { "title": "Service due", "km": 10000 }, "to": ["hi"] }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["translations"][0]["to"], "hi");
    assert_eq!(body["translations"][0]["json"], json!({ "title": "अनुवाद", "km": 10000 }));

    server
        .post("/api/translate")
        .json(&json!({ "text": "hi", "json": { "a": "b" }, "to": ["hi"] }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/api/translate")
        .json(&json!({ "json": { "a": "b" }, "to": [] }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tts_endpoint_returns_wav() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cognitiveservices/v1"))
        .and(header("X-Microsoft-OutputFormat", "riff-24khz-16bit-mono-pcm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF....WAVE".to_vec()))
        .mount(&upstream)
        .await;

    let mut services = services();
    services.tts = Some(TtsClient::new(TtsSettings {
        region: "centralindia".to_string(),
        key: "k".to_string(),
        voice: "en-US-AvaMultilingualNeural".to_string(),
        endpoint: Some(upstream.uri()),
    }));
    let server = server_for(Arc::new(services));

    let response = server.post("/api/tts").json(&json!({ "text": "Drive safe" })).await;
    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "audio/wav");
    assert_eq!(response.as_bytes().as_ref(), b"RIFF....WAVE");

    server
        .post("/api/tts")
        .json(&json!({ "text": "   " }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upstream_failure_maps_to_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&upstream)
        .await;

    let mut services = services();
    services.tts = Some(TtsClient::new(TtsSettings {
        region: "centralindia".to_string(),
        key: "wrong".to_string(),
        voice: "en-US-AvaMultilingualNeural".to_string(),
        endpoint: Some(upstream.uri()),
    }));
    let server = server_for(Arc::new(services));

    server
        .post("/api/tts")
        .json(&json!({ "text": "Drive safe" }))
        .await
        .assert_status(StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_server_listens_on_all_interfaces_until_shutdown() {
    let listener = bind_listener(DEFAULT_HOST, 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    assert!(addr.ip().is_unspecified());

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(serve_on(
        listener,
        Arc::new(services()),
        Path::new(env!("CARGO_MANIFEST_DIR")),
        async move {
            let _ = stopped.await;
        },
    ));

    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", addr.port()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
