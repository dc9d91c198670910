use ai_buddy::config::{ServingSettings, SpeechSettings, TranslatorSettings, TtsSettings};
use ai_buddy::error::BuddyError;
use ai_buddy::serving::{ChatMessage, ServingClient};
use ai_buddy::speech::SpeechClient;
use ai_buddy::translate::Translator;
use ai_buddy::tts::TtsClient;
use serde_json::json;
use wiremock::matchers::{
    body_json, body_string_contains, header, header_exists, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn serving(server: &MockServer) -> ServingClient {
    ServingClient::new(ServingSettings {
        host: server.uri(),
        token: "dapi-test".to_string(),
        endpoint_name: "vehicle-agent".to_string(),
    })
}

fn speech(server: &MockServer) -> SpeechClient {
    SpeechClient::new(
        SpeechSettings {
            region: "centralindia".to_string(),
            key: "speech-key".to_string(),
            endpoint: Some(server.uri()),
        },
        vec!["en-IN".to_string(), "hi-IN".to_string()],
    )
}

fn translator(server: &MockServer) -> Translator {
    Translator::new(TranslatorSettings {
        endpoint: format!("{}/translate", server.uri()),
        key: "translator-key".to_string(),
        region: "centralindia".to_string(),
    })
}

#[test_log::test(tokio::test)]
async fn test_predict_parses_answer_and_outputs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/serving-endpoints/vehicle-agent/invocations"))
        .and(header("authorization", "Bearer dapi-test"))
        .and(body_json(json!({
            "messages": [
                { "role": "user", "content": "Tyre pressure?" },
                { "role": "assistant", "content": "32 psi." },
                { "role": "user", "content": "And the spare?" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{ "role": "assistant", "content": "The spare takes 60 psi." }],
            "custom_outputs": {
                "rephrased_query": "spare tyre pressure",
                "context": [{ "page": 212 }]
            },
            "databricks_output": { "databricks_request_id": "req-42" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let answer = serving(&server)
        .predict(&[
            ChatMessage::user("Tyre pressure?"),
            ChatMessage::assistant("32 psi."),
            ChatMessage::user("And the spare?"),
        ])
        .await
        .unwrap();

    assert_eq!(answer.content, "The spare takes 60 psi.");
    assert_eq!(answer.request_id.as_deref(), Some("req-42"));
    assert_eq!(answer.custom_outputs.rephrased_query.as_deref(), Some("spare tyre pressure"));
    assert_eq!(answer.custom_outputs.context, Some(json!([{ "page": 212 }])));
    assert!(answer.custom_outputs.check_query.is_none());
}

#[test_log::test(tokio::test)]
async fn test_predict_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [] })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let client = serving(&server);
    let err = client.predict(&[ChatMessage::user("hi")]).await.unwrap_err();
    assert!(matches!(err, BuddyError::EmptyResponse(_)));

    let err = client.predict(&[ChatMessage::user("hi")]).await.unwrap_err();
    match err {
        BuddyError::Upstream { status, body, .. } => {
            assert_eq!(status, 429);
            assert_eq!(body, "rate limited");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_transcribe_sends_audio_and_locales() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/speechtotext/transcriptions:transcribe"))
        .and(query_param("api-version", "2024-11-15"))
        .and(header("Ocp-Apim-Subscription-Key", "speech-key"))
        .and(body_string_contains(r#"name="definition""#))
        .and(body_string_contains(r#"{"locales":["en-IN","hi-IN"]}"#))
        .and(body_string_contains(r#"filename="recorded_audio.wav""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "durationMilliseconds": 1800,
            "combinedPhrases": [{ "text": "check engine light is on" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let text = speech(&server).transcribe(b"RIFF-fake".to_vec()).await.unwrap();
    assert_eq!(text, "check engine light is on");
}

#[test_log::test(tokio::test)]
async fn test_transcribe_without_phrases_is_no_speech() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "combinedPhrases": [] })))
        .mount(&server)
        .await;

    let err = speech(&server).transcribe(vec![0; 64]).await.unwrap_err();
    assert!(matches!(err, BuddyError::NoSpeech));
}

#[test_log::test(tokio::test)]
async fn test_translate_to_many_languages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .and(query_param("api-version", "3.0"))
        .and(query_param("from", "en"))
        .and(query_param("to", "hi,ta"))
        .and(header("Ocp-Apim-Subscription-Key", "translator-key"))
        .and(header("Ocp-Apim-Subscription-Region", "centralindia"))
        .and(header_exists("X-ClientTraceId"))
        .and(body_json(json!([{ "text": "Low fuel" }])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "translations": [
                { "text": "ईंधन कम है", "to": "hi" },
                { "text": "எரிபொருள் குறைவு", "to": "ta" }
            ]
        }])))
        .mount(&server)
        .await;

    let translations = translator(&server)
        .translate("Low fuel", &["hi".to_string(), "ta".to_string()], "en")
        .await
        .unwrap();
    assert_eq!(translations.len(), 2);
    assert_eq!(translations[0].to, "hi");
    assert_eq!(translations[1].text, "எரிபொருள் குறைவு");
}

#[test_log::test(tokio::test)]
async fn test_translate_requires_a_target() {
    let server = MockServer::start().await;
    let err = translator(&server).translate("hi", &[], "en").await.unwrap_err();
    assert!(matches!(err, BuddyError::Validation(_)));
}

#[test_log::test(tokio::test)]
async fn test_translate_json_only_touches_strings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/translate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "translations": [{ "text": "अनुवादित", "to": "hi" }]
        }])))
        .mount(&server)
        .await;

    let input = json!({
        "title": "Service schedule",
        "intervals": ["10,000 km", "20,000 km"],
        "months": 12,
        "warranty": true,
        "notes": null
    });
    let output = translator(&server)
        .translate_json(&input, "hi", "en")
        .await
        .unwrap();

    assert_eq!(
        output,
        json!({
            "title": "अनुवादित",
            "intervals": ["अनुवादित", "अनुवादित"],
            "months": 12,
            "warranty": true,
            "notes": null
        })
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_synthesize_posts_ssml() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cognitiveservices/v1"))
        .and(header("Ocp-Apim-Subscription-Key", "tts-key"))
        .and(header("Content-Type", "application/ssml+xml"))
        .and(body_string_contains("<voice name='en-IN-NeerjaNeural'>"))
        .and(body_string_contains("Service due &amp; overdue"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'R', b'I', b'F', b'F']))
        .expect(1)
        .mount(&server)
        .await;

    let tts = TtsClient::new(TtsSettings {
        region: "centralindia".to_string(),
        key: "tts-key".to_string(),
        voice: "en-IN-NeerjaNeural".to_string(),
        endpoint: Some(server.uri()),
    });
    let audio = tts.synthesize("Service due & overdue").await.unwrap();
    assert_eq!(audio, b"RIFF".to_vec());
}
