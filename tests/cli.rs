use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const APP: &str = r#"
[chatbot]
name = "Test Buddy"
welcome_message = "Hello from the test app."
language = "en"
languages = ["en", "hi"]
"#;

/// Runs the binary in an empty directory with a clean environment.
fn buddy(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ai-buddy").unwrap();
    cmd.current_dir(dir.path()).env_clear();
    cmd
}

fn with_serving(cmd: &mut Command) -> &mut Command {
    cmd.env("DATABRICKS_HOST", "http://127.0.0.1:9")
        .env("DATABRICKS_TOKEN", "dapi-test")
        .env("SERVING_ENDPOINT_NAME", "buddy")
}

#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    buddy(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: ai-buddy <COMMAND>"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("ask"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("--version"));
}

#[test]
fn test_cli_run_help_shows_container_defaults() {
    let dir = TempDir::new().unwrap();
    buddy(&dir)
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: ai-buddy run [OPTIONS] [APP_FILE]"))
        .stdout(predicate::str::contains("[default: app.toml]"))
        .stdout(predicate::str::contains("[default: 0.0.0.0]"))
        .stdout(predicate::str::contains("[default: 8000]"));
}

#[test]
fn test_cli_no_command() {
    let dir = TempDir::new().unwrap();
    buddy(&dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage: ai-buddy <COMMAND>"));
}

#[test]
fn test_run_with_missing_app_file_fails() {
    let dir = TempDir::new().unwrap();
    with_serving(&mut buddy(&dir))
        .args(["run", "missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.toml"))
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_run_defaults_to_app_toml() {
    let dir = TempDir::new().unwrap();
    with_serving(&mut buddy(&dir))
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("app.toml"));
}

#[test]
fn test_check_reports_backends() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.toml"), APP).unwrap();
    with_serving(&mut buddy(&dir))
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("App file app.toml is valid"))
        .stdout(predicate::str::contains("chatbot: Test Buddy"))
        .stdout(predicate::str::contains("languages: en, hi"))
        .stdout(predicate::str::contains("model serving: enabled"))
        .stdout(predicate::str::contains("translator: disabled"));
}

#[test]
fn test_check_applies_env_overrides() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("custom.toml"), APP).unwrap();
    with_serving(&mut buddy(&dir))
        .env("CHATBOT_NAME", "Fleet Buddy")
        .args(["check", "custom.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chatbot: Fleet Buddy"));
}

#[test]
fn test_check_without_serving_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.toml"), APP).unwrap();
    buddy(&dir)
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("model serving: disabled"))
        .stderr(predicate::str::contains("Model serving is required"));
}

#[test]
fn test_check_reports_missing_fields() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.toml"), "[chatbot]\nname = \"Half Buddy\"\n").unwrap();
    with_serving(&mut buddy(&dir))
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("WELCOME_MESSAGE"))
        .stderr(predicate::str::contains("LANGUAGE"));
}

#[test]
fn test_ask_requires_serving() {
    let dir = TempDir::new().unwrap();
    buddy(&dir)
        .args(["ask", "What is my range?"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Model serving is not configured"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ask_prints_model_answer() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/serving-endpoints/buddy/invocations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{ "role": "assistant", "content": "Roughly 400 km." }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.toml"), APP).unwrap();
    buddy(&dir)
        .env("DATABRICKS_HOST", server.uri())
        .env("DATABRICKS_TOKEN", "dapi-test")
        .env("SERVING_ENDPOINT_NAME", "buddy")
        .args(["ask", "--app", "app.toml", "What is my range?"])
        .assert()
        .success()
        .stdout(predicate::str::diff("Test Buddy: Roughly 400 km.\n"));
}
