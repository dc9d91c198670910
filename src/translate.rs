use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, instrument};

use crate::config::TranslatorSettings;
use crate::constants::TRANSLATOR_API_VERSION;
use crate::error::{BuddyError, Result};

#[derive(Serialize)]
struct TranslateText<'a> {
    text: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    pub to: String,
}

#[derive(Deserialize, Debug)]
struct TranslateResult {
    translations: Vec<Translation>,
}

/// Azure Translator client.
#[derive(Clone)]
pub struct Translator {
    http: Client,
    settings: TranslatorSettings,
}

impl Translator {
    pub fn new(settings: TranslatorSettings) -> Self {
        Self {
            http: Client::new(),
            settings,
        }
    }

    /// Translates `text` into every target language, in request order.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn translate(
        &self,
        text: &str,
        targets: &[String],
        source: &str,
    ) -> Result<Vec<Translation>> {
        if targets.is_empty() {
            return Err(BuddyError::Validation(
                "at least one target language is required".to_string(),
            ));
        }
        let to = targets.join(",");
        let response = self
            .http
            .post(&self.settings.endpoint)
            .query(&[
                ("api-version", TRANSLATOR_API_VERSION),
                ("from", source),
                ("to", to.as_str()),
            ])
            .header("Ocp-Apim-Subscription-Key", &self.settings.key)
            .header("Ocp-Apim-Subscription-Region", &self.settings.region)
            .header("X-ClientTraceId", uuid::Uuid::new_v4().to_string())
            .json(&[TranslateText { text }])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Translator error: {}, {}", status, body);
            return Err(BuddyError::Upstream {
                service: "translator",
                status: status.as_u16(),
                body,
            });
        }

        let results: Vec<TranslateResult> = response.json().await?;
        results
            .into_iter()
            .next()
            .map(|r| r.translations)
            .ok_or(BuddyError::EmptyResponse("translator"))
    }

    /// Translates a single text into one language.
    pub async fn translate_to(&self, text: &str, target: &str, source: &str) -> Result<String> {
        self.translate(text, &[target.to_string()], source)
            .await?
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or(BuddyError::EmptyResponse("translator"))
    }

    /// Translates every string leaf of `value`; keys and other scalars are kept.
    pub fn translate_json<'a>(
        &'a self,
        value: &'a Value,
        target: &'a str,
        source: &'a str,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match value {
                Value::String(text) => Ok(Value::String(
                    self.translate_to(text, target, source).await?,
                )),
                Value::Array(items) => {
                    let mut translated = Vec::with_capacity(items.len());
                    for item in items {
                        translated.push(self.translate_json(item, target, source).await?);
                    }
                    Ok(Value::Array(translated))
                }
                Value::Object(map) => {
                    let mut translated = serde_json::Map::with_capacity(map.len());
                    for (key, item) in map {
                        translated.insert(
                            key.clone(),
                            self.translate_json(item, target, source).await?,
                        );
                    }
                    Ok(Value::Object(translated))
                }
                other => Ok(other.clone()),
            }
        })
    }
}
