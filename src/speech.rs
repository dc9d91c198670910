use reqwest::{multipart, Client};
use serde::Deserialize;
use tracing::{error, info, instrument};

use crate::config::SpeechSettings;
use crate::constants::SPEECH_API_VERSION;
use crate::error::{BuddyError, Result};

#[derive(Deserialize, Debug, Clone)]
pub struct CombinedPhrase {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct TranscriptionResponse {
    #[serde(default, rename = "combinedPhrases")]
    combined_phrases: Vec<CombinedPhrase>,
}

/// Picks the phrase with the highest confidence; a lone phrase wins outright.
pub fn best_phrase(phrases: &[CombinedPhrase]) -> Option<&CombinedPhrase> {
    match phrases {
        [] => None,
        [only] => Some(only),
        _ => phrases.iter().max_by(|a, b| {
            a.confidence
                .unwrap_or(0.0)
                .total_cmp(&b.confidence.unwrap_or(0.0))
        }),
    }
}

/// Azure fast transcription client.
#[derive(Clone)]
pub struct SpeechClient {
    http: Client,
    settings: SpeechSettings,
    locales: Vec<String>,
}

impl SpeechClient {
    pub fn new(settings: SpeechSettings, locales: Vec<String>) -> Self {
        Self {
            http: Client::new(),
            settings,
            locales,
        }
    }

    fn transcribe_url(&self) -> String {
        format!(
            "{}/speechtotext/transcriptions:transcribe?api-version={}",
            self.settings.base_url().trim_end_matches('/'),
            SPEECH_API_VERSION
        )
    }

    #[instrument(skip(self, wav), fields(bytes = wav.len()))]
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let definition = serde_json::json!({ "locales": self.locales }).to_string();
        let form = multipart::Form::new()
            .part(
                "audio",
                multipart::Part::bytes(wav)
                    .file_name("recorded_audio.wav")
                    .mime_str("audio/wav")?,
            )
            .part(
                "definition",
                multipart::Part::text(definition).mime_str("application/json")?,
            );

        let response = self
            .http
            .post(self.transcribe_url())
            .header("Ocp-Apim-Subscription-Key", &self.settings.key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Speech API error: {}, {}", status, body);
            return Err(BuddyError::Upstream {
                service: "speech to text",
                status: status.as_u16(),
                body,
            });
        }

        let result: TranscriptionResponse = response.json().await?;
        let phrase = best_phrase(&result.combined_phrases).ok_or(BuddyError::NoSpeech)?;
        if result.combined_phrases.len() > 1 {
            info!(
                "Selected phrase in {} with confidence: {:?}",
                phrase.locale.as_deref().unwrap_or("unknown"),
                phrase.confidence
            );
        }
        if phrase.text.trim().is_empty() {
            return Err(BuddyError::NoSpeech);
        }
        Ok(phrase.text.clone())
    }
}
