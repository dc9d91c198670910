use reqwest::Client;
use tracing::{error, info, instrument};

use crate::config::TtsSettings;
use crate::constants::TTS_OUTPUT_FORMAT;
use crate::error::{BuddyError, Result};

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn build_ssml(text: &str, voice: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='en-US'><voice name='{}'>{}</voice></speak>",
        escape_xml(voice),
        escape_xml(text)
    )
}

/// Azure neural text-to-speech client.
#[derive(Clone)]
pub struct TtsClient {
    http: Client,
    settings: TtsSettings,
}

impl TtsClient {
    pub fn new(settings: TtsSettings) -> Self {
        Self {
            http: Client::new(),
            settings,
        }
    }

    /// Returns a 24 kHz mono WAV rendering of `text`.
    #[instrument(skip(self, text), fields(voice = %self.settings.voice))]
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(BuddyError::Validation("text must not be empty".to_string()));
        }
        let url = format!(
            "{}/cognitiveservices/v1",
            self.settings.base_url().trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .header("Ocp-Apim-Subscription-Key", &self.settings.key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", TTS_OUTPUT_FORMAT)
            .header("User-Agent", "ai-buddy")
            .body(build_ssml(text, &self.settings.voice))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Speech synthesis canceled: {}, {}", status, body);
            return Err(BuddyError::Upstream {
                service: "text to speech",
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?.to_vec();
        info!("Speech synthesized for {} characters", text.chars().count());
        Ok(audio)
    }
}
