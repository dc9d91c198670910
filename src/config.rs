//! App definition file and backend settings.
//!
//! The app file names the chatbot and is the process entry point. Backend
//! keys come from the environment (usually a `.env` file) and every backend
//! is enabled only when all of its variables are present.

use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use crate::constants;
use crate::error::{BuddyError, Result};

#[derive(Debug, Default, Deserialize)]
struct AppFile {
    #[serde(default)]
    chatbot: ChatbotSection,
    #[serde(default)]
    speech: SpeechSection,
}

#[derive(Debug, Default, Deserialize)]
struct ChatbotSection {
    name: Option<String>,
    welcome_message: Option<String>,
    language: Option<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    retain_threads: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SpeechSection {
    locales: Option<Vec<String>>,
}

/// The resolved app definition.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Author name used for bot messages
    pub name: String,
    pub welcome_message: String,
    /// Base language of the model's answers
    pub language: String,
    /// Languages offered in the chat settings panel
    pub languages: Vec<String>,
    pub speech_locales: Vec<String>,
    /// Keep a session's thread after the client disconnects
    pub retain_threads: bool,
}

impl AppConfig {
    /// Loads the app file at `path`, applying environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(BuddyError::Config(format!(
                "app file '{}' does not exist",
                path.display()
            )));
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents, |key| std::env::var(key).ok())?;
        info!("Loaded app file {} for chatbot '{}'", path.display(), config.name);
        Ok(config)
    }

    pub fn from_toml_str(contents: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: AppFile = toml::from_str(contents)
            .map_err(|e| BuddyError::Config(format!("invalid app file: {}", e)))?;

        let pick = |env_key: &str, from_file: Option<String>| {
            lookup(env_key)
                .filter(|v| !v.trim().is_empty())
                .or(from_file)
                .filter(|v| !v.trim().is_empty())
        };
        let name = pick("CHATBOT_NAME", file.chatbot.name);
        let welcome_message = pick("WELCOME_MESSAGE", file.chatbot.welcome_message);
        let language = pick("LANGUAGE", file.chatbot.language);

        let mut missing = Vec::new();
        if name.is_none() {
            missing.push("chatbot.name (CHATBOT_NAME)");
        }
        if welcome_message.is_none() {
            missing.push("chatbot.welcome_message (WELCOME_MESSAGE)");
        }
        if language.is_none() {
            missing.push("chatbot.language (LANGUAGE)");
        }
        let (Some(name), Some(welcome_message), Some(language)) = (name, welcome_message, language)
        else {
            return Err(BuddyError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        };

        let speech_locales = match lookup("SPEECH_LOCALES") {
            Some(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(locales) => locales,
                Err(_) => {
                    warn!("Invalid JSON in SPEECH_LOCALES environment variable. Using defaults.");
                    file.speech
                        .locales
                        .unwrap_or_else(|| constants::DEFAULT_SPEECH_LOCALES.clone())
                }
            },
            None => file
                .speech
                .locales
                .unwrap_or_else(|| constants::DEFAULT_SPEECH_LOCALES.clone()),
        };

        Ok(Self {
            name,
            welcome_message,
            language,
            languages: file.chatbot.languages,
            speech_locales,
            retain_threads: file.chatbot.retain_threads,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CosmosSettings {
    /// Account endpoint, e.g. `https://account.documents.azure.com:443/`
    pub endpoint: String,
    /// Base64 master key
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct ConversationStoreSettings {
    pub cosmos: CosmosSettings,
    pub database: String,
    pub container: String,
    /// Name of the partition key property, without the leading slash
    pub partition_key: String,
}

#[derive(Debug, Clone)]
pub struct DataLayerSettings {
    pub cosmos: CosmosSettings,
    pub database: String,
    pub threads_container: String,
    pub steps_container: String,
}

#[derive(Debug, Clone)]
pub struct ServingSettings {
    pub host: String,
    pub token: String,
    pub endpoint_name: String,
}

#[derive(Debug, Clone)]
pub struct SpeechSettings {
    pub region: String,
    pub key: String,
    /// Replaces `https://{region}.api.cognitive.microsoft.com`
    pub endpoint: Option<String>,
}

impl SpeechSettings {
    pub fn base_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.api.cognitive.microsoft.com", self.region))
    }
}

#[derive(Debug, Clone)]
pub struct TranslatorSettings {
    pub endpoint: String,
    pub key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct TtsSettings {
    pub region: String,
    pub key: String,
    pub voice: String,
    /// Replaces `https://{region}.tts.speech.microsoft.com`
    pub endpoint: Option<String>,
}

impl TtsSettings {
    pub fn base_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.tts.speech.microsoft.com", self.region))
    }
}

/// Settings for every backend. `None` means the backend is disabled.
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub conversations: Option<ConversationStoreSettings>,
    pub data_layer: Option<DataLayerSettings>,
    pub serving: Option<ServingSettings>,
    pub speech: Option<SpeechSettings>,
    pub translator: Option<TranslatorSettings>,
    pub tts: Option<TtsSettings>,
}

/// Returns all values when every key is set, warning when only some are.
fn group<const N: usize>(
    backend: &str,
    keys: [&str; N],
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<[String; N]> {
    let values = keys.map(|k| lookup(k).filter(|v| !v.trim().is_empty()));
    let missing: Vec<&str> = keys
        .iter()
        .zip(values.iter())
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| *k)
        .collect();
    if missing.is_empty() {
        return Some(values.map(|v| v.unwrap_or_default()));
    }
    if missing.len() < N {
        warn!("{} disabled, missing: {}", backend, missing.join(", "));
    }
    None
}

impl ServiceSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let cosmos = |[endpoint, key]: [String; 2]| CosmosSettings { endpoint, key };

        let conversations = group(
            "Conversation log",
            [
                "COSMOS_DB_HOST",
                "COSMOS_DB_KEY",
                "CONVERSATIONS_DB",
                "CONVERSATIONS_CONTAINER",
                "CONVERSATIONS_PARTITION_KEY",
            ],
            &lookup,
        )
        .map(|[host, key, database, container, partition_key]| ConversationStoreSettings {
            cosmos: cosmos([host, key]),
            database,
            container,
            partition_key: partition_key.trim_start_matches('/').to_string(),
        });

        let data_layer = group(
            "Data layer",
            [
                "COSMOS_DB_HOST",
                "COSMOS_DB_KEY",
                "DATA_LAYER_DB",
                "DATA_LAYER_THREADS_CONTAINER",
                "DATA_LAYER_STEPS_CONTAINER",
            ],
            &lookup,
        )
        .map(|[host, key, database, threads_container, steps_container]| DataLayerSettings {
            cosmos: cosmos([host, key]),
            database,
            threads_container,
            steps_container,
        });

        let serving = group(
            "Model serving",
            ["DATABRICKS_HOST", "DATABRICKS_TOKEN", "SERVING_ENDPOINT_NAME"],
            &lookup,
        )
        .map(|[host, token, endpoint_name]| ServingSettings {
            host: host.trim_end_matches('/').to_string(),
            token,
            endpoint_name,
        });

        let speech = group("Speech to text", ["SPEECH_REGION", "SPEECH_KEY"], &lookup).map(
            |[region, key]| SpeechSettings {
                region,
                key,
                endpoint: lookup("SPEECH_ENDPOINT"),
            },
        );

        let translator = group(
            "Translator",
            [
                "AZURE_TRANSLATE_API_ENDPOINT",
                "AZURE_TRANSLATE_API_KEY",
                "AZURE_TRANSLATE_API_REGION",
            ],
            &lookup,
        )
        .map(|[endpoint, key, region]| TranslatorSettings { endpoint, key, region });

        let tts = group(
            "Text to speech",
            ["SPEECH_API_KEY", "SPEECH_API_SERVICE_REGION"],
            &lookup,
        )
        .map(|[key, region]| TtsSettings {
            region,
            key,
            voice: lookup("TTS_VOICE").unwrap_or_else(|| constants::DEFAULT_TTS_VOICE.to_string()),
            endpoint: lookup("TTS_ENDPOINT"),
        });

        Self {
            conversations,
            data_layer,
            serving,
            speech,
            translator,
            tts,
        }
    }

    /// One line per backend, in the order they are listed in the `.env` template.
    pub fn summary(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("conversation log (cosmos)", self.conversations.is_some()),
            ("data layer (cosmos)", self.data_layer.is_some()),
            ("model serving", self.serving.is_some()),
            ("speech to text", self.speech.is_some()),
            ("translator", self.translator.is_some()),
            ("text to speech", self.tts.is_some()),
        ]
    }

    pub fn log_summary(&self) {
        for (backend, enabled) in self.summary() {
            if enabled {
                info!("Backend enabled: {}", backend);
            } else {
                warn!("Backend disabled: {}", backend);
            }
        }
    }
}
