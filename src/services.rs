use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{AppConfig, ServiceSettings};
use crate::data_layer::DataLayer;
use crate::error::{BuddyError, Result};
use crate::serving::ServingClient;
use crate::speech::SpeechClient;
use crate::store::{
    ConversationStore, CosmosConversationStore, CosmosThreadStore, MemoryConversationStore,
    MemoryThreadStore, ThreadStore,
};
use crate::translate::Translator;
use crate::tts::TtsClient;

/// Everything a chat session or API handler needs, shared across connections.
pub struct Services {
    pub app: AppConfig,
    pub conversations: Arc<dyn ConversationStore>,
    pub data_layer: DataLayer,
    pub serving: ServingClient,
    pub speech: Option<SpeechClient>,
    pub translator: Option<Translator>,
    pub tts: Option<TtsClient>,
}

impl Services {
    /// Connects every configured backend. Model serving is required.
    pub async fn connect(app: AppConfig, settings: &ServiceSettings) -> Result<Self> {
        let serving = settings.serving.clone().ok_or_else(|| {
            BuddyError::Config(
                "model serving is required: set DATABRICKS_HOST, DATABRICKS_TOKEN and SERVING_ENDPOINT_NAME"
                    .to_string(),
            )
        })?;

        let conversations: Arc<dyn ConversationStore> = match &settings.conversations {
            Some(cosmos) => {
                info!("Using Cosmos DB conversation log {}/{}", cosmos.database, cosmos.container);
                Arc::new(CosmosConversationStore::connect(cosmos).await?)
            }
            None => {
                warn!("Conversation log is kept in memory and lost on restart");
                Arc::new(MemoryConversationStore::new())
            }
        };

        let threads: Arc<dyn ThreadStore> = match &settings.data_layer {
            Some(cosmos) => {
                info!("Using Cosmos DB data layer {}", cosmos.database);
                Arc::new(CosmosThreadStore::connect(cosmos).await?)
            }
            None => {
                warn!("Threads and steps are kept in memory and lost on restart");
                Arc::new(MemoryThreadStore::new())
            }
        };

        let speech = settings
            .speech
            .clone()
            .map(|s| SpeechClient::new(s, app.speech_locales.clone()));

        Ok(Self {
            conversations: conversations.clone(),
            data_layer: DataLayer::new(threads, conversations),
            serving: ServingClient::new(serving),
            speech,
            translator: settings.translator.clone().map(Translator::new),
            tts: settings.tts.clone().map(TtsClient::new),
            app,
        })
    }

    /// In-memory stores around the given serving client; used by tests and `ask`.
    pub fn in_memory(app: AppConfig, serving: ServingClient) -> Self {
        let conversations: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
        Self {
            data_layer: DataLayer::new(Arc::new(MemoryThreadStore::new()), conversations.clone()),
            conversations,
            serving,
            speech: None,
            translator: None,
            tts: None,
            app,
        }
    }
}
