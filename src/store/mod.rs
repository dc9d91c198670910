//! Persistence for the chat: the conversation log sent to the model and the
//! thread/step records behind the chat UI.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::serving::ChatMessage;

pub mod cosmos;
pub mod memory;

pub use cosmos::{CosmosClient, CosmosConversationStore, CosmosThreadStore};
pub use memory::{MemoryConversationStore, MemoryThreadStore};

/// One question/answer exchange in the conversation log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Turn {
    pub databricks_request_id: Option<String>,
    pub message_id: String,
    pub user_message: String,
    #[serde(default)]
    pub rephrased_message: String,
    #[serde(default)]
    pub check_query: String,
    #[serde(default)]
    pub comparison_details: Option<serde_json::Value>,
    pub ai_answer: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub feedback_vote: i64,
    #[serde(default)]
    pub feedback_text: String,
    pub timestamp: DateTime<Utc>,
}

/// The conversation log document for one chat.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub conversation: Vec<Turn>,
}

impl Conversation {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            id: chat_id.into(),
            conversation: Vec::new(),
        }
    }

    /// Flattens turns into the role/content history the model expects.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut history = Vec::with_capacity(self.conversation.len() * 2);
        for turn in &self.conversation {
            if !turn.user_message.is_empty() {
                history.push(ChatMessage::user(turn.user_message.clone()));
            }
            if !turn.ai_answer.is_empty() {
                history.push(ChatMessage::assistant(turn.ai_answer.clone()));
            }
        }
        history
    }

    pub(crate) fn turn_mut(&mut self, message_id: &str) -> Option<&mut Turn> {
        self.conversation
            .iter_mut()
            .find(|t| t.message_id == message_id)
    }
}

/// Storage for the conversation log.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, chat_id: &str) -> Result<()>;

    async fn get_conversation(&self, chat_id: &str) -> Result<Option<Conversation>>;

    async fn append_turn(&self, chat_id: &str, turn: Turn) -> Result<()>;

    async fn upsert_feedback(
        &self,
        chat_id: &str,
        message_id: &str,
        vote: i64,
        text: &str,
    ) -> Result<()>;

    async fn reset_feedback(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.upsert_feedback(chat_id, message_id, 0, "").await
    }

    /// History for the model; creates an empty conversation on first use.
    async fn get_chat_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        match self.get_conversation(chat_id).await? {
            Some(conversation) => Ok(conversation.history()),
            None => {
                self.create_conversation(chat_id).await?;
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    UserMessage,
    AssistantMessage,
    Run,
    Tool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        thread_id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        step_type: StepType,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            parent_id,
            name: name.into(),
            step_type,
            input: String::new(),
            output: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(
            self.step_type,
            StepType::UserMessage | StepType::AssistantMessage
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeedbackRecord {
    pub message_id: String,
    pub user_message: String,
    pub value: i64,
    #[serde(default)]
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub feedback: Vec<FeedbackRecord>,
}

impl Thread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            user_id: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            feedback: Vec::new(),
        }
    }

    pub fn matches(&self, filter: &ThreadFilter) -> bool {
        let user_ok = filter
            .user_id
            .as_deref()
            .map_or(true, |u| self.user_id.as_deref() == Some(u));
        let tag_ok = filter
            .tag
            .as_deref()
            .map_or(true, |t| self.tags.iter().any(|tag| tag == t));
        user_ok && tag_ok
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ThreadFilter {
    pub user_id: Option<String>,
    pub tag: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub current_page: u32,
    pub total_pages: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub page_info: PageInfo,
}

/// Cuts one page out of `items`, which must already be filtered and ordered.
pub fn paginate<T>(items: Vec<T>, pagination: Pagination) -> PaginatedResponse<T> {
    let page = pagination.page.max(1);
    let page_size = pagination.page_size.max(1) as usize;
    let total_pages = u32::try_from(items.len().div_ceil(page_size)).unwrap_or(u32::MAX);
    // Saturates so an absurd page just lands past the end.
    let offset = (page as usize - 1).saturating_mul(page_size);

    let data = items.into_iter().skip(offset).take(page_size).collect();

    PaginatedResponse {
        data,
        page_info: PageInfo {
            current_page: page,
            total_pages,
            has_next: page < total_pages,
            has_previous: page > 1,
        },
    }
}

/// Storage for threads and steps.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn upsert_step(&self, step: &Step) -> Result<()>;

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>>;

    /// Fails with not-found when the step does not exist.
    async fn delete_step(&self, step_id: &str) -> Result<()>;

    async fn steps_for_thread(&self, thread_id: &str) -> Result<Vec<Step>>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;

    async fn upsert_thread(&self, thread: &Thread) -> Result<()>;

    /// Removes every step of `thread_id`, whether or not the thread document exists.
    async fn delete_steps_for_thread(&self, thread_id: &str) -> Result<usize>;

    /// Deletes the thread and its steps. Steps are removed even when the
    /// thread document is missing, which then fails with not-found.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Threads matching `filter`, newest first.
    async fn find_threads(&self, filter: &ThreadFilter) -> Result<Vec<Thread>>;

    /// The first thread holding feedback for `message_id`.
    async fn find_thread_with_feedback(&self, message_id: &str) -> Result<Option<Thread>>;
}
