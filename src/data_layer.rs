//! Threads, steps and feedback behind the chat UI.
//!
//! Feedback is stored twice: on the thread document for the UI, and on the
//! matching turn of the conversation log so it sits next to the answer it
//! rates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::constants::{AUDIO_RUN_STEP, MESSAGE_RUN_STEP};
use crate::error::{BuddyError, Result};
use crate::store::{
    paginate, ConversationStore, FeedbackRecord, PaginatedResponse, Pagination, Step, Thread,
    ThreadFilter, ThreadStore,
};

/// Feedback sent by the UI for an answer.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    /// Id of the rated step, usually the answer message
    pub for_id: String,
    /// 1 for thumbs up, 0 for thumbs down
    pub value: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// The user message a feedback entry refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessageRef {
    pub id: String,
    pub thread_id: String,
    pub input: String,
}

/// Resolves the conversation-log message id from a run step.
pub fn find_user_message(step: &Step) -> Result<UserMessageRef> {
    let id = match step.name.as_str() {
        AUDIO_RUN_STEP => step.id.clone(),
        MESSAGE_RUN_STEP => step.parent_id.clone().unwrap_or_default(),
        other => {
            return Err(BuddyError::Validation(format!("unknown step type: {}", other)));
        }
    };
    if id.is_empty() || step.thread_id.is_empty() {
        return Err(BuddyError::Validation(
            "missing required message fields".to_string(),
        ));
    }
    Ok(UserMessageRef {
        id,
        thread_id: step.thread_id.clone(),
        input: step.input.clone(),
    })
}

/// Thread plus its ordered steps, as returned to the UI.
#[derive(Serialize, Debug, Clone)]
pub struct ThreadWithSteps {
    #[serde(flatten)]
    pub thread: Thread,
    pub steps: Vec<Step>,
}

#[derive(Clone)]
pub struct DataLayer {
    threads: Arc<dyn ThreadStore>,
    conversations: Arc<dyn ConversationStore>,
}

impl DataLayer {
    pub fn new(threads: Arc<dyn ThreadStore>, conversations: Arc<dyn ConversationStore>) -> Self {
        Self {
            threads,
            conversations,
        }
    }

    pub async fn create_step(&self, step: &Step) -> Result<()> {
        self.threads.upsert_step(step).await?;
        info!("Step created successfully: {}", step.id);
        Ok(())
    }

    pub async fn update_step(&self, step: &Step) -> Result<()> {
        self.threads.upsert_step(step).await?;
        info!("Step updated successfully: {}", step.id);
        Ok(())
    }

    pub async fn delete_step(&self, step_id: &str) -> Result<()> {
        self.threads.delete_step(step_id).await?;
        info!("Step deleted successfully: {}", step_id);
        Ok(())
    }

    pub async fn get_step(&self, step_id: &str) -> Result<Option<Step>> {
        self.threads.get_step(step_id).await
    }

    /// Answers hang off their run step; follow the parent link once.
    async fn run_step_for(&self, step_id: &str) -> Result<Step> {
        let step = self
            .get_step(step_id)
            .await?
            .ok_or_else(|| BuddyError::not_found(format!("step {}", step_id)))?;
        if !step.is_message() {
            return Ok(step);
        }
        match &step.parent_id {
            Some(parent_id) => self
                .get_step(parent_id)
                .await?
                .ok_or_else(|| BuddyError::not_found(format!("step {}", parent_id))),
            None => Ok(step),
        }
    }

    /// Records feedback and returns the id of the rated user message.
    pub async fn upsert_feedback(&self, feedback: &Feedback) -> Result<String> {
        info!("Processing feedback for step: {}", feedback.for_id);
        let step = self.run_step_for(&feedback.for_id).await?;
        let message = find_user_message(&step)?;

        let mut thread = match self.threads.get_thread(&message.thread_id).await? {
            Some(thread) => thread,
            None => {
                info!("Creating new thread: {}", message.thread_id);
                Thread::new(message.thread_id.clone())
            }
        };
        thread.feedback.push(FeedbackRecord {
            message_id: message.id.clone(),
            user_message: message.input.clone(),
            value: feedback.value,
            comment: feedback.comment.clone(),
            timestamp: Utc::now(),
        });
        self.threads.upsert_thread(&thread).await?;

        let vote = if feedback.value == 0 { -1 } else { feedback.value };
        if let Err(e) = self
            .conversations
            .upsert_feedback(
                &message.thread_id,
                &message.id,
                vote,
                feedback.comment.as_deref().unwrap_or(""),
            )
            .await
        {
            // The thread copy is already stored.
            error!("Failed to store feedback in conversation log: {}", e);
        }

        info!("Feedback successfully processed for message: {}", message.id);
        Ok(message.id)
    }

    /// Removes feedback for `message_id`; `false` when no thread holds any.
    pub async fn delete_feedback(&self, message_id: &str) -> Result<bool> {
        let Some(mut thread) = self.threads.find_thread_with_feedback(message_id).await? else {
            return Ok(false);
        };
        thread.feedback.retain(|f| f.message_id != message_id);
        self.threads.upsert_thread(&thread).await?;

        if let Err(e) = self
            .conversations
            .reset_feedback(&thread.id, message_id)
            .await
        {
            error!("Failed to reset feedback in conversation log: {}", e);
        }
        info!("Feedback removed for message {} in thread {}", message_id, thread.id);
        Ok(true)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let thread = self.threads.get_thread(thread_id).await?;
        if thread.is_none() {
            warn!("Thread not found: {}", thread_id);
        }
        Ok(thread)
    }

    pub async fn get_thread_with_steps(&self, thread_id: &str) -> Result<ThreadWithSteps> {
        let thread = self
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| BuddyError::not_found(format!("thread {}", thread_id)))?;
        let steps = self.threads.steps_for_thread(thread_id).await?;
        Ok(ThreadWithSteps { thread, steps })
    }

    pub async fn steps_for_thread(&self, thread_id: &str) -> Result<Vec<Step>> {
        self.threads.steps_for_thread(thread_id).await
    }

    pub async fn get_thread_author(&self, thread_id: &str) -> Result<Option<String>> {
        let thread = self
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| BuddyError::not_found(format!("thread {}", thread_id)))?;
        Ok(thread.user_id)
    }

    /// Sets the given fields, creating the thread when it does not exist yet.
    pub async fn update_thread(
        &self,
        thread_id: &str,
        name: Option<String>,
        user_id: Option<String>,
        metadata: Option<HashMap<String, serde_json::Value>>,
        tags: Option<Vec<String>>,
    ) -> Result<Thread> {
        let mut thread = self
            .threads
            .get_thread(thread_id)
            .await?
            .unwrap_or_else(|| Thread::new(thread_id));
        if let Some(name) = name {
            thread.name = Some(name);
        }
        if let Some(user_id) = user_id {
            thread.user_id = Some(user_id);
        }
        if let Some(metadata) = metadata {
            thread.metadata = metadata;
        }
        if let Some(tags) = tags {
            thread.tags = tags;
        }
        self.threads.upsert_thread(&thread).await?;
        info!("Thread updated successfully: {}", thread_id);
        Ok(thread)
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        info!("Deleting thread: {}", thread_id);
        self.threads.delete_thread(thread_id).await?;
        info!("Thread and associated data deleted: {}", thread_id);
        Ok(())
    }

    pub async fn list_threads(
        &self,
        pagination: Pagination,
        filter: &ThreadFilter,
    ) -> Result<PaginatedResponse<Thread>> {
        if pagination.page == 0 || pagination.page_size == 0 {
            return Err(BuddyError::Validation(
                "page and page_size must be at least 1".to_string(),
            ));
        }
        let threads = self.threads.find_threads(filter).await?;
        let response = paginate(threads, pagination);
        info!("Retrieved {} threads", response.data.len());
        Ok(response)
    }
}
