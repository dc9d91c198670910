use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Conversation, ConversationStore, Step, Thread, ThreadFilter, ThreadStore, Turn};
use crate::error::{BuddyError, Result};

/// Process-local conversation log, used when Cosmos DB is not configured.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, chat_id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(chat_id.to_string())
            .or_insert_with(|| Conversation::new(chat_id));
        Ok(())
    }

    async fn get_conversation(&self, chat_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(chat_id).cloned())
    }

    async fn append_turn(&self, chat_id: &str, turn: Turn) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(chat_id)
            .ok_or_else(|| BuddyError::not_found(format!("conversation {}", chat_id)))?;
        conversation.conversation.push(turn);
        Ok(())
    }

    async fn upsert_feedback(
        &self,
        chat_id: &str,
        message_id: &str,
        vote: i64,
        text: &str,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(chat_id)
            .ok_or_else(|| BuddyError::not_found(format!("conversation {}", chat_id)))?;
        let turn = conversation.turn_mut(message_id).ok_or_else(|| {
            BuddyError::not_found(format!("message {} in conversation {}", message_id, chat_id))
        })?;
        turn.feedback_vote = vote;
        turn.feedback_text = text.to_string();
        Ok(())
    }
}

/// Process-local threads and steps.
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: RwLock<HashMap<String, Thread>>,
    steps: RwLock<HashMap<String, Step>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn upsert_step(&self, step: &Step) -> Result<()> {
        self.steps
            .write()
            .await
            .insert(step.id.clone(), step.clone());
        Ok(())
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>> {
        Ok(self.steps.read().await.get(step_id).cloned())
    }

    async fn delete_step(&self, step_id: &str) -> Result<()> {
        self.steps
            .write()
            .await
            .remove(step_id)
            .map(|_| ())
            .ok_or_else(|| BuddyError::not_found(format!("step {}", step_id)))
    }

    async fn steps_for_thread(&self, thread_id: &str) -> Result<Vec<Step>> {
        let mut steps: Vec<Step> = self
            .steps
            .read()
            .await
            .values()
            .filter(|s| s.thread_id == thread_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        self.threads
            .write()
            .await
            .insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn delete_steps_for_thread(&self, thread_id: &str) -> Result<usize> {
        let mut steps = self.steps.write().await;
        let before = steps.len();
        steps.retain(|_, step| step.thread_id != thread_id);
        Ok(before - steps.len())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.delete_steps_for_thread(thread_id).await?;
        self.threads
            .write()
            .await
            .remove(thread_id)
            .map(|_| ())
            .ok_or_else(|| BuddyError::not_found(format!("thread {}", thread_id)))
    }

    async fn find_threads(&self, filter: &ThreadFilter) -> Result<Vec<Thread>> {
        let mut threads: Vec<Thread> = self
            .threads
            .read()
            .await
            .values()
            .filter(|t| t.matches(filter))
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(threads)
    }

    async fn find_thread_with_feedback(&self, message_id: &str) -> Result<Option<Thread>> {
        Ok(self
            .threads
            .read()
            .await
            .values()
            .find(|t| t.feedback.iter().any(|f| f.message_id == message_id))
            .cloned())
    }
}
