use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::answer::generate_answer;
use super::events::{ClientEvent, ServerEvent, StepStatus};
use crate::audio::AudioBuffer;
use crate::constants::{
    ANSWER_FAILED, ANSWER_STEP_NAME, AUDIO_FAILED, AUDIO_RUN_STEP, MESSAGE_RUN_STEP, NO_AUDIO,
    RESUME_FAILED, SETTINGS_FAILED, SETTINGS_UPDATED, SPEECH_STEP_NAME, TASK_STOPPED,
    USER_AUTHOR, WELCOME_BACK,
};
use crate::data_layer::Feedback;
use crate::error::{BuddyError, Result};
use crate::services::Services;
use crate::store::{Step, StepType};

/// Longest thread name derived from the first message.
const THREAD_NAME_CHARS: usize = 60;

/// State of one connected chat client.
pub struct ChatSession {
    services: Arc<Services>,
    outbox: mpsc::UnboundedSender<ServerEvent>,
    session_id: String,
    thread_id: String,
    thread_named: bool,
    audio: AudioBuffer,
    language: String,
    settings: HashMap<String, Value>,
    message_count: usize,
}

impl ChatSession {
    pub fn new(services: Arc<Services>, outbox: mpsc::UnboundedSender<ServerEvent>) -> Self {
        let language = services.app.language.clone();
        Self {
            services,
            outbox,
            session_id: Uuid::new_v4().to_string(),
            thread_id: Uuid::new_v4().to_string(),
            thread_named: false,
            audio: AudioBuffer::new(),
            language,
            settings: HashMap::new(),
            message_count: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(&format!("setting_{}", key))
    }

    pub fn is_recording(&self) -> bool {
        self.audio.is_active()
    }

    /// Tells the client a frame could not be handled.
    pub fn report_error(&self, message: impl Into<String>) {
        self.emit(ServerEvent::Error {
            message: message.into(),
        });
    }

    fn emit(&self, event: ServerEvent) {
        if self.outbox.send(event).is_err() {
            debug!("Dropping event for closed session {}", self.session_id);
        }
    }

    async fn persist(&self, step: &Step) {
        if let Err(e) = self.services.data_layer.create_step(step).await {
            error!("Failed to store step {}: {}", step.id, e);
        }
    }

    async fn persist_update(&self, step: &Step) {
        if let Err(e) = self.services.data_layer.update_step(step).await {
            error!("Failed to update step {}: {}", step.id, e);
        }
    }

    /// Stores and sends a bot message, returning its step id.
    async fn send_bot(&self, parent_id: Option<String>, content: impl Into<String>) -> String {
        let mut step = Step::new(
            self.thread_id.clone(),
            parent_id,
            self.services.app.name.clone(),
            StepType::AssistantMessage,
        );
        step.output = content.into();
        self.persist(&step).await;
        self.emit(ServerEvent::Message {
            id: step.id.clone(),
            thread_id: step.thread_id,
            parent_id: step.parent_id,
            author: step.name,
            content: step.output,
        });
        step.id
    }

    /// Sends the welcome message and the selectable settings.
    pub async fn start(&mut self) {
        info!("Chat session started: {}", self.session_id);
        self.emit(ServerEvent::Session {
            session_id: self.session_id.clone(),
            thread_id: self.thread_id.clone(),
        });
        // The welcome is not stored so unused sessions leave no thread behind.
        let welcome = self.services.app.welcome_message.clone();
        self.emit(ServerEvent::Message {
            id: Uuid::new_v4().to_string(),
            thread_id: self.thread_id.clone(),
            parent_id: None,
            author: self.services.app.name.clone(),
            content: welcome,
        });
        if !self.services.app.languages.is_empty() {
            self.emit(ServerEvent::Settings {
                language: self.language.clone(),
                languages: self.services.app.languages.clone(),
            });
        }
    }

    async fn name_thread(&mut self, first_message: &str) {
        if self.thread_named {
            return;
        }
        let name: String = first_message.chars().take(THREAD_NAME_CHARS).collect();
        match self
            .services
            .data_layer
            .update_thread(&self.thread_id, Some(name), None, None, None)
            .await
        {
            Ok(_) => self.thread_named = true,
            Err(e) => error!("Failed to name thread {}: {}", self.thread_id, e),
        }
    }

    /// Runs the "Answer generator..." tool step under `run_id`.
    async fn answer(&self, run_id: &str, message_id: &str, query: &str) -> Result<String> {
        let mut tool = Step::new(
            self.thread_id.clone(),
            Some(run_id.to_string()),
            ANSWER_STEP_NAME,
            StepType::Tool,
        );
        tool.input = query.to_string();
        self.persist(&tool).await;
        self.emit_step(&tool, StepStatus::Started);

        let result = generate_answer(&self.services, &self.thread_id, message_id, query).await;
        match &result {
            Ok(answer) => {
                tool.output = answer.clone();
                self.emit_step(&tool, StepStatus::Finished);
            }
            Err(e) => {
                tool.output = e.to_string();
                self.emit_step(&tool, StepStatus::Failed);
            }
        }
        self.persist_update(&tool).await;
        result
    }

    fn emit_step(&self, step: &Step, status: StepStatus) {
        self.emit(ServerEvent::Step {
            id: step.id.clone(),
            parent_id: step.parent_id.clone().unwrap_or_default(),
            name: step.name.clone(),
            status,
        });
    }

    /// Shows the answer in the session language when it differs from the base one.
    async fn localize(&self, answer: String) -> String {
        if self.language == self.services.app.language {
            return answer;
        }
        let Some(translator) = &self.services.translator else {
            return answer;
        };
        match translator
            .translate_to(&answer, &self.language, &self.services.app.language)
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                warn!("Showing untranslated answer, translation to {} failed: {}", self.language, e);
                answer
            }
        }
    }

    pub async fn on_message(&mut self, id: Option<String>, content: String) {
        let mut user = Step::new(self.thread_id.clone(), None, USER_AUTHOR, StepType::UserMessage);
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            // Step ids double as document ids and URL segments.
            match Uuid::parse_str(&id) {
                Ok(uuid) => user.id = uuid.to_string(),
                Err(_) => warn!("Ignoring malformed client message id {:?}", id),
            }
        }
        user.input = content.clone();
        info!("Processing message: msg_id={}, chat_id={}", user.id, self.thread_id);

        // Record the user message and its run step before answering
        self.message_count += 1;
        self.name_thread(&content).await;
        self.persist(&user).await;

        let mut run = Step::new(
            self.thread_id.clone(),
            Some(user.id.clone()),
            MESSAGE_RUN_STEP,
            StepType::Run,
        );
        run.input = content.clone();
        self.persist(&run).await;

        match self.answer(&run.id, &user.id, &content).await {
            Ok(answer) => {
                // Store the base-language answer, show the localized one
                run.output = answer.clone();
                self.persist_update(&run).await;
                let shown = self.localize(answer).await;
                self.send_bot(Some(run.id.clone()), shown).await;
                info!("Response sent for message: {}", user.id);
            }
            Err(e) => {
                error!("Error processing message {}: {}", user.id, e);
                self.send_bot(Some(run.id.clone()), ANSWER_FAILED).await;
            }
        }
    }

    pub fn on_audio_start(&mut self) {
        self.audio.start();
        info!("Audio recording session initialized");
    }

    pub fn on_audio_chunk(&mut self, chunk: &[u8]) {
        if !self.audio.is_active() {
            error!("Error processing audio chunk: audio chunks storage not initialized");
            return;
        }
        self.audio.push(chunk);
    }

    pub async fn on_audio_end(&mut self) {
        let Some(wav) = self.audio.take_wav() else {
            self.send_bot(None, NO_AUDIO).await;
            return;
        };
        if let Err(e) = self.process_audio(wav).await {
            error!("Audio processing failed: {}", e);
            self.send_bot(None, AUDIO_FAILED).await;
        }
    }

    /// Transcribes the recording, then answers it like a typed message.
    async fn process_audio(&mut self, wav: Vec<u8>) -> Result<()> {
        let services = self.services.clone();
        let speech = services
            .speech
            .as_ref()
            .ok_or(BuddyError::Disabled("speech to text"))?;

        let mut run = Step::new(self.thread_id.clone(), None, AUDIO_RUN_STEP, StepType::Run);
        self.persist(&run).await;

        let mut tool = Step::new(
            self.thread_id.clone(),
            Some(run.id.clone()),
            SPEECH_STEP_NAME,
            StepType::Tool,
        );
        self.persist(&tool).await;
        self.emit_step(&tool, StepStatus::Started);
        info!("Starting speech-to-text conversion");
        let transcription = match speech.transcribe(wav).await {
            Ok(text) => text,
            Err(e) => {
                tool.output = e.to_string();
                self.persist_update(&tool).await;
                self.emit_step(&tool, StepStatus::Failed);
                return Err(e);
            }
        };
        tool.output = transcription.clone();
        self.persist_update(&tool).await;
        self.emit_step(&tool, StepStatus::Finished);

        // Show the transcription as if the user had typed it
        run.input = transcription.clone();
        self.persist_update(&run).await;

        let mut user = Step::new(
            self.thread_id.clone(),
            Some(run.id.clone()),
            USER_AUTHOR,
            StepType::UserMessage,
        );
        user.input = transcription.clone();
        self.persist(&user).await;
        self.emit(ServerEvent::Message {
            id: user.id.clone(),
            thread_id: self.thread_id.clone(),
            parent_id: user.parent_id.clone(),
            author: USER_AUTHOR.to_string(),
            content: transcription.clone(),
        });

        self.message_count += 1;
        self.name_thread(&transcription).await;

        let answer = self.answer(&run.id, &run.id, &transcription).await?;
        run.output = answer.clone();
        self.persist_update(&run).await;
        let shown = self.localize(answer).await;
        self.send_bot(Some(run.id.clone()), shown).await;
        info!("Audio processing completed successfully");
        Ok(())
    }

    /// Called after an in-flight task was cancelled, or on a stop with nothing running.
    pub async fn on_stop(&mut self) {
        info!("Task interruption requested by user");
        if self.audio.is_active() || !self.audio.is_empty() {
            self.audio.clear();
            info!("Cleaned up audio session data");
        }
        self.send_bot(None, TASK_STOPPED).await;
    }

    pub async fn on_resume(&mut self, thread_id: String) {
        info!("Resuming chat session: {}", thread_id);
        let steps = match self.services.data_layer.get_thread(&thread_id).await {
            Ok(Some(_)) => self.services.data_layer.steps_for_thread(&thread_id).await,
            Ok(None) => Err(BuddyError::not_found(format!("thread {}", thread_id))),
            Err(e) => Err(e),
        };
        match steps {
            Ok(steps) => {
                if thread_id != self.thread_id {
                    self.discard_thread().await;
                }
                self.thread_id = thread_id;
                self.thread_named = true;
                self.message_count = steps.iter().filter(|s| s.is_message()).count();
                self.emit(ServerEvent::Session {
                    session_id: self.session_id.clone(),
                    thread_id: self.thread_id.clone(),
                });
                self.send_bot(None, WELCOME_BACK).await;
                info!("Successfully resumed session: {}", self.thread_id);
            }
            Err(e) => {
                error!("Error resuming chat session: {}", e);
                self.send_bot(None, RESUME_FAILED).await;
            }
        }
    }

    pub async fn on_settings(&mut self, settings: Value) {
        info!("Updating agent settings");
        let Value::Object(map) = settings else {
            error!("Error updating settings: invalid settings format");
            self.send_bot(None, SETTINGS_FAILED).await;
            return;
        };
        for (key, value) in map {
            if key == "language" {
                match value.as_str() {
                    Some(language) if !language.is_empty() => {
                        self.language = language.to_string();
                        info!("Language updated to: {}", self.language);
                    }
                    _ => warn!("Ignoring non-string language setting: {}", value),
                }
            } else {
                info!("Updated setting {}: {}", key, value);
                self.settings.insert(format!("setting_{}", key), value);
            }
        }
        self.send_bot(None, SETTINGS_UPDATED).await;
    }

    pub async fn on_feedback(&mut self, feedback: Feedback) {
        match self.services.data_layer.upsert_feedback(&feedback).await {
            Ok(message_id) => self.emit(ServerEvent::FeedbackSaved { message_id }),
            Err(e) => {
                error!("Failed to upsert feedback: {}", e);
                self.emit(ServerEvent::Error {
                    message: "Feedback could not be saved.".to_string(),
                });
            }
        }
    }

    /// Drops the session's current thread and its steps unless threads are retained.
    ///
    /// Steps can exist without a thread document (bot notices are stored
    /// before any message names the thread), so a missing thread still
    /// clears them.
    async fn discard_thread(&mut self) {
        if self.services.app.retain_threads {
            return;
        }
        match self.services.data_layer.delete_thread(&self.thread_id).await {
            Ok(()) => info!("Deleted thread and steps data for thread: {}", self.thread_id),
            Err(e) if e.is_not_found() => debug!("No stored thread for {}", self.thread_id),
            Err(e) => error!("Error during chat end cleanup: {}", e),
        }
        self.thread_named = false;
    }

    /// Dispatches one client event. `Stop` is normally intercepted by the socket loop.
    pub async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Message { id, content } => self.on_message(id, content).await,
            ClientEvent::AudioStart => self.on_audio_start(),
            ClientEvent::AudioEnd => self.on_audio_end().await,
            ClientEvent::Stop => self.on_stop().await,
            ClientEvent::Resume { thread_id } => self.on_resume(thread_id).await,
            ClientEvent::Settings { settings } => self.on_settings(settings).await,
            event @ ClientEvent::Feedback { .. } => {
                if let Some(feedback) = event.feedback() {
                    self.on_feedback(feedback).await;
                }
            }
        }
    }

    /// Cleans up when the client disconnects; the thread is deleted unless retained.
    pub async fn end(&mut self) {
        info!("Chat session ended: {}", self.session_id);
        self.audio.clear();
        if self.services.app.retain_threads {
            info!(
                "Session {} processed {} messages",
                self.session_id, self.message_count
            );
            return;
        }
        info!("Cleaning up session data for thread: {}", self.thread_id);
        self.discard_thread().await;
        info!(
            "Session {} processed {} messages",
            self.session_id, self.message_count
        );
    }
}
