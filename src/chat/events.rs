use serde::{Deserialize, Serialize};

use crate::data_layer::Feedback;

/// JSON frames the browser sends over the chat socket.
///
/// Audio chunks travel separately as binary frames of PCM16LE samples.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Message {
        /// Client-side id of the user message, generated when absent
        #[serde(default)]
        id: Option<String>,
        content: String,
    },
    AudioStart,
    AudioEnd,
    Stop,
    Resume {
        thread_id: String,
    },
    Settings {
        settings: serde_json::Value,
    },
    Feedback {
        #[serde(rename = "forId")]
        for_id: String,
        value: i64,
        #[serde(default)]
        comment: Option<String>,
    },
}

impl ClientEvent {
    pub fn feedback(&self) -> Option<Feedback> {
        match self {
            Self::Feedback { for_id, value, comment } => Some(Feedback {
                for_id: for_id.clone(),
                value: *value,
                comment: comment.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Finished,
    Failed,
}

/// JSON frames sent to the browser.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Session {
        session_id: String,
        thread_id: String,
    },
    Message {
        id: String,
        thread_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        author: String,
        content: String,
    },
    Step {
        id: String,
        parent_id: String,
        name: String,
        status: StepStatus,
    },
    Settings {
        language: String,
        languages: Vec<String>,
    },
    FeedbackSaved {
        message_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// Text content of a `Message` event.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Message { content, .. } => Some(content),
            _ => None,
        }
    }
}
