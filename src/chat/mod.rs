// Chat handling for the web UI and the one-shot CLI query.

pub mod answer;
pub mod events;
pub mod session;

pub use answer::generate_answer;
pub use events::{ClientEvent, ServerEvent, StepStatus};
pub use session::ChatSession;

use crate::error::Result;
use crate::serving::{ChatMessage, ServingClient};

/// Sends a single message to the model without storing anything.
pub async fn ask_once(serving: &ServingClient, message: &str) -> Result<String> {
    let answer = serving.predict(&[ChatMessage::user(message)]).await?;
    Ok(answer.content)
}
