use chrono::Utc;
use tracing::{error, info, instrument};

use crate::error::Result;
use crate::serving::ChatMessage;
use crate::services::Services;
use crate::store::Turn;

/// Answers `query` within chat `chat_id` and records the turn.
///
/// The model sees the full stored history plus the new query. The turn is
/// stored under `message_id`, which is what feedback later refers to.
#[instrument(skip(services, query))]
pub async fn generate_answer(
    services: &Services,
    chat_id: &str,
    message_id: &str,
    query: &str,
) -> Result<String> {
    let mut history = services.conversations.get_chat_history(chat_id).await?;
    history.push(ChatMessage::user(query));

    let answer = services.serving.predict(&history).await.map_err(|e| {
        error!("Error in generate_answer: {}", e);
        e
    })?;

    let outputs = answer.custom_outputs;
    let turn = Turn {
        databricks_request_id: answer.request_id,
        message_id: message_id.to_string(),
        user_message: query.to_string(),
        rephrased_message: outputs.rephrased_query.unwrap_or_default(),
        check_query: outputs.check_query.unwrap_or_default(),
        comparison_details: outputs.comparison_details,
        ai_answer: answer.content.clone(),
        context: outputs.context,
        feedback_vote: 0,
        feedback_text: String::new(),
        timestamp: Utc::now(),
    };
    services.conversations.append_turn(chat_id, turn).await?;
    info!("Stored answer for message {} in chat {}", message_id, chat_id);

    Ok(answer.content)
}
