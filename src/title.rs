use crate::content::message_texts;
use crate::error::ChatError;
use crate::models::{TitleResult, Turn};
use crate::state::AppState;
use uuid::Uuid;

// Number of most recent turns shown to the title model
const TITLE_CONTEXT_TURNS: i64 = 2;

/// Renders turns, oldest first, as the `<chat_history>` document the title prompt expects.
pub fn render_chat_history(turns: &[Turn]) -> String {
    let mut rendered = String::from("<chat_history>\n");
    for turn in turns {
        let text = message_texts(&turn.content).collect::<Vec<_>>().join("\n");
        rendered.push_str(&format!(
            "<message role=\"{}\">{}</message>\n",
            turn.role.as_str(),
            text
        ));
    }
    rendered.push_str("</chat_history>");
    rendered
}

/// Names a conversation from its latest exchange and stores the result on it.
pub async fn generate_title(state: &AppState, conversation_id: Uuid) -> Result<TitleResult, ChatError> {
    log::info!("Generating title for conversation {}", conversation_id);

    state
        .storage
        .get_conversation(conversation_id)
        .await
        .map_err(ChatError::Persistence)?
        .ok_or_else(|| ChatError::NotFound(format!("Conversation {} not found", conversation_id)))?;

    let snapshot = state.registry.snapshot();
    let config = snapshot
        .title_generation
        .as_ref()
        .ok_or_else(|| ChatError::NotFound("Title generation config not found".to_string()))?;
    let resolved = snapshot
        .resolve(&config.provider_id, &config.model_name)
        .map_err(|e| ChatError::NotFound(format!("Title generation model unavailable: {}", e)))?;

    let mut turns = state
        .storage
        .latest_turns(conversation_id, TITLE_CONTEXT_TURNS)
        .await
        .map_err(ChatError::Persistence)?;
    if turns.is_empty() {
        return Err(ChatError::InvalidInput(
            "Conversation has no messages to title".to_string(),
        ));
    }
    turns.reverse();

    let adapter = state.adapters.for_type(resolved.provider.provider_type);
    let title = adapter
        .generate_title(
            &resolved.provider,
            &resolved.model,
            &config.prompt,
            &render_chat_history(&turns),
        )
        .await?;

    state
        .storage
        .update_conversation_title(conversation_id, &title.title, &title.icon)
        .await
        .map_err(ChatError::Persistence)?;
    log::info!("Conversation {} titled '{}'", conversation_id, title.title);
    Ok(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentBlock;
    use crate::models::Role;

    #[test]
    fn renders_only_message_text() {
        let conversation_id = Uuid::new_v4();
        let user = Turn::user_prompt(Uuid::new_v4(), conversation_id, None, "2+2?");
        let mut assistant = Turn::user_prompt(Uuid::new_v4(), conversation_id, Some(user.id), "");
        assistant.role = Role::Assistant;
        assistant.content = vec![ContentBlock::reasoning("adding"), ContentBlock::message("4")];

        assert_eq!(
            render_chat_history(&[user, assistant]),
            "<chat_history>\n<message role=\"user\">2+2?</message>\n<message role=\"assistant\">4</message>\n</chat_history>"
        );
    }

    #[test]
    fn empty_history_renders_empty_document() {
        assert_eq!(render_chat_history(&[]), "<chat_history>\n</chat_history>");
    }
}
