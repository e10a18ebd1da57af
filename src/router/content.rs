//! Text extraction from inbound messages.

use crate::client::{InboundMessage, MessageKind};

/// Text to log for a message. Media kinds reduce to their caption or a
/// placeholder; unknown kinds pass their body through (possibly empty).
pub fn extract_text(msg: &InboundMessage) -> String {
    let caption = [msg.caption.as_deref(), Some(msg.body.as_str())]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|c| !c.is_empty());

    match msg.kind {
        MessageKind::Text | MessageKind::Other => msg.body.clone(),
        MessageKind::Image => caption.unwrap_or("[Image]").to_string(),
        MessageKind::Video => caption.unwrap_or("[Video]").to_string(),
        MessageKind::Document => caption.unwrap_or("[Document]").to_string(),
        MessageKind::Audio => "[Audio]".to_string(),
        MessageKind::Voice => "[Voice message]".to_string(),
        MessageKind::Sticker => "[Sticker]".to_string(),
        MessageKind::Location => match caption {
            Some(description) => format!("[Location] {}", description),
            None => "[Location]".to_string(),
        },
        MessageKind::Contact => "[Contact card]".to_string(),
    }
}

/// Sender name: push name, then profile name, then the given fallback.
pub fn display_name(msg: &InboundMessage, fallback: &str) -> String {
    [msg.push_name.as_deref(), msg.profile_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|n| !n.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
