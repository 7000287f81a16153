//! Session title and preview derivation
//!
//! Titles are derived from the first message of a conversation; previews
//! are the truncated content of the latest message.

use crate::protocol::{render::render_elements, InteractiveContent};

/// Maximum characters of an auto-generated session title (ellipsis included)
pub const MAX_TITLE_CHARS: usize = 50;

/// Maximum characters kept in a session's last-message preview
pub const MAX_PREVIEW_CHARS: usize = 100;

const ELLIPSIS: &str = "...";

/// Title used when the first message carries no usable text
pub const DEFAULT_TITLE: &str = "Nova conversa";

/// Derive a session title from the text of the message that opened it.
///
/// Whitespace runs collapse to single spaces. Text longer than
/// [`MAX_TITLE_CHARS`] is cut at the last word boundary that leaves room for
/// the ellipsis; a single overlong word is cut mid-word.
pub fn title_from_message(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    if normalized.chars().count() <= MAX_TITLE_CHARS {
        return normalized;
    }

    let budget = MAX_TITLE_CHARS - ELLIPSIS.len();
    let cut: String = normalized.chars().take(budget).collect();

    // A space right after the cut means the last word fits whole
    let ends_on_word = normalized.chars().nth(budget) == Some(' ');

    // Prefer a word boundary, unless that would drop everything
    let head = match cut.rfind(' ') {
        Some(pos) if pos > 0 && !ends_on_word => cut.split_at(pos).0.trim_end().to_string(),
        _ => cut,
    };

    format!("{head}{ELLIPSIS}")
}

/// Truncate message content for the session list preview
pub fn message_preview(content: &str) -> String {
    content.chars().take(MAX_PREVIEW_CHARS).collect()
}

/// Preview of a stored message, falling back to its rendered elements when
/// the text is blank. `None` keeps the previous preview.
pub fn session_preview(content: &str, interactive: &InteractiveContent) -> Option<String> {
    let source = if content.trim().is_empty() {
        render_elements(interactive)
    } else {
        content.to_string()
    };
    if source.trim().is_empty() {
        None
    } else {
        Some(message_preview(&source))
    }
}
