//! Game chat events and their translation into relay observations.

use crate::common::messages::InboundEvent;
use crate::common::types::{Site, SYSTEM_AUTHOR};

/// What the game reports to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// The local player submitted a chat line.
    OutgoingChat { text: String },
    /// A line appeared in the chat log. Overlay text (action bar, titles) is not chat.
    Displayed { text: String, is_overlay: bool },
}

/// Remove `§x` formatting codes.
pub fn strip_formatting(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '§' {
            chars.next();
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a displayed chat line `<Name> text` into author and content.
///
/// Lines without the player prefix are system text.
pub fn split_author(line: &str) -> (Option<&str>, &str) {
    if let Some(rest) = line.strip_prefix('<') {
        if let Some((name, content)) = rest.split_once('>') {
            if !name.is_empty() && !name.contains(char::is_whitespace) {
                return (Some(name), content.trim_start());
            }
        }
    }
    (None, line)
}

/// Translate a game event. `identity` is the local player's name.
pub fn to_inbound(event: GameEvent, identity: &str) -> Option<InboundEvent> {
    match event {
        GameEvent::OutgoingChat { text } => {
            let text = strip_formatting(text.trim());
            // Commands are not chat
            if text.is_empty() || text.starts_with('/') {
                return None;
            }
            Some(InboundEvent::new(Site::Game, identity, text))
        }
        GameEvent::Displayed {
            is_overlay: true, ..
        } => None,
        GameEvent::Displayed { text, .. } => {
            let text = strip_formatting(&text);
            let (author, content) = split_author(text.trim());
            if content.trim().is_empty() {
                return None;
            }
            // Own lines were already reported as outgoing chat
            let own = author.is_some_and(|a| a == identity);
            Some(
                InboundEvent::new(Site::Game, author.unwrap_or(SYSTEM_AUTHOR), content)
                    .from_self(own),
            )
        }
    }
}
