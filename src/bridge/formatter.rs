//! Rendering of relayed messages for each destination.
//!
//! Format strings support the placeholders `%time`, `%user`, `%message` and
//! `%endpoint`.

use chrono::Local;

use crate::bridge::router::Route;
use crate::common::messages::{Outgoing, RelayMessage};
use crate::common::types::{Role, Site, SYSTEM_AUTHOR};
use crate::config::types::FormatsConfig;

/// Discord's per-message limit.
pub const PLATFORM_MAX_LEN: usize = 2000;

/// Game chat line limit.
pub const GAME_MAX_LEN: usize = 256;

/// Message formatter that substitutes placeholders in a format string.
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    format: String,
}

impl MessageFormatter {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }

    pub fn format(&self, ctx: &FormatContext) -> String {
        self.format
            .replace("%time", &get_time())
            .replace("%user", &ctx.user)
            .replace("%endpoint", &ctx.endpoint)
            .replace("%message", &ctx.message)
    }
}

/// Values substituted into a format string.
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub user: String,
    pub message: String,
    /// Origin endpoint display name.
    pub endpoint: String,
}

impl FormatContext {
    pub fn new(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            message: message.into(),
            endpoint: String::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Current time as HH:MM:SS.
fn get_time() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Escape Discord markdown special characters.
pub fn escape_discord_markdown(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for ch in message.chars() {
        if matches!(ch, '\\' | '`' | '*' | '_' | '~' | '|' | '>') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Last UTF-8 char boundary at or before `byte_index`.
fn floor_char_boundary(s: &str, byte_index: usize) -> usize {
    if byte_index >= s.len() {
        return s.len();
    }
    let mut i = byte_index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split a message into chunks of at most `max_len` bytes.
///
/// Prefers word boundaries and never splits inside a UTF-8 character.
pub fn split_message(message: &str, max_len: usize) -> Vec<String> {
    if message.len() <= max_len {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        remaining = remaining.trim_start();
        if remaining.is_empty() {
            break;
        }
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let split_at = floor_char_boundary(remaining, max_len);
        if split_at == 0 {
            // Limit below one character: emit it whole
            let first_end = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
            chunks.push(remaining[..first_end].to_string());
            remaining = &remaining[first_end..];
            continue;
        }

        let chunk = &remaining[..split_at];
        match chunk.rfind(' ') {
            Some(space) if space > 0 => {
                chunks.push(remaining[..space].to_string());
                remaining = &remaining[space + 1..];
            }
            _ => {
                chunks.push(chunk.to_string());
                remaining = &remaining[split_at..];
            }
        }
    }

    chunks
}

/// Turns an accepted message into the text each destination receives.
#[derive(Debug, Clone)]
pub struct Renderer {
    role: Role,
    to_platform: MessageFormatter,
    to_platform_system: MessageFormatter,
    tag: MessageFormatter,
    to_game: MessageFormatter,
    escape_markdown: bool,
}

impl Renderer {
    pub fn new(role: Role, formats: &FormatsConfig) -> Self {
        Self {
            role,
            to_platform: MessageFormatter::new(&formats.to_platform),
            to_platform_system: MessageFormatter::new(&formats.to_platform_system),
            tag: MessageFormatter::new(&formats.tag),
            to_game: MessageFormatter::new(&formats.to_game),
            escape_markdown: formats.escape_markdown,
        }
    }

    /// Render `message` for one destination of `route`.
    pub fn render(&self, route: &Route, message: &RelayMessage, destination: &Site) -> Vec<Outgoing> {
        let author = message.author();
        let content = message.content();

        let (text, max_len) = match (self.role, destination) {
            (_, Site::Channel(_)) => {
                let body = if author == SYSTEM_AUTHOR {
                    self.to_platform_system.format(&FormatContext::new(author, content))
                } else {
                    let content = if self.escape_markdown {
                        escape_discord_markdown(content)
                    } else {
                        content.to_string()
                    };
                    self.to_platform.format(&FormatContext::new(author, content))
                };
                let text = match &route.tag {
                    Some(name) => {
                        let prefix = self.tag.format(&FormatContext::default().with_endpoint(name));
                        format!("{}{}", prefix, body)
                    }
                    None => body,
                };
                (text, PLATFORM_MAX_LEN)
            }
            (Role::Platform, Site::Endpoint(_)) => (
                self.to_game.format(&FormatContext::new(author, content)),
                GAME_MAX_LEN,
            ),
            // The platform side renders; game-bound text is already final
            (Role::Game, Site::Endpoint(_)) => (content.to_string(), usize::MAX),
            (_, Site::Game) => (content.to_string(), GAME_MAX_LEN),
        };

        let origin_id = message.origin_id().map(str::to_string);
        split_message(&text, max_len)
            .into_iter()
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| Outgoing::new(author, chunk).with_origin_id(origin_id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ChannelId;
    use tokio::time::Instant;

    fn msg(author: &str, content: &str) -> RelayMessage {
        RelayMessage::new(Site::Endpoint("a".into()), author, content, None, Instant::now())
    }

    fn texts(items: Vec<Outgoing>) -> Vec<String> {
        items.into_iter().map(|o| o.text).collect()
    }

    #[test]
    fn test_basic_format() {
        let formatter = MessageFormatter::new("[%user]: %message");
        let ctx = FormatContext::new("Player", "Hello world!");
        assert_eq!(formatter.format(&ctx), "[Player]: Hello world!");
    }

    #[test]
    fn test_format_with_time() {
        let formatter = MessageFormatter::new("[%time] %user: %message");
        let result = formatter.format(&FormatContext::new("Player", "Test"));
        assert!(result.ends_with("] Player: Test"));
        assert_eq!(result.len(), "[00:00:00] Player: Test".len());
    }

    #[test]
    fn test_message_placeholders_are_not_reexpanded() {
        let formatter = MessageFormatter::new("%user: %message");
        let ctx = FormatContext::new("Steve", "say %user");
        assert_eq!(formatter.format(&ctx), "Steve: say %user");
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_discord_markdown("**bold** _x_"), r"\*\*bold\*\* \_x\_");
    }

    #[test]
    fn test_split_message_short() {
        assert_eq!(split_message("Hello world", 50), vec!["Hello world"]);
    }

    #[test]
    fn test_split_message_on_space() {
        assert_eq!(split_message("Hello beautiful world", 15), vec!["Hello", "beautiful world"]);
    }

    #[test]
    fn test_split_message_no_space() {
        assert_eq!(split_message("HelloBeautifulWorld", 10), vec!["HelloBeaut", "ifulWorld"]);
    }

    #[test]
    fn test_split_message_multibyte() {
        // 'é' is two bytes; a limit of 4 lands inside it
        let chunks = split_message("café rest", 4);
        assert_eq!(chunks, vec!["caf", "é", "rest"]);
    }

    #[test]
    fn test_render_to_channel_tagged() {
        let renderer = Renderer::new(Role::Platform, &FormatsConfig::default());
        let route = Route {
            destinations: vec![Site::Channel(ChannelId(1))],
            tag: Some("Survival".to_string()),
        };

        let out = renderer.render(&route, &msg("Steve", "hi *there*"), &Site::Channel(ChannelId(1)));
        assert_eq!(texts(out), vec![r"[Survival] Steve: hi \*there\*"]);
    }

    #[test]
    fn test_render_system_text_unprefixed_by_author() {
        let renderer = Renderer::new(Role::Platform, &FormatsConfig::default());
        let route = Route {
            destinations: vec![Site::Channel(ChannelId(1))],
            tag: Some("Survival".to_string()),
        };

        let out = renderer.render(&route, &msg(SYSTEM_AUTHOR, "Steve joined the game"), &Site::Channel(ChannelId(1)));
        assert_eq!(texts(out), vec!["[Survival] Steve joined the game"]);
    }

    #[test]
    fn test_render_to_game_endpoint_is_untagged() {
        let renderer = Renderer::new(Role::Platform, &FormatsConfig::default());
        let route = Route {
            destinations: vec![Site::Endpoint("b".into())],
            tag: Some("Survival".to_string()),
        };

        let out = renderer.render(&route, &msg("Alex", "hello"), &Site::Endpoint("b".into()));
        assert_eq!(out, vec![Outgoing::new("Alex", "[Alex] hello")]);
    }

    #[test]
    fn test_render_game_role_is_verbatim() {
        let renderer = Renderer::new(Role::Game, &FormatsConfig::default());
        let route = Route {
            destinations: vec![Site::Game],
            tag: None,
        };

        let out = renderer.render(&route, &msg("Alex", "[Alex] hello"), &Site::Game);
        assert_eq!(texts(out), vec!["[Alex] hello"]);
    }

    #[test]
    fn test_render_splits_long_platform_text() {
        let renderer = Renderer::new(Role::Platform, &FormatsConfig::default());
        let route = Route::default();
        let long = "word ".repeat(500);

        let out = renderer.render(&route, &msg("Steve", &long), &Site::Channel(ChannelId(1)));
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.text.len() <= PLATFORM_MAX_LEN));
    }
}
