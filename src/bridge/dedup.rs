//! Duplicate and echo suppression.
//!
//! Two tables guarded by one lock:
//! - `seen`: origin ids (or synthesized author/content/time-bucket keys)
//!   already routed, collapsing repeated deliveries of one source event.
//! - `echoes`: fingerprints of text the relay itself just dispatched toward a
//!   site, consumed by the first matching observation coming back from it.
//!
//! Both are scoped by [`Site`] and bounded; the oldest entries are evicted
//! first once a table is full.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::bridge::normalize::TextNormalizer;
use crate::common::messages::RelayMessage;
use crate::common::types::Site;
use crate::config::types::DedupConfig;

/// SHA-256 of normalized text.
pub type Fingerprint = [u8; 32];

fn fingerprint(parts: &[&str]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hasher.finalize().into()
}

/// Outcome of checking one inbound observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Genuine new content; route it.
    Accept,
    /// Same source event seen before within the window.
    Duplicate,
    /// The relay's own injection read back.
    Echo,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeenKey {
    Origin(Site, String),
    Synthesized(Site, Fingerprint, u64),
}

struct DedupState {
    /// Key -> expiry.
    seen: LruCache<SeenKey, Instant>,
    /// (scope, fingerprint) -> expiries of outstanding injections, oldest first.
    echoes: LruCache<(Site, Fingerprint), VecDeque<Instant>>,
}

/// The duplicate/echo engine. Shared by all relay workers.
pub struct DedupEngine {
    state: Mutex<DedupState>,
    normalizer: TextNormalizer,
    origin_ttl: Duration,
    echo_ttl: Duration,
    epoch: Instant,
}

impl DedupEngine {
    pub fn new(config: &DedupConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(DedupState {
                seen: LruCache::new(capacity),
                echoes: LruCache::new(capacity),
            }),
            normalizer: TextNormalizer::new(&config.strip, &config.unwrap),
            origin_ttl: Duration::from_millis(config.origin_ttl_ms),
            echo_ttl: Duration::from_millis(config.echo_ttl_ms),
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bucket(&self, now: Instant) -> u64 {
        let width = self.origin_ttl.as_millis().max(1);
        (now.saturating_duration_since(self.epoch).as_millis() / width) as u64
    }

    /// Run the duplicate-origin filter, then the echo filter, on an observation from `site`.
    pub fn check_inbound(&self, site: &Site, message: &RelayMessage) -> Verdict {
        self.check_inbound_at(site, message, Instant::now())
    }

    pub fn check_inbound_at(&self, site: &Site, message: &RelayMessage, now: Instant) -> Verdict {
        let candidates = self.normalizer.candidates(message.content());
        let mut state = self.lock();

        // Duplicate-origin filter
        match message.origin_id() {
            Some(id) => {
                let key = SeenKey::Origin(site.clone(), id.to_string());
                if is_live(state.seen.peek(&key), now) {
                    debug!("Duplicate origin id {} from {}", id, site);
                    return Verdict::Duplicate;
                }
                state.seen.push(key, now + self.origin_ttl);
            }
            None => {
                let print = fingerprint(&[message.author(), &candidates[0]]);
                let bucket = self.bucket(now);
                let current = SeenKey::Synthesized(site.clone(), print, bucket);
                let previous = bucket
                    .checked_sub(1)
                    .map(|b| SeenKey::Synthesized(site.clone(), print, b));

                let hit = is_live(state.seen.peek(&current), now)
                    || previous
                        .as_ref()
                        .is_some_and(|key| is_live(state.seen.peek(key), now));
                if hit {
                    debug!("Duplicate message from {} on {}", message.author(), site);
                    return Verdict::Duplicate;
                }
                state.seen.push(current, now + self.origin_ttl);
            }
        }

        // Echo filter
        for candidate in &candidates {
            let key = (site.clone(), fingerprint(&[candidate]));
            let consumed = match state.echoes.peek_mut(&key) {
                Some(expiries) => {
                    while expiries.front().is_some_and(|at| *at <= now) {
                        expiries.pop_front();
                    }
                    expiries.pop_front().is_some()
                }
                None => false,
            };
            if state.echoes.peek(&key).is_some_and(VecDeque::is_empty) {
                state.echoes.pop(&key);
            }
            if consumed {
                debug!("Echo consumed on {}", site);
                return Verdict::Echo;
            }
        }

        Verdict::Accept
    }

    /// Record that `text` is about to be dispatched toward `site`.
    pub fn register_echo(&self, site: &Site, text: &str) {
        self.register_echo_at(site, text, Instant::now());
    }

    pub fn register_echo_at(&self, site: &Site, text: &str, now: Instant) {
        let key = (site.clone(), fingerprint(&[&self.normalizer.normalize(text)]));
        let expires = now + self.echo_ttl;
        let mut state = self.lock();
        match state.echoes.peek_mut(&key) {
            Some(expiries) => expiries.push_back(expires),
            None => {
                state.echoes.push(key, VecDeque::from([expires]));
            }
        }
    }

    /// Record an id the origin platform assigned to a message the relay created.
    pub fn record_seen(&self, site: &Site, origin_id: &str) {
        self.record_seen_at(site, origin_id, Instant::now());
    }

    pub fn record_seen_at(&self, site: &Site, origin_id: &str, now: Instant) {
        let key = SeenKey::Origin(site.clone(), origin_id.to_string());
        self.lock().seen.push(key, now + self.origin_ttl);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let mut removed = 0;

        let stale: Vec<SeenKey> = state
            .seen
            .iter()
            .filter(|(_, expires)| **expires <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.seen.pop(&key);
            removed += 1;
        }

        let mut empty = Vec::new();
        for (key, expiries) in state.echoes.iter_mut() {
            let before = expiries.len();
            expiries.retain(|at| *at > now);
            removed += before - expiries.len();
            if expiries.is_empty() {
                empty.push(key.clone());
            }
        }
        for key in empty {
            state.echoes.pop(&key);
        }

        removed
    }

    /// Entry counts of (seen, echoes).
    pub fn len(&self) -> (usize, usize) {
        let state = self.lock();
        (state.seen.len(), state.echoes.len())
    }
}

fn is_live(expires: Option<&Instant>, now: Instant) -> bool {
    expires.is_some_and(|at| *at > now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ChannelId;

    fn engine() -> DedupEngine {
        DedupEngine::new(&DedupConfig::default())
    }

    fn msg(site: &Site, author: &str, content: &str, origin_id: Option<&str>) -> RelayMessage {
        RelayMessage::new(
            site.clone(),
            author,
            content,
            origin_id.map(str::to_string),
            Instant::now(),
        )
    }

    #[test]
    fn test_origin_id_duplicate_forwarded_once() {
        let engine = engine();
        let site = Site::Channel(ChannelId(1));
        let now = Instant::now();
        let m = msg(&site, "Alex", "hello", Some("111"));

        assert_eq!(engine.check_inbound_at(&site, &m, now), Verdict::Accept);
        assert_eq!(
            engine.check_inbound_at(&site, &m, now + Duration::from_millis(500)),
            Verdict::Duplicate
        );
    }

    #[test]
    fn test_origin_id_forwarded_again_after_ttl() {
        let engine = engine();
        let site = Site::Channel(ChannelId(1));
        let now = Instant::now();
        let m = msg(&site, "Alex", "hello", Some("111"));

        assert_eq!(engine.check_inbound_at(&site, &m, now), Verdict::Accept);
        assert_eq!(
            engine.check_inbound_at(&site, &m, now + Duration::from_millis(5001)),
            Verdict::Accept
        );
    }

    #[test]
    fn test_origin_ids_are_scoped_by_site() {
        let engine = engine();
        let a = Site::Endpoint("a".into());
        let b = Site::Endpoint("b".into());
        let now = Instant::now();

        assert_eq!(engine.check_inbound_at(&a, &msg(&a, "x", "hi", Some("1")), now), Verdict::Accept);
        assert_eq!(engine.check_inbound_at(&b, &msg(&b, "x", "hi", Some("1")), now), Verdict::Accept);
    }

    #[test]
    fn test_synthesized_key_collapses_replay() {
        let engine = engine();
        let site = Site::Game;
        let now = Instant::now();
        let m = msg(&site, "Steve", "gg", None);

        assert_eq!(engine.check_inbound_at(&site, &m, now), Verdict::Accept);
        assert_eq!(
            engine.check_inbound_at(&site, &m, now + Duration::from_millis(100)),
            Verdict::Duplicate
        );
    }

    #[test]
    fn test_synthesized_key_straddling_bucket_edge() {
        let engine = engine();
        let site = Site::Game;
        // Just before the end of the first bucket, then just after it
        let first = engine.epoch + Duration::from_millis(4900);
        let second = engine.epoch + Duration::from_millis(5100);
        let m = msg(&site, "Steve", "gg", None);

        assert_eq!(engine.check_inbound_at(&site, &m, first), Verdict::Accept);
        assert_eq!(engine.check_inbound_at(&site, &m, second), Verdict::Duplicate);
    }

    #[test]
    fn test_synthesized_key_expires() {
        let engine = engine();
        let site = Site::Game;
        let now = engine.epoch;
        let m = msg(&site, "Steve", "gg", None);

        assert_eq!(engine.check_inbound_at(&site, &m, now), Verdict::Accept);
        assert_eq!(
            engine.check_inbound_at(&site, &m, now + Duration::from_millis(6000)),
            Verdict::Accept
        );
    }

    #[test]
    fn test_wrapped_echo_consumed_once() {
        let engine = engine();
        let site = Site::Endpoint("e".into());
        let now = Instant::now();
        engine.register_echo_at(&site, "hello", now);

        let echo = msg(&site, "Bot", "<Bot> hello", None);
        assert_eq!(
            engine.check_inbound_at(&site, &echo, now + Duration::from_millis(800)),
            Verdict::Echo
        );

        // A later, genuinely new message with the same text goes through
        let again = msg(&site, "Alex", "hello", None);
        assert_eq!(
            engine.check_inbound_at(&site, &again, now + Duration::from_millis(900)),
            Verdict::Accept
        );
    }

    #[test]
    fn test_echo_ignores_formatting_codes() {
        let engine = engine();
        let site = Site::Game;
        let now = Instant::now();
        engine.register_echo_at(&site, "[Alex] hello", now);

        let echo = msg(&site, "Steve", "§7[Alex]§r hello", None);
        assert_eq!(engine.check_inbound_at(&site, &echo, now), Verdict::Echo);
    }

    #[test]
    fn test_echo_expires() {
        let engine = engine();
        let site = Site::Game;
        let now = Instant::now();
        engine.register_echo_at(&site, "hello", now);

        let late = msg(&site, "Steve", "hello", None);
        assert_eq!(
            engine.check_inbound_at(&site, &late, now + Duration::from_millis(5001)),
            Verdict::Accept
        );
    }

    #[test]
    fn test_echo_scoped_by_site() {
        let engine = engine();
        let now = Instant::now();
        engine.register_echo_at(&Site::Endpoint("a".into()), "hello", now);

        let other = Site::Endpoint("b".into());
        assert_eq!(
            engine.check_inbound_at(&other, &msg(&other, "x", "hello", None), now),
            Verdict::Accept
        );
    }

    #[test]
    fn test_repeated_injections_each_absorb_one_echo() {
        let engine = engine();
        let site = Site::Game;
        let now = Instant::now();
        engine.register_echo_at(&site, "lol", now);
        engine.register_echo_at(&site, "lol", now);

        let first = msg(&site, "Steve", "lol", Some("1"));
        let second = msg(&site, "Steve", "lol", Some("2"));
        let third = msg(&site, "Steve", "lol", Some("3"));
        assert_eq!(engine.check_inbound_at(&site, &first, now), Verdict::Echo);
        assert_eq!(engine.check_inbound_at(&site, &second, now), Verdict::Echo);
        assert_eq!(engine.check_inbound_at(&site, &third, now), Verdict::Accept);
    }

    #[test]
    fn test_record_seen_collapses_platform_delivery() {
        let engine = engine();
        let site = Site::Channel(ChannelId(9));
        let now = Instant::now();
        engine.record_seen_at(&site, "555", now);

        let own_post = msg(&site, "Bridge", "Steve: hi", Some("555"));
        assert_eq!(engine.check_inbound_at(&site, &own_post, now), Verdict::Duplicate);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let config = DedupConfig {
            max_entries: 2,
            ..DedupConfig::default()
        };
        let engine = DedupEngine::new(&config);
        let site = Site::Game;
        let now = Instant::now();

        engine.record_seen_at(&site, "1", now);
        engine.record_seen_at(&site, "2", now);
        engine.record_seen_at(&site, "3", now);

        assert_eq!(engine.len().0, 2);
        assert_eq!(
            engine.check_inbound_at(&site, &msg(&site, "a", "x", Some("1")), now),
            Verdict::Accept
        );
    }

    #[test]
    fn test_purge_expired() {
        let engine = engine();
        let now = Instant::now();
        engine.record_seen_at(&Site::Game, "1", now);
        engine.register_echo_at(&Site::Game, "hello", now);

        assert_eq!(engine.purge_expired_at(now + Duration::from_secs(1)), 0);
        assert_eq!(engine.purge_expired_at(now + Duration::from_secs(6)), 2);
        assert_eq!(engine.len(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_follow_the_runtime_clock() {
        let engine = engine();
        let site = Site::Channel(ChannelId(3));
        let m = msg(&site, "Alex", "hello", Some("42"));

        assert_eq!(engine.check_inbound(&site, &m), Verdict::Accept);
        engine.register_echo(&site, "Steve: hi");

        tokio::time::advance(Duration::from_millis(4000)).await;
        assert_eq!(engine.check_inbound(&site, &m), Verdict::Duplicate);
        assert_eq!(engine.purge_expired(), 0);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(engine.purge_expired(), 2);
        assert_eq!(engine.check_inbound(&site, &m), Verdict::Accept);
    }
}
