//! Text normalization for fingerprinting.
//!
//! Strips origin-specific formatting codes, unwraps author-wrapped renderings
//! (`<Bot> hello`, `[Alex] hello`) and collapses whitespace, so that an
//! injected message and its read-back produce the same fingerprint.

use fancy_regex::Regex;
use tracing::warn;

/// A compiled regex pattern with its original string for debugging.
#[derive(Debug, Clone)]
struct CompiledPattern {
    original: String,
    regex: Regex,
}

/// Configurable normalization rules.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    strip: Vec<CompiledPattern>,
    unwrap: Vec<CompiledPattern>,
}

impl TextNormalizer {
    /// Build from pattern strings. Invalid patterns are logged and skipped.
    pub fn new(strip: &[String], unwrap: &[String]) -> Self {
        Self {
            strip: compile_patterns(strip),
            unwrap: compile_patterns(unwrap),
        }
    }

    /// Strip formatting, collapse whitespace, trim.
    pub fn normalize(&self, text: &str) -> String {
        let mut current = text.to_string();
        for pattern in &self.strip {
            current = remove_matches(pattern, &current);
        }
        current.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Every normalized form an observation may match: the text itself, then
    /// each unwrapped form.
    pub fn candidates(&self, text: &str) -> Vec<String> {
        let normalized = self.normalize(text);
        let mut forms = vec![normalized.clone()];

        for pattern in &self.unwrap {
            let inner = match pattern.regex.captures(&normalized) {
                Ok(Some(caps)) => caps.get(1).map(|m| m.as_str().trim().to_string()),
                Ok(None) => None,
                Err(e) => {
                    warn!("Regex match error for pattern '{}': {}", pattern.original, e);
                    None
                }
            };
            if let Some(inner) = inner {
                if !inner.is_empty() && !forms.contains(&inner) {
                    forms.push(inner);
                }
            }
        }

        forms
    }
}

impl Default for TextNormalizer {
    fn default() -> Self {
        let defaults = crate::config::types::DedupConfig::default();
        Self::new(&defaults.strip, &defaults.unwrap)
    }
}

fn remove_matches(pattern: &CompiledPattern, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for found in pattern.regex.find_iter(text) {
        match found {
            Ok(m) => {
                out.push_str(&text[last..m.start()]);
                last = m.end();
            }
            Err(e) => {
                warn!("Regex match error for pattern '{}': {}", pattern.original, e);
                break;
            }
        }
    }
    out.push_str(&text[last..]);
    out
}

/// Compile a list of regex pattern strings, skipping invalid ones.
fn compile_patterns(patterns: &[String]) -> Vec<CompiledPattern> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(CompiledPattern {
                original: pattern.clone(),
                regex,
            }),
            Err(e) => {
                warn!("Invalid normalization pattern '{}': {}", pattern, e);
                None
            }
        })
        .collect()
}
