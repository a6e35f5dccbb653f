//! Whole-word nick mention detection.

use std::sync::Mutex;

use regex::Regex;

/// Detects case-insensitive whole-word mentions of the current nick,
/// with an optional leading `@`.
///
/// The compiled pattern is cached per nick; nick changes are rare, so a
/// single slot is enough.
#[derive(Debug, Default)]
pub struct MentionDetector {
    cache: Mutex<Option<(String, Regex)>>,
}

impl MentionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff `text` contains `nick` as a whole word. Partial substrings
    /// never match ("hellobob" does not mention "bob").
    pub fn matches(&self, text: &str, nick: &str) -> bool {
        if nick.is_empty() || text.is_empty() {
            return false;
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match cache.as_ref() {
            Some((cached_nick, re)) if cached_nick == nick => re.is_match(text),
            _ => match compile(nick) {
                Some(re) => {
                    let hit = re.is_match(text);
                    *cache = Some((nick.to_string(), re));
                    hit
                }
                None => false,
            },
        }
    }
}

fn compile(nick: &str) -> Option<Regex> {
    // Boundary chars are consumed rather than looked around; is_match only,
    // so overlap does not matter.
    let pattern = format!(r"(?i)(^|\W)@?{}(\W|$)", regex::escape(nick));
    Regex::new(&pattern).ok()
}
