//! Content heuristics for inbound text.

use std::sync::OnceLock;

use regex::Regex;

const CHAR_RUN_LIMIT: usize = 11;
const UNIT_REPEAT_LIMIT: usize = 6;
const URL_LIMIT: usize = 3;
const SPECIAL_RUN_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentViolation {
    Spam(SpamSignal),
    TooLong,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpamSignal {
    RepeatedCharacter,
    RepeatedSequence,
    TooManyLinks,
    SpamPhrase,
    SpecialCharacters,
    Urgency,
}

impl SpamSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedCharacter => "repeated_character",
            Self::RepeatedSequence => "repeated_sequence",
            Self::TooManyLinks => "too_many_links",
            Self::SpamPhrase => "spam_phrase",
            Self::SpecialCharacters => "special_characters",
            Self::Urgency => "urgency",
        }
    }
}

/// First content rule `text` breaks, if any.
pub fn inspect(text: &str, max_chars: usize) -> Option<ContentViolation> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() > max_chars {
        return Some(ContentViolation::TooLong);
    }
    spam_signal(text, &chars).map(ContentViolation::Spam)
}

fn spam_signal(text: &str, chars: &[char]) -> Option<SpamSignal> {
    if longest_char_run(chars, |c| !c.is_whitespace()) >= CHAR_RUN_LIMIT {
        return Some(SpamSignal::RepeatedCharacter);
    }
    if has_repeated_unit(chars) {
        return Some(SpamSignal::RepeatedSequence);
    }
    if url_re().find_iter(text).count() >= URL_LIMIT {
        return Some(SpamSignal::TooManyLinks);
    }
    if spam_phrase_re().is_match(text) {
        return Some(SpamSignal::SpamPhrase);
    }
    if special_run(chars) >= SPECIAL_RUN_LIMIT {
        return Some(SpamSignal::SpecialCharacters);
    }
    if urgency_re().is_match(text) {
        return Some(SpamSignal::Urgency);
    }
    None
}

/// Longest run of one repeated character among characters accepted by `counts`.
fn longest_char_run(chars: &[char], counts: impl Fn(char) -> bool) -> usize {
    let mut best = 0;
    let mut run = 0;
    let mut prev = None;
    for &c in chars {
        if !counts(c) {
            run = 0;
            prev = None;
            continue;
        }
        run = if prev == Some(c) { run + 1 } else { 1 };
        prev = Some(c);
        best = best.max(run);
    }
    best
}

/// A 2-5 character unit repeated back to back at least six times ("abcabcabc...").
fn has_repeated_unit(chars: &[char]) -> bool {
    let n = chars.len();
    for len in 2..=5 {
        if n < len * UNIT_REPEAT_LIMIT {
            break;
        }
        for start in 0..=(n - len * UNIT_REPEAT_LIMIT) {
            let unit = &chars[start..start + len];
            if unit.iter().all(|c| c.is_whitespace()) || unit.iter().all(|c| *c == unit[0]) {
                continue;
            }
            let mut reps = 1;
            let mut at = start + len;
            while at + len <= n && &chars[at..at + len] == unit {
                reps += 1;
                if reps >= UNIT_REPEAT_LIMIT {
                    return true;
                }
                at += len;
            }
        }
    }
    false
}

/// Longest run of ASCII punctuation, not counting `.` and `-`.
fn special_run(chars: &[char]) -> usize {
    let mut best = 0;
    let mut run = 0;
    for &c in chars {
        if c.is_ascii_punctuation() && c != '.' && c != '-' {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("valid regex"))
}

fn spam_phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:click here|free money|you(?:'ve| have) won|claim your (?:prize|reward)|work from home|earn \$?\d+ (?:per|a) (?:day|hour)|crypto giveaway|double your (?:money|bitcoin)|risk[- ]free|100% free)",
        )
        .expect("valid regex")
    })
}

fn urgency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:act now|limited time offer|buy now|order now|offer expires|last chance|don'?t miss out|urgent(?:ly)? (?:reply|respond|action))\b",
        )
        .expect("valid regex")
    })
}
