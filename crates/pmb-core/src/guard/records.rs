use std::collections::VecDeque;

/// Fixed window counter that resets lazily once its deadline has passed.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Window {
    pub count: u32,
    pub reset_at: u64,
}

impl Window {
    /// Start a fresh window if the current one expired. Returns true on reset.
    pub fn roll(&mut self, now_ms: u64, len_ms: u64) -> bool {
        if now_ms < self.reset_at {
            return false;
        }
        self.count = 0;
        self.reset_at = now_ms.saturating_add(len_ms);
        true
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms)
    }
}

/// Everything the guard remembers about one sender.
#[derive(Debug, Default)]
pub(crate) struct SenderRecord {
    pub minute: Window,
    pub hour: Window,
    pub warnings: u32,
    pub last_message_at: Option<u64>,
    pub last_seen_at: u64,

    pub history: VecDeque<(String, u64)>,
    pub burst: u32,
    pub duplicate_streak: u32,
    pub violations: VecDeque<u64>,
}

impl SenderRecord {
    /// Copies of `text` seen within `window_ms` before `now_ms`.
    pub fn recent_copies(&self, text: &str, now_ms: u64, window_ms: u64) -> usize {
        self.history
            .iter()
            .filter(|(t, at)| t == text && now_ms.saturating_sub(*at) <= window_ms)
            .count()
    }

    pub fn remember(&mut self, text: &str, now_ms: u64, cap: usize) {
        self.history.push_back((text.to_string(), now_ms));
        while self.history.len() > cap {
            self.history.pop_front();
        }
    }

    /// Log a violation and return how many fall inside `window_ms`.
    pub fn log_violation(&mut self, now_ms: u64, window_ms: u64) -> usize {
        self.violations.push_back(now_ms);
        while self
            .violations
            .front()
            .is_some_and(|at| now_ms.saturating_sub(*at) > window_ms)
        {
            self.violations.pop_front();
        }
        self.violations.len()
    }

    pub fn reset_escalation(&mut self) {
        self.warnings = 0;
        self.duplicate_streak = 0;
        self.burst = 0;
    }
}
