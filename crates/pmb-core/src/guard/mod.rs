//! Admission control for inbound messages.
//!
//! Every message passes owner bypass, block list, rate windows, pattern
//! heuristics and content heuristics, in that order, before it may reach the
//! reply generator. Per-sender state sits behind its own lock so different
//! senders are evaluated concurrently.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::GuardConfig,
    domain::SenderId,
    errors::Error,
    timer::{repeating, Scheduler, TimerHandle},
    utils::{now_ms, redact},
    Result,
};

mod content;
mod records;

pub use content::{inspect, ContentViolation, SpamSignal};
use records::SenderRecord;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    Owner,
    Admitted,
    FailOpen,
    Blocked,
    UserBlocked,
    RateLimitMinute,
    RateLimitHour,
    DuplicateMessage,
    Burst,
    SpamContent,
    MessageTooLong,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admitted => "admitted",
            Self::FailOpen => "fail_open",
            Self::Blocked => "blocked",
            Self::UserBlocked => "user_blocked",
            Self::RateLimitMinute => "rate_limit_minute",
            Self::RateLimitHour => "rate_limit_hour",
            Self::DuplicateMessage => "duplicate_message",
            Self::Burst => "burst",
            Self::SpamContent => "spam_content",
            Self::MessageTooLong => "message_too_long",
        }
    }
}

/// Outcome of [`AdmissionGuard::check_message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Reason,
    /// Text to send back to the sender, if the rejection is not silent.
    pub reply: Option<String>,
}

impl Decision {
    fn allow(reason: Reason) -> Self {
        Self {
            allowed: true,
            reason,
            reply: None,
        }
    }

    fn reject(reason: Reason, reply: Option<String>) -> Self {
        Self {
            allowed: false,
            reason,
            reply,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOrigin {
    RateLimit,
    Pattern,
    Manual,
}

#[derive(Clone, Debug)]
pub struct BlockEntry {
    pub blocked_at: u64,
    pub expires_at: u64,
    pub reason: String,
    pub origin: BlockOrigin,
}

impl BlockEntry {
    fn rejection_reason(&self) -> Reason {
        match self.origin {
            BlockOrigin::RateLimit => Reason::UserBlocked,
            BlockOrigin::Pattern | BlockOrigin::Manual => Reason::Blocked,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub tracked_senders: usize,
    pub active_blocks: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub records_removed: usize,
    pub blocks_removed: usize,
    /// True when the sweep yielded to concurrent admission work.
    pub skipped: bool,
}

type SenderMap = HashMap<SenderId, Arc<Mutex<SenderRecord>>>;

pub struct AdmissionGuard {
    cfg: GuardConfig,
    senders: Mutex<SenderMap>,
    blocks: Mutex<HashMap<SenderId, BlockEntry>>,
}

impl AdmissionGuard {
    pub fn new(cfg: GuardConfig) -> Self {
        Self {
            cfg,
            senders: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.cfg
    }

    /// Decide whether a message may proceed. Internal faults admit the message.
    pub fn check_message(
        &self,
        sender: &SenderId,
        text: &str,
        is_group: bool,
        at_ms: u64,
        is_owner: bool,
    ) -> Decision {
        match self.evaluate(sender, text, is_group, at_ms, is_owner) {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        sender = %redact(sender),
                        reason = decision.reason.as_str(),
                        "message rejected"
                    );
                }
                decision
            }
            Err(e) => {
                error!(error = %e, "admission check failed; admitting message");
                Decision::allow(Reason::FailOpen)
            }
        }
    }

    fn evaluate(
        &self,
        sender: &SenderId,
        text: &str,
        is_group: bool,
        now: u64,
        is_owner: bool,
    ) -> Result<Decision> {
        if sender.as_str().trim().is_empty() {
            return Err(Error::Guard("empty sender id".to_string()));
        }

        let record = self.record_for(sender)?;
        let mut rec = record
            .lock()
            .map_err(|_| Error::Guard("sender record lock poisoned".to_string()))?;
        rec.last_seen_at = now;

        if is_owner {
            rec.last_message_at = Some(now);
            return Ok(Decision::allow(Reason::Owner));
        }

        if let Some(reason) = self.active_block(sender, now)? {
            return Ok(Decision::reject(reason, None));
        }

        if self.cfg.rate_limit_enabled {
            if let Some(decision) = self.check_rate(sender, &mut rec, is_group, now)? {
                return Ok(decision);
            }
        }

        if let Some(decision) = self.check_pattern(sender, &mut rec, text, is_group, now)? {
            return Ok(decision);
        }

        if let Some(decision) = self.check_content(sender, &mut rec, text, is_group, now)? {
            return Ok(decision);
        }

        rec.minute.count += 1;
        rec.hour.count += 1;
        rec.last_message_at = Some(now);
        Ok(Decision::allow(Reason::Admitted))
    }

    fn check_rate(
        &self,
        sender: &SenderId,
        rec: &mut SenderRecord,
        is_group: bool,
        now: u64,
    ) -> Result<Option<Decision>> {
        rec.minute.roll(now, MINUTE_MS);
        if rec.hour.roll(now, HOUR_MS) {
            rec.warnings = 0;
        }

        if rec.hour.count >= self.cfg.per_hour {
            self.put_block(
                sender,
                now,
                self.cfg.hour_block,
                "hourly message limit exceeded",
                BlockOrigin::RateLimit,
            )?;
            let reply = format!(
                "You've reached the limit of {} messages per hour. Please try again in {}.",
                self.cfg.per_hour,
                human_duration(self.cfg.hour_block)
            );
            return Ok(Some(Decision::reject(
                Reason::RateLimitHour,
                direct_only(is_group, reply),
            )));
        }

        if rec.minute.count >= self.cfg.per_minute {
            rec.warnings += 1;
            if rec.warnings >= self.cfg.minute_warnings_before_block {
                self.put_block(
                    sender,
                    now,
                    self.cfg.minute_block,
                    "repeatedly exceeded per-minute limit",
                    BlockOrigin::RateLimit,
                )?;
                let reply = format!(
                    "You're sending messages too fast and have been paused for {}.",
                    human_duration(self.cfg.minute_block)
                );
                return Ok(Some(Decision::reject(
                    Reason::RateLimitMinute,
                    direct_only(is_group, reply),
                )));
            }

            let wait_secs = rec.minute.remaining_ms(now).div_ceil(1000).max(1);
            let reply = format!(
                "Please slow down. You can send another message in {wait_secs} seconds."
            );
            return Ok(Some(Decision::reject(
                Reason::RateLimitMinute,
                direct_only(is_group, reply),
            )));
        }

        Ok(None)
    }

    fn check_pattern(
        &self,
        sender: &SenderId,
        rec: &mut SenderRecord,
        text: &str,
        is_group: bool,
        now: u64,
    ) -> Result<Option<Decision>> {
        let cfg = &self.cfg;
        let copies = rec.recent_copies(text, now, millis(cfg.duplicate_window));

        if let Some((_, last_at)) = rec.history.back() {
            let gap = now.saturating_sub(*last_at);
            if gap < millis(cfg.burst_gap) {
                rec.burst += 1;
            } else if gap > millis(cfg.burst_decay_gap) {
                rec.burst = rec.burst.saturating_sub(1);
            }
        }
        rec.remember(text, now, cfg.history_len);

        if copies + 1 >= cfg.duplicate_threshold {
            rec.duplicate_streak += 1;
            let streak = rec.duplicate_streak;
            if streak >= cfg.duplicate_streak_limit {
                rec.duplicate_streak = 0;
                self.put_block(
                    sender,
                    now,
                    cfg.duplicate_block,
                    "repeated duplicate messages",
                    BlockOrigin::Pattern,
                )?;
                let reply = format!(
                    "You've been paused for {} for sending the same message repeatedly.",
                    human_duration(cfg.duplicate_block)
                );
                return Ok(Some(Decision::reject(
                    Reason::DuplicateMessage,
                    direct_only(is_group, reply),
                )));
            }

            let reply = if streak == 1 {
                "Looks like you sent the same message several times. I'll only answer it once."
                    .to_string()
            } else {
                "Please stop repeating the same message, or you'll be paused for a while."
                    .to_string()
            };
            return Ok(Some(Decision::reject(
                Reason::DuplicateMessage,
                direct_only(is_group, reply),
            )));
        }
        rec.duplicate_streak = 0;

        if rec.burst >= cfg.burst_threshold {
            rec.burst = 0;
            self.put_block(
                sender,
                now,
                cfg.burst_block,
                "message burst",
                BlockOrigin::Pattern,
            )?;
            let reply = format!(
                "Too many messages in a row. You've been paused for {}.",
                human_duration(cfg.burst_block)
            );
            return Ok(Some(Decision::reject(
                Reason::Burst,
                direct_only(is_group, reply),
            )));
        }

        Ok(None)
    }

    fn check_content(
        &self,
        sender: &SenderId,
        rec: &mut SenderRecord,
        text: &str,
        is_group: bool,
        now: u64,
    ) -> Result<Option<Decision>> {
        let Some(violation) = inspect(text, self.cfg.max_message_chars) else {
            return Ok(None);
        };

        let (reason, reply) = match violation {
            ContentViolation::TooLong => (
                Reason::MessageTooLong,
                format!(
                    "Your message is too long. Please keep it under {} characters.",
                    self.cfg.max_message_chars
                ),
            ),
            ContentViolation::Spam(signal) => {
                debug!(sender = %redact(sender), signal = signal.as_str(), "spam signal");
                (
                    Reason::SpamContent,
                    "Your message looks like spam and was not processed.".to_string(),
                )
            }
        };

        let recent = rec.log_violation(now, millis(self.cfg.violation_window));
        if recent >= self.cfg.violation_threshold {
            rec.violations.clear();
            self.put_block(
                sender,
                now,
                self.cfg.violation_block,
                "repeated content violations",
                BlockOrigin::Pattern,
            )?;
        }

        Ok(Some(Decision::reject(reason, direct_only(is_group, reply))))
    }

    /// Reason to reject when `sender` is blocked at `now`. Expired entries are removed.
    fn active_block(&self, sender: &SenderId, now: u64) -> Result<Option<Reason>> {
        let mut blocks = self.lock_blocks()?;
        let Some(entry) = blocks.get(sender) else {
            return Ok(None);
        };
        if now < entry.expires_at {
            return Ok(Some(entry.rejection_reason()));
        }
        blocks.remove(sender);
        info!(sender = %redact(sender), "block expired");
        Ok(None)
    }

    fn put_block(
        &self,
        sender: &SenderId,
        now: u64,
        duration: Duration,
        reason: &str,
        origin: BlockOrigin,
    ) -> Result<()> {
        let entry = BlockEntry {
            blocked_at: now,
            expires_at: now.saturating_add(millis(duration)),
            reason: reason.to_string(),
            origin,
        };
        warn!(
            sender = %redact(sender),
            reason,
            minutes = duration.as_secs() / 60,
            "sender blocked"
        );
        self.lock_blocks()?.insert(sender.clone(), entry);
        Ok(())
    }

    /// Block `sender` for `duration` on the owner's behalf.
    pub fn block(&self, sender: &SenderId, duration: Duration, reason: &str) {
        if let Err(e) = self.put_block(sender, now_ms(), duration, reason, BlockOrigin::Manual) {
            error!(error = %e, "manual block failed");
        }
    }

    /// Lift a block. Returns whether one existed.
    pub fn unblock(&self, sender: &SenderId) -> bool {
        let removed = self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sender)
            .is_some();

        let record = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sender)
            .cloned();
        if let Some(record) = record {
            record
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reset_escalation();
        }

        if removed {
            info!(sender = %redact(sender), "sender unblocked");
        }
        removed
    }

    pub fn block_entry(&self, sender: &SenderId) -> Option<BlockEntry> {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sender)
            .cloned()
    }

    pub fn stats(&self, now: u64) -> GuardStats {
        let tracked_senders = self.senders.lock().unwrap_or_else(|e| e.into_inner()).len();
        let active_blocks = self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| now < b.expires_at)
            .count();
        GuardStats {
            tracked_senders,
            active_blocks,
        }
    }

    /// Drop idle sender records and expired blocks. Yields instead of waiting
    /// when admission holds a lock.
    pub fn sweep(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let ttl = millis(self.cfg.inactivity_ttl);

        match self.senders.try_lock() {
            Ok(mut senders) => {
                let before = senders.len();
                senders.retain(|_, record| match record.try_lock() {
                    Ok(rec) => now.saturating_sub(rec.last_seen_at) <= ttl,
                    Err(_) => true,
                });
                report.records_removed = before - senders.len();
            }
            Err(_) => report.skipped = true,
        }

        match self.blocks.try_lock() {
            Ok(mut blocks) => {
                let before = blocks.len();
                blocks.retain(|_, b| now < b.expires_at);
                report.blocks_removed = before - blocks.len();
            }
            Err(_) => report.skipped = true,
        }

        if report.records_removed > 0 || report.blocks_removed > 0 {
            info!(
                records = report.records_removed,
                blocks = report.blocks_removed,
                "guard sweep"
            );
        }
        report
    }

    /// Run [`Self::sweep`] every `sweep_interval` until the handle is cancelled.
    pub fn start_sweeper(self: &Arc<Self>, scheduler: &dyn Scheduler) -> TimerHandle {
        let guard = Arc::downgrade(self);
        scheduler.schedule_repeating(
            self.cfg.sweep_interval,
            repeating(move || {
                let guard = guard.clone();
                async move {
                    if let Some(guard) = guard.upgrade() {
                        guard.sweep(now_ms());
                    }
                }
            }),
        )
    }

    fn record_for(&self, sender: &SenderId) -> Result<Arc<Mutex<SenderRecord>>> {
        let mut senders = self
            .senders
            .lock()
            .map_err(|_| Error::Guard("sender map lock poisoned".to_string()))?;
        Ok(senders.entry(sender.clone()).or_default().clone())
    }

    fn lock_blocks(&self) -> Result<MutexGuard<'_, HashMap<SenderId, BlockEntry>>> {
        self.blocks
            .lock()
            .map_err(|_| Error::Guard("block list lock poisoned".to_string()))
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

fn direct_only(is_group: bool, reply: String) -> Option<String> {
    (!is_group).then_some(reply)
}

fn human_duration(d: Duration) -> String {
    let mins = d.as_secs() / 60;
    match mins {
        0 => format!("{} seconds", d.as_secs()),
        1 => "1 minute".to_string(),
        m if m % 60 == 0 && m >= 60 => match m / 60 {
            1 => "1 hour".to_string(),
            h => format!("{h} hours"),
        },
        m => format!("{m} minutes"),
    }
}
