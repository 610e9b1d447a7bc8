//! Coarse bot-level state (active flag, counters) with dual-backend persistence.
//!
//! The primary store is written inside `set_state`; the fallback store is
//! written by a debounced timer so bursts of changes collapse into one write,
//! and by a periodic forced flush.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::{GuardConfig, StateConfig},
    errors::Error,
    store::{DurableStore, StoreChain},
    timer::{once, repeating, Scheduler, TimerHandle},
    Result,
};

pub const BOT_STATE_KEY: &str = "bot-state";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub enabled: bool,
    pub per_minute: u32,
    pub per_hour: u32,
}

impl RateLimitSnapshot {
    pub fn from_config(cfg: &GuardConfig) -> Self {
        Self {
            enabled: cfg.rate_limit_enabled,
            per_minute: cfg.per_minute,
            per_hour: cfg.per_hour,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotState {
    pub is_active: bool,
    pub total_messages: u64,
    pub last_toggled_at: DateTime<Utc>,
    pub last_toggled_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub rate_limit: RateLimitSnapshot,
}

impl BotState {
    pub fn defaults(now: DateTime<Utc>, rate_limit: RateLimitSnapshot) -> Self {
        Self {
            is_active: true,
            total_messages: 0,
            last_toggled_at: now,
            last_toggled_by: None,
            updated_at: now,
            rate_limit,
        }
    }

    /// Rebuild state from stored JSON field by field. Unknown fields are
    /// dropped, mistyped fields take their default and unparseable timestamps
    /// become `now`.
    pub fn from_value(v: &Value, now: DateTime<Utc>, rate_defaults: RateLimitSnapshot) -> Self {
        let d = Self::defaults(now, rate_defaults);
        let rl = v.get("rateLimit");

        Self {
            is_active: v.get("isActive").and_then(Value::as_bool).unwrap_or(d.is_active),
            total_messages: v
                .get("totalMessages")
                .and_then(Value::as_u64)
                .unwrap_or(d.total_messages),
            last_toggled_at: timestamp(v.get("lastToggledAt")).unwrap_or(now),
            last_toggled_by: v
                .get("lastToggledBy")
                .and_then(Value::as_str)
                .map(str::to_string),
            updated_at: timestamp(v.get("updatedAt")).unwrap_or(now),
            rate_limit: RateLimitSnapshot {
                enabled: rl
                    .and_then(|r| r.get("enabled"))
                    .and_then(Value::as_bool)
                    .unwrap_or(rate_defaults.enabled),
                per_minute: rl
                    .and_then(|r| r.get("perMinute"))
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(rate_defaults.per_minute),
                per_hour: rl
                    .and_then(|r| r.get("perHour"))
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(rate_defaults.per_hour),
            },
        }
    }

    fn apply(&mut self, patch: &BotStatePatch, now: DateTime<Utc>) {
        if let Some(active) = patch.is_active {
            if active != self.is_active || patch.toggled_by.is_some() {
                self.last_toggled_at = now;
                self.last_toggled_by = patch.toggled_by.clone();
            }
            self.is_active = active;
        }
        if let Some(total) = patch.total_messages {
            self.total_messages = total;
        }
        if let Some(rl) = patch.rate_limit {
            self.rate_limit = rl;
        }
        self.updated_at = now;
    }
}

fn timestamp(v: Option<&Value>) -> Option<DateTime<Utc>> {
    v.and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Partial update for [`BotStateStore::set_state`].
#[derive(Clone, Debug, Default)]
pub struct BotStatePatch {
    pub is_active: Option<bool>,
    pub total_messages: Option<u64>,
    /// Actor recorded when `is_active` is set.
    pub toggled_by: Option<String>,
    pub rate_limit: Option<RateLimitSnapshot>,
}

struct StateInner {
    cfg: StateConfig,
    primary: Option<Arc<dyn DurableStore>>,
    fallback: Arc<dyn DurableStore>,
    scheduler: Arc<dyn Scheduler>,
    state: StdMutex<BotState>,
    primary_lock: Mutex<()>,
    write_lock: Mutex<()>,
    debounce: StdMutex<Option<TimerHandle>>,
    flush_timer: StdMutex<Option<TimerHandle>>,
}

#[derive(Clone)]
pub struct BotStateStore {
    inner: Arc<StateInner>,
}

impl BotStateStore {
    /// Load state (primary, then fallback, then defaults) and start the
    /// periodic fallback flush. Never fails: storage problems degrade to defaults.
    pub async fn init(
        cfg: StateConfig,
        guard: &GuardConfig,
        primary: Option<Arc<dyn DurableStore>>,
        fallback: Arc<dyn DurableStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let now = Utc::now();
        let rate = RateLimitSnapshot::from_config(guard);

        let mut stores: Vec<Arc<dyn DurableStore>> = Vec::new();
        if let Some(p) = &primary {
            stores.push(p.clone());
        }
        stores.push(fallback.clone());
        let chain = StoreChain::new(stores);

        let loaded = chain
            .load_with(BOT_STATE_KEY, |raw| {
                let v: Value = serde_json::from_str(raw)?;
                if !v.is_object() {
                    return Err(Error::Store {
                        store: "bot-state".to_string(),
                        reason: "stored state is not an object".to_string(),
                    });
                }
                Ok(BotState::from_value(&v, now, rate))
            })
            .await;

        let (state, persist_now) = match loaded {
            Ok(Some(mut s)) => {
                let stale = s.rate_limit != rate;
                s.rate_limit = rate;
                info!(
                    active = s.is_active,
                    total_messages = s.total_messages,
                    "bot state loaded"
                );
                (s, stale)
            }
            Ok(None) => {
                info!("no stored bot state; starting from defaults");
                (BotState::defaults(now, rate), true)
            }
            Err(e) => {
                warn!(error = %e, "bot state unreadable in every store; starting from defaults");
                (BotState::defaults(now, rate), true)
            }
        };

        let store = Self {
            inner: Arc::new(StateInner {
                cfg,
                primary,
                fallback,
                scheduler,
                state: StdMutex::new(state),
                primary_lock: Mutex::new(()),
                write_lock: Mutex::new(()),
                debounce: StdMutex::new(None),
                flush_timer: StdMutex::new(None),
            }),
        };

        if persist_now {
            store.inner.write_primary().await;
            store.inner.write_fallback().await;
        }
        store.start_flush_timer();
        store
    }

    /// Current in-memory state.
    pub fn get_state(&self) -> BotState {
        self.inner.snapshot()
    }

    /// Merge `patch`, write the primary store, and schedule the fallback write.
    pub async fn set_state(&self, patch: BotStatePatch) -> BotState {
        let next = self.update(|st, now| st.apply(&patch, now));
        self.persist().await;
        next
    }

    pub async fn toggle(&self, active: bool, actor: &str) -> BotState {
        info!(active, "bot toggled");
        self.set_state(BotStatePatch {
            is_active: Some(active),
            toggled_by: Some(actor.to_string()),
            ..BotStatePatch::default()
        })
        .await
    }

    /// Count one handled message. The read and the write share one lock.
    pub async fn increment_messages(&self) -> BotState {
        let next = self.update(|st, now| {
            st.total_messages = st.total_messages.saturating_add(1);
            st.updated_at = now;
        });
        self.persist().await;
        next
    }

    /// Cancel timers and write both stores with the latest state.
    pub async fn shutdown(&self) {
        if let Some(t) = lock(&self.inner.debounce).take() {
            t.cancel();
        }
        if let Some(t) = lock(&self.inner.flush_timer).take() {
            t.cancel();
        }
        self.inner.write_primary().await;
        self.inner.write_fallback().await;
        debug!("bot state flushed on shutdown");
    }

    fn update(&self, f: impl FnOnce(&mut BotState, DateTime<Utc>)) -> BotState {
        let mut st = lock(&self.inner.state);
        f(&mut st, Utc::now());
        st.clone()
    }

    async fn persist(&self) {
        self.inner.write_primary().await;
        self.schedule_fallback_write();
    }

    fn schedule_fallback_write(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut slot = lock(&self.inner.debounce);
        if let Some(prev) = slot.take() {
            prev.cancel();
        }
        *slot = Some(self.inner.scheduler.schedule_once(
            self.inner.cfg.debounce,
            once(move || fallback_task(weak)),
        ));
    }

    fn start_flush_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule_repeating(
            self.inner.cfg.flush_interval,
            repeating(move || fallback_task(weak.clone())),
        );
        *lock(&self.inner.flush_timer) = Some(handle);
    }
}

async fn fallback_task(inner: Weak<StateInner>) {
    if let Some(inner) = inner.upgrade() {
        inner.write_fallback().await;
    }
}

impl StateInner {
    fn snapshot(&self) -> BotState {
        lock(&self.state).clone()
    }

    fn serialized(&self) -> Option<String> {
        match serde_json::to_string(&self.snapshot()) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(error = %e, "failed to serialize bot state");
                None
            }
        }
    }

    async fn write_primary(&self) {
        let Some(primary) = &self.primary else {
            return;
        };
        let _guard = self.primary_lock.lock().await;
        let Some(raw) = self.serialized() else {
            return;
        };
        if let Err(e) = primary.put(BOT_STATE_KEY, &raw).await {
            warn!(store = primary.name(), error = %e, "primary bot state write failed");
        }
    }

    async fn write_fallback(&self) {
        let _guard = self.write_lock.lock().await;
        let Some(raw) = self.serialized() else {
            return;
        };
        match self.fallback.put(BOT_STATE_KEY, &raw).await {
            Ok(()) => debug!(store = self.fallback.name(), "bot state written"),
            Err(e) => warn!(store = self.fallback.name(), error = %e, "fallback bot state write failed"),
        }
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
