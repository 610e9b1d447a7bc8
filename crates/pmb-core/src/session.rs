//! Transport session lifecycle: connect, pair, detect disconnects, reconnect
//! with exponential back-off, and keep credentials persisted.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionConfig,
    credentials::{CredentialRepository, CredentialUpdate, SessionCredentials},
    domain::{ChatId, InboundMessage},
    errors::Error,
    timer::{Scheduler, TaskFuture, TimerHandle},
    transport::{
        Challenge, DisconnectReason, TransportClient, TransportConnection, TransportEvent,
        TransportHandle,
    },
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    QrPending,
    PairingPending,
    Connected,
    Reconnecting,
    /// Terminal: the device was unlinked and must be paired again.
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::PairingPending => "pairing_pending",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedOut => "logged_out",
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::QrPending | Self::PairingPending | Self::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to subscribers of the [`SessionManager`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Challenge(Challenge),
    Message(InboundMessage),
    LoggedOut,
    PairingFailed { attempts: u32 },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectAbandoned { attempts: u32 },
}

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    senders: StdMutex<HashMap<u64, mpsc::UnboundedSender<SessionEvent>>>,
}

impl Subscribers {
    fn add(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.lock().retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<SessionEvent>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receiving end of [`SessionManager::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    registry: Weak<Subscribers>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}

struct SessionState {
    state: ConnectionState,
    retry_count: u32,
    challenge_attempts: u32,
    pending_challenge: Option<Challenge>,
    handle: Option<Arc<dyn TransportHandle>>,
    /// Bumped by every connect and disconnect. Timers and event pumps carry the
    /// epoch they were created in and go inert once it moves on.
    epoch: u64,
    connecting: bool,
    reconnect_timer: Option<TimerHandle>,
    /// In-memory credentials; `None` until first loaded.
    credentials: Option<SessionCredentials>,
}

struct Inner {
    cfg: SessionConfig,
    transport: Arc<dyn TransportClient>,
    repo: CredentialRepository,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<SessionState>,
    persist_lock: Mutex<()>,
    subscribers: Arc<Subscribers>,
}

/// Owns the single transport session of the process.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        cfg: SessionConfig,
        transport: Arc<dyn TransportClient>,
        repo: CredentialRepository,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                transport,
                repo,
                scheduler,
                state: Mutex::new(SessionState {
                    state: ConnectionState::Disconnected,
                    retry_count: 0,
                    challenge_attempts: 0,
                    pending_challenge: None,
                    handle: None,
                    epoch: 0,
                    connecting: false,
                    reconnect_timer: None,
                    credentials: None,
                }),
                persist_lock: Mutex::new(()),
                subscribers: Arc::new(Subscribers::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.subscribers.add()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.state
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.state.lock().await.retry_count
    }

    pub async fn pending_challenge(&self) -> Option<Challenge> {
        self.inner.state.lock().await.pending_challenge.clone()
    }

    /// Open a transport session. No-op while a session is connecting or open.
    ///
    /// Transport errors abort the attempt and are returned to the caller. A
    /// logged-out session is refused until [`Self::reset_credentials`] runs.
    pub async fn connect(&self) -> Result<()> {
        let epoch = {
            let mut st = self.inner.state.lock().await;
            if st.state == ConnectionState::LoggedOut {
                return Err(Error::Transport("logged out".to_string()));
            }
            if st.connecting || st.state.is_active() {
                debug!(state = %st.state, "connect ignored; session already active");
                return Ok(());
            }
            st.connecting = true;
            st.epoch += 1;
            st.pending_challenge = None;
            if let Some(timer) = st.reconnect_timer.take() {
                timer.cancel();
            }
            self.transition(&mut st, ConnectionState::Connecting);
            st.epoch
        };

        let creds = match self.current_credentials().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "no credential store is usable; aborting connect");
                self.abort_connect(epoch).await;
                return Err(e);
            }
        };

        let offered = (!creds.is_empty()).then(|| creds.clone());
        let TransportConnection { handle, events } = match self.inner.transport.open(offered).await
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "transport failed to open");
                self.abort_connect(epoch).await;
                return Err(e);
            }
        };

        {
            let mut st = self.inner.state.lock().await;
            st.connecting = false;
            if st.epoch != epoch {
                drop(st);
                info!("session was disconnected while connecting; closing the new transport");
                if let Err(e) = handle.close().await {
                    warn!(error = %e, "failed to close abandoned transport");
                }
                return Ok(());
            }
            st.handle = Some(handle.clone());
        }

        spawn_event_pump(Arc::downgrade(&self.inner), epoch, events);
        info!(
            registered = creds.is_registered(),
            "transport opened; waiting for session"
        );

        if let Some(phone) = self.inner.cfg.pairing_phone.as_deref() {
            if !creds.is_registered() {
                info!("requesting pairing code");
                if let Err(e) = handle.request_pairing_code(phone).await {
                    warn!(error = %e, "pairing code request failed; falling back to QR");
                }
            }
        }

        Ok(())
    }

    /// Tear the session down. Idempotent; cancels any scheduled reconnect.
    pub async fn disconnect(&self) {
        let handle = {
            let mut st = self.inner.state.lock().await;
            st.epoch += 1;
            if let Some(timer) = st.reconnect_timer.take() {
                timer.cancel();
            }
            st.pending_challenge = None;
            if st.state != ConnectionState::LoggedOut {
                self.transition(&mut st, ConnectionState::Disconnected);
            }
            st.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                warn!(error = %e, "transport close failed");
            }
            info!("session disconnected");
        }
    }

    /// Unlink this device. The transport answers with a logged-out close.
    pub async fn logout(&self) -> Result<()> {
        let handle = self.inner.state.lock().await.handle.clone();
        match handle {
            Some(h) => h.logout().await,
            None => Err(Error::Transport("not connected".to_string())),
        }
    }

    pub async fn send_text(&self, chat: &ChatId, text: &str) -> Result<()> {
        let handle = {
            let st = self.inner.state.lock().await;
            match (&st.handle, st.state) {
                (Some(h), ConnectionState::Connected) => h.clone(),
                _ => {
                    return Err(Error::Transport(format!(
                        "cannot send while {}",
                        st.state
                    )))
                }
            }
        };
        handle.send_text(chat, text).await
    }

    /// Schedule the next reconnect with exponential back-off. Returns `false`
    /// when nothing was scheduled (logged out, already pending, or out of retries).
    pub async fn attempt_reconnection(&self) -> bool {
        let (attempt, delay) = {
            let mut st = self.inner.state.lock().await;
            if st.state == ConnectionState::LoggedOut {
                debug!("not reconnecting; session is logged out");
                return false;
            }
            if st.reconnect_timer.is_some() {
                debug!("reconnect already scheduled");
                return false;
            }
            if st.retry_count >= self.inner.cfg.max_retries {
                let attempts = st.retry_count;
                self.transition(&mut st, ConnectionState::Disconnected);
                drop(st);
                error!(attempts, "giving up on reconnecting; manual restart required");
                self.emit(SessionEvent::ReconnectAbandoned { attempts });
                return false;
            }

            st.retry_count += 1;
            let attempt = st.retry_count;
            let delay = self.inner.cfg.backoff_delay(attempt);
            let task = reconnect_task(Arc::downgrade(&self.inner), st.epoch);
            st.reconnect_timer = Some(
                self.inner
                    .scheduler
                    .schedule_once(delay, Box::new(move || task)),
            );
            self.transition(&mut st, ConnectionState::Reconnecting);
            (attempt, delay)
        };

        info!(
            attempt,
            max = self.inner.cfg.max_retries,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
        true
    }

    /// Feed a transport event for the current session.
    ///
    /// The event pump calls this internally; it is public so callers that own
    /// their own event loop can drive the manager directly.
    pub async fn handle_event(&self, event: TransportEvent) {
        let epoch = self.inner.state.lock().await.epoch;
        self.dispatch(epoch, event).await;
    }

    /// Save the latest in-memory credentials now.
    pub async fn flush_credentials(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock().await;
        let latest = self.inner.state.lock().await.credentials.clone();
        match latest {
            Some(creds) => self.inner.repo.save(&creds).await,
            None => Ok(()),
        }
    }

    /// Forget stored credentials so the next connect starts a fresh pairing.
    /// Lifts the logged-out state.
    pub async fn reset_credentials(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock().await;
        {
            let mut st = self.inner.state.lock().await;
            st.credentials = None;
            st.challenge_attempts = 0;
            st.retry_count = 0;
            if st.state == ConnectionState::LoggedOut {
                self.transition(&mut st, ConnectionState::Disconnected);
            }
        }
        self.inner.repo.reset().await
    }

    async fn dispatch(&self, epoch: u64, event: TransportEvent) {
        if let TransportEvent::CredentialsUpdate(update) = event {
            self.on_credentials_update(update).await;
            return;
        }

        if self.inner.state.lock().await.epoch != epoch {
            debug!("dropping event from a superseded transport session");
            return;
        }

        match event {
            TransportEvent::Challenge(c) => self.on_challenge(epoch, c).await,
            TransportEvent::Open => self.on_open(epoch).await,
            TransportEvent::Close(reason) => self.on_close(epoch, reason).await,
            TransportEvent::Message(m) => self.emit(SessionEvent::Message(m)),
            TransportEvent::CredentialsUpdate(_) => {}
        }
    }

    async fn on_challenge(&self, epoch: u64, challenge: Challenge) {
        let mut st = self.inner.state.lock().await;
        if st.epoch != epoch {
            return;
        }
        if !matches!(
            st.state,
            ConnectionState::Connecting | ConnectionState::QrPending | ConnectionState::PairingPending
        ) {
            debug!(state = %st.state, "ignoring pairing challenge outside of pairing");
            return;
        }

        st.challenge_attempts += 1;
        let attempts = st.challenge_attempts;
        if attempts > self.inner.cfg.max_challenge_attempts {
            drop(st);
            error!(
                attempts,
                "pairing was not completed after repeated challenges; giving up"
            );
            self.disconnect().await;
            self.emit(SessionEvent::PairingFailed { attempts });
            return;
        }

        let next = match challenge {
            Challenge::Qr(_) => ConnectionState::QrPending,
            Challenge::PairingCode(_) => ConnectionState::PairingPending,
        };
        st.pending_challenge = Some(challenge.clone());
        self.transition(&mut st, next);
        drop(st);

        info!(
            attempt = attempts,
            max = self.inner.cfg.max_challenge_attempts,
            "pairing challenge received"
        );
        self.emit(SessionEvent::Challenge(challenge));
    }

    async fn on_open(&self, epoch: u64) {
        let mut st = self.inner.state.lock().await;
        if st.epoch != epoch {
            return;
        }
        st.retry_count = 0;
        st.challenge_attempts = 0;
        st.pending_challenge = None;
        if let Some(timer) = st.reconnect_timer.take() {
            timer.cancel();
        }
        self.transition(&mut st, ConnectionState::Connected);
        drop(st);
        info!("session connected");
    }

    async fn on_close(&self, epoch: u64, reason: DisconnectReason) {
        let handle = {
            let mut st = self.inner.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            st.pending_challenge = None;
            self.transition(&mut st, ConnectionState::Disconnected);
            if reason.is_terminal() {
                self.transition(&mut st, ConnectionState::LoggedOut);
            }
            st.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                debug!(error = %e, "closing dead transport failed");
            }
        }

        if reason.is_terminal() {
            error!(%reason, "session logged out; the device must be paired again");
            self.emit(SessionEvent::LoggedOut);
        } else {
            warn!(%reason, "connection closed");
            self.attempt_reconnection().await;
        }
    }

    async fn on_credentials_update(&self, update: CredentialUpdate) {
        {
            let mut st = self.inner.state.lock().await;
            st.credentials
                .get_or_insert_with(SessionCredentials::default)
                .apply(&update);
        }
        spawn_credential_save(self.clone());
    }

    async fn on_reconnect_timer(&self, epoch: u64) {
        {
            let mut st = self.inner.state.lock().await;
            if st.epoch != epoch {
                debug!("ignoring reconnect timer from a superseded session");
                return;
            }
            st.reconnect_timer = None;
        }

        if let Err(e) = self.connect().await {
            warn!(error = %e, "reconnect attempt failed");
            self.attempt_reconnection().await;
        }
    }

    /// The event stream ended without a close event.
    async fn on_stream_end(&self, epoch: u64) {
        let active = {
            let st = self.inner.state.lock().await;
            st.epoch == epoch && st.state.is_active()
        };
        if active {
            self.on_close(epoch, DisconnectReason::ConnectionLost).await;
        }
    }

    async fn current_credentials(&self) -> Result<SessionCredentials> {
        if let Some(c) = self.inner.state.lock().await.credentials.clone() {
            return Ok(c);
        }
        let loaded = self.inner.repo.load().await?;
        let mut st = self.inner.state.lock().await;
        Ok(st.credentials.get_or_insert(loaded).clone())
    }

    async fn abort_connect(&self, epoch: u64) {
        let mut st = self.inner.state.lock().await;
        st.connecting = false;
        if st.epoch == epoch {
            self.transition(&mut st, ConnectionState::Disconnected);
        }
    }

    fn transition(&self, st: &mut SessionState, next: ConnectionState) {
        if st.state == next {
            return;
        }
        debug!(from = %st.state, to = %next, "session state change");
        st.state = next;
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.subscribers.emit(event);
    }
}

fn reconnect_task(inner: Weak<Inner>, epoch: u64) -> TaskFuture {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        SessionManager { inner }.on_reconnect_timer(epoch).await;
    })
}

fn spawn_event_pump(
    inner: Weak<Inner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            SessionManager { inner }.dispatch(epoch, event).await;
        }
        if let Some(inner) = inner.upgrade() {
            SessionManager { inner }.on_stream_end(epoch).await;
        }
    });
}

fn spawn_credential_save(manager: SessionManager) {
    tokio::spawn(async move {
        if let Err(e) = manager.flush_credentials().await {
            warn!(error = %e, "failed to persist session credentials");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::{testing::BrokenStore, DurableStore, MemoryStore},
        timer::ManualScheduler,
        transport::testing::FakeTransport,
    };
    use serde_json::json;

    struct Harness {
        manager: SessionManager,
        transport: Arc<FakeTransport>,
        scheduler: Arc<ManualScheduler>,
        events: Subscription,
    }

    fn harness_with(
        cfg: SessionConfig,
        transport: FakeTransport,
        stores: Vec<Arc<dyn DurableStore>>,
    ) -> Harness {
        let transport = Arc::new(transport);
        let scheduler = Arc::new(ManualScheduler::new());
        let manager = SessionManager::new(
            cfg,
            transport.clone(),
            CredentialRepository::new(stores),
            scheduler.clone(),
        );
        let events = manager.subscribe();
        Harness {
            manager,
            transport,
            scheduler,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(
            SessionConfig::default(),
            FakeTransport::default(),
            vec![Arc::new(MemoryStore::new("memory"))],
        )
    }

    fn drain(sub: &mut Subscription) -> Vec<SessionEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    fn scheduled_delays(events: &[SessionEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ReconnectScheduled { delay, .. } => Some(delay.as_secs()),
                _ => None,
            })
            .collect()
    }

    async fn connected(h: &Harness) {
        h.manager.connect().await.unwrap();
        h.manager.handle_event(TransportEvent::Open).await;
        assert_eq!(h.manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn connect_is_noop_while_connecting_or_connected() {
        let h = harness();
        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.state().await, ConnectionState::Connecting);
        h.manager.connect().await.unwrap();
        assert_eq!(h.transport.open_count(), 1);

        h.manager.handle_event(TransportEvent::Open).await;
        h.manager.connect().await.unwrap();
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.retry_count().await, 0);
    }

    #[tokio::test]
    async fn connect_error_propagates_and_resets() {
        let h = harness_with(
            SessionConfig::default(),
            FakeTransport::failing(1),
            vec![Arc::new(MemoryStore::new("memory"))],
        );
        assert!(h.manager.connect().await.is_err());
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
        assert_eq!(h.scheduler.pending(), 0);

        h.manager.connect().await.unwrap();
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test]
    async fn connect_errors_when_every_credential_store_is_broken() {
        let h = harness_with(
            SessionConfig::default(),
            FakeTransport::default(),
            vec![Arc::new(BrokenStore::default())],
        );
        assert!(h.manager.connect().await.is_err());
        assert_eq!(h.transport.open_count(), 0);
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn logged_out_close_is_terminal() {
        let mut h = harness();
        connected(&h).await;
        drain(&mut h.events);

        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::LoggedOut))
            .await;

        assert_eq!(h.manager.state().await, ConnectionState::LoggedOut);
        assert_eq!(h.scheduler.pending(), 0);
        assert!(drain(&mut h.events).contains(&SessionEvent::LoggedOut));
        assert!(!h.manager.attempt_reconnection().await);

        h.scheduler.advance(Duration::from_secs(600)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.transport.last_handle().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn connection_lost_backs_off_up_to_cap() {
        let mut h = harness();
        connected(&h).await;

        for n in 1..=6 {
            h.manager
                .handle_event(TransportEvent::Close(DisconnectReason::ConnectionLost))
                .await;
            assert_eq!(h.manager.state().await, ConnectionState::Reconnecting);
            assert_eq!(h.scheduler.pending(), 1);

            let delay = h.manager.inner.cfg.backoff_delay(n);
            h.scheduler.advance(delay).await;
            assert_eq!(h.transport.open_count(), 1 + n as usize);
            assert_eq!(h.manager.state().await, ConnectionState::Connecting);
        }

        let delays = scheduled_delays(&drain(&mut h.events));
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert!(delays.windows(2).all(|w| w[0] < w[1] || w[1] == 60));
    }

    #[tokio::test]
    async fn successful_open_resets_retry_count() {
        let h = harness();
        connected(&h).await;
        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::RestartRequired))
            .await;
        h.scheduler.advance(Duration::from_secs(5)).await;
        assert_eq!(h.manager.retry_count().await, 1);

        h.manager.handle_event(TransportEvent::Open).await;
        assert_eq!(h.manager.retry_count().await, 0);
        assert_eq!(h.manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_reconnects_reschedule_until_retries_run_out() {
        let cfg = SessionConfig {
            max_retries: 3,
            ..SessionConfig::default()
        };
        let mut h = harness_with(cfg, FakeTransport::default(), vec![Arc::new(MemoryStore::new("m"))]);
        connected(&h).await;
        *h.transport.failures_left.lock().unwrap() = 100;

        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::ConnectionLost))
            .await;
        h.scheduler.advance(Duration::from_secs(600)).await;

        assert_eq!(h.transport.open_count(), 4);
        assert_eq!(h.manager.retry_count().await, 3);
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
        assert_eq!(h.scheduler.pending(), 0);

        let events = drain(&mut h.events);
        assert_eq!(scheduled_delays(&events), vec![5, 10, 20]);
        assert!(events.contains(&SessionEvent::ReconnectAbandoned { attempts: 3 }));
    }

    #[tokio::test]
    async fn disconnect_cancels_scheduled_reconnect() {
        let h = harness();
        connected(&h).await;
        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::ConnectionLost))
            .await;
        assert_eq!(h.scheduler.pending(), 1);

        h.manager.disconnect().await;
        h.manager.disconnect().await;
        assert_eq!(h.scheduler.pending(), 0);

        h.scheduler.advance(Duration::from_secs(600)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn only_one_reconnect_timer_at_a_time() {
        let h = harness();
        connected(&h).await;
        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::ConnectionLost))
            .await;
        assert!(!h.manager.attempt_reconnection().await);
        assert_eq!(h.scheduler.pending(), 1);
        assert_eq!(h.manager.retry_count().await, 1);
    }

    #[tokio::test]
    async fn challenges_move_to_pending_states_until_limit() {
        let cfg = SessionConfig {
            max_challenge_attempts: 2,
            ..SessionConfig::default()
        };
        let mut h = harness_with(cfg, FakeTransport::default(), vec![Arc::new(MemoryStore::new("m"))]);
        h.manager.connect().await.unwrap();

        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::Qr("qr-1".into())))
            .await;
        assert_eq!(h.manager.state().await, ConnectionState::QrPending);
        assert_eq!(
            h.manager.pending_challenge().await,
            Some(Challenge::Qr("qr-1".into()))
        );

        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::PairingCode("ABCD-1234".into())))
            .await;
        assert_eq!(h.manager.state().await, ConnectionState::PairingPending);

        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::Qr("qr-3".into())))
            .await;
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
        assert_eq!(h.manager.pending_challenge().await, None);
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.transport.last_handle().unwrap().close_count(), 1);

        let events = drain(&mut h.events);
        assert!(events.contains(&SessionEvent::Challenge(Challenge::Qr("qr-1".into()))));
        assert!(events.contains(&SessionEvent::PairingFailed { attempts: 3 }));
    }

    #[tokio::test]
    async fn challenge_budget_spans_reconnects() {
        let cfg = SessionConfig {
            max_challenge_attempts: 2,
            ..SessionConfig::default()
        };
        let mut h = harness_with(cfg, FakeTransport::default(), vec![Arc::new(MemoryStore::new("m"))]);
        h.manager.connect().await.unwrap();

        for round in 1..=2 {
            h.manager
                .handle_event(TransportEvent::Challenge(Challenge::Qr(format!("qr-{round}"))))
                .await;
            assert_eq!(h.manager.state().await, ConnectionState::QrPending);
            h.manager
                .handle_event(TransportEvent::Close(DisconnectReason::ConnectionLost))
                .await;
            h.scheduler.advance(Duration::from_secs(120)).await;
            assert_eq!(h.manager.state().await, ConnectionState::Connecting);
        }

        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::Qr("qr-3".into())))
            .await;
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
        assert_eq!(h.scheduler.pending(), 0);

        let events = drain(&mut h.events);
        let surfaced = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Challenge(_)))
            .count();
        assert_eq!(surfaced, 2);
        assert!(events.contains(&SessionEvent::PairingFailed { attempts: 3 }));

        let opens = h.transport.open_count();
        h.scheduler.advance(Duration::from_secs(600)).await;
        assert_eq!(h.transport.open_count(), opens);
    }

    #[tokio::test]
    async fn open_resets_challenge_budget() {
        let cfg = SessionConfig {
            max_challenge_attempts: 1,
            ..SessionConfig::default()
        };
        let h = harness_with(cfg, FakeTransport::default(), vec![Arc::new(MemoryStore::new("m"))]);
        h.manager.connect().await.unwrap();
        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::Qr("qr-1".into())))
            .await;
        h.manager.handle_event(TransportEvent::Open).await;
        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::RestartRequired))
            .await;
        h.scheduler.advance(Duration::from_secs(5)).await;

        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::Qr("qr-2".into())))
            .await;
        assert_eq!(h.manager.state().await, ConnectionState::QrPending);
    }

    #[tokio::test]
    async fn challenge_while_connected_is_ignored() {
        let mut h = harness();
        connected(&h).await;
        drain(&mut h.events);

        h.manager
            .handle_event(TransportEvent::Challenge(Challenge::Qr("late".into())))
            .await;
        assert_eq!(h.manager.state().await, ConnectionState::Connected);
        assert_eq!(h.manager.pending_challenge().await, None);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn logged_out_refuses_connect_until_reset() {
        let store = Arc::new(MemoryStore::new("file"));
        let h = harness_with(SessionConfig::default(), FakeTransport::default(), vec![store.clone()]);
        connected(&h).await;

        let mut update = CredentialUpdate::default();
        update.creds.insert("registered".into(), json!(true));
        h.manager
            .handle_event(TransportEvent::CredentialsUpdate(update))
            .await;
        h.manager.flush_credentials().await.unwrap();
        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::LoggedOut))
            .await;

        assert!(h.manager.connect().await.is_err());
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.state().await, ConnectionState::LoggedOut);

        h.manager.reset_credentials().await.unwrap();
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
        assert!(store.snapshot(crate::credentials::CREDENTIALS_KEY).is_none());

        h.manager.connect().await.unwrap();
        let opens = h.transport.opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens.last(), Some(&None));
        assert_eq!(h.manager.state().await, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn requests_pairing_code_for_unregistered_credentials() {
        let cfg = SessionConfig {
            pairing_phone: Some("15551234567".into()),
            ..SessionConfig::default()
        };
        let h = harness_with(cfg, FakeTransport::default(), vec![Arc::new(MemoryStore::new("m"))]);
        h.manager.connect().await.unwrap();

        let handle = h.transport.last_handle().unwrap();
        assert_eq!(
            *handle.pairing_requests.lock().unwrap(),
            vec!["15551234567".to_string()]
        );
    }

    #[tokio::test]
    async fn credential_save_failure_keeps_session_connected() {
        let broken = Arc::new(BrokenStore::default());
        let h = harness_with(
            SessionConfig::default(),
            FakeTransport::default(),
            vec![broken.clone()],
        );

        // In-memory credentials let connect proceed without a readable store.
        let mut update = CredentialUpdate::default();
        update.creds.insert("registered".into(), json!(true));
        h.manager
            .handle_event(TransportEvent::CredentialsUpdate(update.clone()))
            .await;
        connected(&h).await;

        h.manager
            .handle_event(TransportEvent::CredentialsUpdate(update))
            .await;
        assert!(h.manager.flush_credentials().await.is_err());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.manager.state().await, ConnectionState::Connected);
        assert!(broken.attempts() >= 1);
    }

    #[tokio::test]
    async fn credential_updates_are_persisted_and_reused() {
        let store = Arc::new(MemoryStore::new("file"));
        let h = harness_with(SessionConfig::default(), FakeTransport::default(), vec![store.clone()]);
        connected(&h).await;

        let mut update = CredentialUpdate::default();
        update.creds.insert("registrationId".into(), json!(5));
        update.keys.insert("session:a".into(), json!("k"));
        h.manager
            .handle_event(TransportEvent::CredentialsUpdate(update))
            .await;
        h.manager.flush_credentials().await.unwrap();

        let saved: SessionCredentials =
            serde_json::from_str(&store.snapshot(crate::credentials::CREDENTIALS_KEY).unwrap())
                .unwrap();
        assert_eq!(saved.registration_id(), Some(5));

        h.manager
            .handle_event(TransportEvent::Close(DisconnectReason::ConnectionLost))
            .await;
        h.scheduler.advance(Duration::from_secs(5)).await;
        let opens = h.transport.opens.lock().unwrap().clone();
        assert_eq!(opens.len(), 2);
        assert_eq!(
            opens[1].as_ref().and_then(|c| c.registration_id()),
            Some(5)
        );
    }

    #[tokio::test]
    async fn stale_events_are_ignored_after_disconnect() {
        let h = harness();
        h.manager.connect().await.unwrap();
        let old_sender = h.transport.last_sender().unwrap();
        h.manager.disconnect().await;

        old_sender.send(TransportEvent::Open).unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_requires_connected_session() {
        let h = harness();
        let chat = ChatId::new("1555@s.whatsapp.net");
        assert!(h.manager.send_text(&chat, "hi").await.is_err());

        connected(&h).await;
        h.manager.send_text(&chat, "hi").await.unwrap();
        assert_eq!(
            h.transport.last_handle().unwrap().sent(),
            vec![("1555@s.whatsapp.net".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let h = harness();
        assert_eq!(h.manager.subscriber_count(), 1);
        let extra = h.manager.subscribe();
        assert_eq!(h.manager.subscriber_count(), 2);
        drop(extra);
        assert_eq!(h.manager.subscriber_count(), 1);
    }
}
