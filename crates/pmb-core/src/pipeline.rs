//! Application layer: turns session events into guarded AI replies.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    commands::{format_status, help_text, parse_command, OwnerCommand},
    domain::{ChatId, InboundMessage, SenderId},
    guard::{AdmissionGuard, Reason},
    reply::{ReplyGenerator, ReplyRequest},
    session::{ConnectionState, SessionEvent, SessionManager, Subscription},
    state::BotStateStore,
    transport::Challenge,
    utils::{now_ms, redact, truncate_text},
    Result,
};

const APOLOGY: &str = "Sorry, I couldn't come up with a reply right now. Please try again later.";

/// What the pipeline needs from the live session.
#[async_trait]
pub trait SessionPort: Send + Sync {
    async fn send_text(&self, chat: &ChatId, text: &str) -> Result<()>;
    async fn connection_state(&self) -> ConnectionState;
    async fn logout(&self) -> Result<()>;
}

#[async_trait]
impl SessionPort for SessionManager {
    async fn send_text(&self, chat: &ChatId, text: &str) -> Result<()> {
        SessionManager::send_text(self, chat, text).await
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state().await
    }

    async fn logout(&self) -> Result<()> {
        SessionManager::logout(self).await
    }
}

/// Serializes handling per chat so replies keep message order.
///
/// Entries nobody holds or waits on are pruned whenever a new chat is added.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<ChatId, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat: &ChatId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            if !map.contains_key(chat) {
                map.retain(|_, l| Arc::strong_count(l) > 1);
            }
            map.entry(chat.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Command,
    Inactive,
    GroupSkipped,
    Rejected(Reason),
    Replied,
    ReplyFailed,
}

pub struct MessagePipeline {
    owner: SenderId,
    reply_in_groups: bool,
    guard: Arc<AdmissionGuard>,
    state: BotStateStore,
    replies: Arc<dyn ReplyGenerator>,
    session: Arc<dyn SessionPort>,
    chat_locks: ChatLocks,
}

impl MessagePipeline {
    pub fn new(
        owner: SenderId,
        reply_in_groups: bool,
        guard: Arc<AdmissionGuard>,
        state: BotStateStore,
        replies: Arc<dyn ReplyGenerator>,
        session: Arc<dyn SessionPort>,
    ) -> Self {
        Self {
            owner,
            reply_in_groups,
            guard,
            state,
            replies,
            session,
            chat_locks: ChatLocks::default(),
        }
    }

    /// Consume session events until the subscription closes. Each message is
    /// handled on its own task.
    pub async fn run(self: Arc<Self>, mut events: Subscription) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Message(msg) => {
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        pipeline.handle_message(msg).await;
                    });
                }
                SessionEvent::StateChanged(state) => info!(%state, "connection state changed"),
                SessionEvent::Challenge(Challenge::Qr(payload)) => {
                    info!(
                        bytes = payload.len(),
                        "QR challenge received; scan it from the linked-devices screen"
                    );
                }
                SessionEvent::Challenge(Challenge::PairingCode(code)) => {
                    info!(%code, "pairing code received; enter it from the linked-devices screen");
                }
                SessionEvent::LoggedOut => {
                    error!("device was logged out; restart with RESET_CREDENTIALS=1 to pair again");
                }
                SessionEvent::PairingFailed { attempts } => {
                    error!(attempts, "pairing failed; restart to try again");
                }
                SessionEvent::ReconnectScheduled { attempt, delay } => {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect pending");
                }
                SessionEvent::ReconnectAbandoned { attempts } => {
                    error!(attempts, "reconnection abandoned; restart required");
                }
            }
        }
        debug!("session event stream closed");
    }

    pub async fn handle_message(&self, msg: InboundMessage) -> Outcome {
        let text = msg.text.trim();
        if msg.from_me || text.is_empty() {
            return Outcome::Ignored;
        }

        let is_owner = msg.sender == self.owner;
        if is_owner {
            if let Some(parsed) = parse_command(text) {
                let reply = match parsed {
                    Ok(cmd) => self.run_command(cmd).await,
                    Err(usage) => usage,
                };
                self.send(&msg.chat_id, &reply).await;
                return Outcome::Command;
            }
        }

        if !is_owner && !self.state.get_state().is_active {
            debug!(sender = %redact(&msg.sender), "bot inactive; dropping message");
            return Outcome::Inactive;
        }
        if msg.is_group && !self.reply_in_groups {
            return Outcome::GroupSkipped;
        }

        let _chat_guard = self.chat_locks.lock_chat(&msg.chat_id).await;

        let decision =
            self.guard
                .check_message(&msg.sender, text, msg.is_group, now_ms(), is_owner);
        if !decision.allowed {
            if let Some(reply) = &decision.reply {
                self.send(&msg.chat_id, reply).await;
            }
            return Outcome::Rejected(decision.reason);
        }

        self.state.increment_messages().await;

        let req = ReplyRequest {
            chat_id: msg.chat_id.clone(),
            sender: msg.sender.clone(),
            sender_name: msg.push_name.clone(),
            text: text.to_string(),
            is_group: msg.is_group,
        };
        info!(
            sender = %redact(&msg.sender),
            group = msg.is_group,
            preview = %truncate_text(text, 40),
            "generating reply"
        );

        match self.replies.generate(&req).await {
            Ok(reply) if !reply.trim().is_empty() => {
                self.send(&msg.chat_id, reply.trim()).await;
                Outcome::Replied
            }
            Ok(_) => {
                warn!("reply generator returned an empty reply");
                self.send(&msg.chat_id, APOLOGY).await;
                Outcome::ReplyFailed
            }
            Err(e) => {
                warn!(error = %e, "reply generation failed");
                self.send(&msg.chat_id, APOLOGY).await;
                Outcome::ReplyFailed
            }
        }
    }

    async fn run_command(&self, cmd: OwnerCommand) -> String {
        let actor = self.owner.as_str();
        match cmd {
            OwnerCommand::On => {
                self.state.toggle(true, actor).await;
                "Bot is ON. I'll reply to incoming messages.".to_string()
            }
            OwnerCommand::Off => {
                self.state.toggle(false, actor).await;
                "Bot is OFF. Incoming messages will be ignored.".to_string()
            }
            OwnerCommand::Status => format_status(
                &self.state.get_state(),
                self.session.connection_state().await,
                self.guard.stats(now_ms()),
            ),
            OwnerCommand::Unblock(sender) => {
                if self.guard.unblock(&sender) {
                    format!("Unblocked {sender}.")
                } else {
                    format!("{sender} was not blocked.")
                }
            }
            OwnerCommand::Block { sender, minutes } => {
                if sender == self.owner {
                    return "You can't block yourself.".to_string();
                }
                self.guard.block(
                    &sender,
                    Duration::from_secs(minutes * 60),
                    "blocked by owner",
                );
                format!("Blocked {sender} for {minutes} minutes.")
            }
            OwnerCommand::Logout => match self.session.logout().await {
                Ok(()) => "Logging out. Pair the device again to reconnect.".to_string(),
                Err(e) => format!("Logout failed: {e}"),
            },
            OwnerCommand::Help => help_text(),
        }
    }

    async fn send(&self, chat: &ChatId, text: &str) {
        if let Err(e) = self.session.send_text(chat, text).await {
            warn!(error = %e, "failed to send message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{GuardConfig, StateConfig},
        errors::Error,
        store::MemoryStore,
        timer::ManualScheduler,
    };
    use std::sync::Mutex as StdMutex;

    const OWNER: &str = "owner@s.whatsapp.net";

    #[derive(Default)]
    struct FakeSession {
        sent: StdMutex<Vec<(String, String)>>,
        logouts: StdMutex<usize>,
    }

    impl FakeSession {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        fn last_text(&self) -> Option<String> {
            self.sent().last().map(|(_, t)| t.clone())
        }
    }

    #[async_trait]
    impl SessionPort for FakeSession {
        async fn send_text(&self, chat: &ChatId, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((chat.as_str().to_string(), text.to_string()));
            Ok(())
        }

        async fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn logout(&self) -> Result<()> {
            *self.logouts.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct EchoReplies {
        fail: bool,
        calls: StdMutex<Vec<ReplyRequest>>,
    }

    #[async_trait]
    impl ReplyGenerator for EchoReplies {
        async fn generate(&self, req: &ReplyRequest) -> Result<String> {
            self.calls.lock().unwrap().push(req.clone());
            if self.fail {
                return Err(Error::External("model unavailable".into()));
            }
            Ok(format!("echo: {}", req.text))
        }
    }

    struct Harness {
        pipeline: MessagePipeline,
        session: Arc<FakeSession>,
        replies: Arc<EchoReplies>,
        state: BotStateStore,
        guard: Arc<AdmissionGuard>,
    }

    async fn harness_with(reply_in_groups: bool, fail: bool) -> Harness {
        let guard = Arc::new(AdmissionGuard::new(GuardConfig::default()));
        let state = BotStateStore::init(
            StateConfig::default(),
            &GuardConfig::default(),
            None,
            Arc::new(MemoryStore::new("fallback")),
            Arc::new(ManualScheduler::new()),
        )
        .await;
        let session = Arc::new(FakeSession::default());
        let replies = Arc::new(EchoReplies {
            fail,
            calls: StdMutex::new(Vec::new()),
        });
        let pipeline = MessagePipeline::new(
            SenderId::new(OWNER),
            reply_in_groups,
            guard.clone(),
            state.clone(),
            replies.clone(),
            session.clone(),
        );
        Harness {
            pipeline,
            session,
            replies,
            state,
            guard,
        }
    }

    async fn harness() -> Harness {
        harness_with(false, false).await
    }

    fn message(sender: &str, text: &str) -> InboundMessage {
        InboundMessage {
            id: format!("id-{text}"),
            chat_id: ChatId::new(sender),
            sender: SenderId::new(sender),
            push_name: Some("Alice".into()),
            text: text.to_string(),
            is_group: false,
            from_me: false,
            timestamp_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn admitted_message_gets_ai_reply_and_is_counted() {
        let h = harness().await;
        let out = h
            .pipeline
            .handle_message(message("alice@s", "what's the weather?"))
            .await;

        assert_eq!(out, Outcome::Replied);
        assert_eq!(
            h.session.sent(),
            vec![("alice@s".to_string(), "echo: what's the weather?".to_string())]
        );
        assert_eq!(h.state.get_state().total_messages, 1);
        assert_eq!(
            h.replies.calls.lock().unwrap()[0].sender_name.as_deref(),
            Some("Alice")
        );
    }

    #[tokio::test]
    async fn own_and_empty_messages_are_ignored() {
        let h = harness().await;
        let mut mine = message("alice@s", "hello");
        mine.from_me = true;
        assert_eq!(h.pipeline.handle_message(mine).await, Outcome::Ignored);
        assert_eq!(
            h.pipeline.handle_message(message("alice@s", "   ")).await,
            Outcome::Ignored
        );
        assert!(h.session.sent().is_empty());
    }

    #[tokio::test]
    async fn owner_toggles_bot_off_and_on() {
        let h = harness().await;
        assert_eq!(
            h.pipeline.handle_message(message(OWNER, "!off")).await,
            Outcome::Command
        );
        assert!(!h.state.get_state().is_active);
        assert_eq!(h.state.get_state().last_toggled_by.as_deref(), Some(OWNER));

        assert_eq!(
            h.pipeline.handle_message(message("alice@s", "hi")).await,
            Outcome::Inactive
        );
        assert_eq!(
            h.pipeline.handle_message(message(OWNER, "still there?")).await,
            Outcome::Replied
        );

        h.pipeline.handle_message(message(OWNER, "!on")).await;
        assert_eq!(
            h.pipeline.handle_message(message("alice@s", "hi")).await,
            Outcome::Replied
        );
    }

    #[tokio::test]
    async fn commands_from_others_are_plain_messages() {
        let h = harness().await;
        h.pipeline.handle_message(message("alice@s", "!off")).await;
        assert!(h.state.get_state().is_active);
        assert_eq!(h.session.last_text().as_deref(), Some("echo: !off"));
    }

    #[tokio::test]
    async fn status_and_usage_errors_reply_to_owner() {
        let h = harness().await;
        h.pipeline.handle_message(message(OWNER, "!status")).await;
        assert!(h.session.last_text().unwrap().contains("Connection: connected"));

        h.pipeline.handle_message(message(OWNER, "!block someone")).await;
        assert!(h.session.last_text().unwrap().starts_with("Usage"));
    }

    #[tokio::test]
    async fn owner_block_and_unblock() {
        let h = harness().await;
        h.pipeline
            .handle_message(message(OWNER, "!block alice@s 15"))
            .await;
        assert_eq!(
            h.pipeline.handle_message(message("alice@s", "hi")).await,
            Outcome::Rejected(Reason::Blocked)
        );

        h.pipeline
            .handle_message(message(OWNER, "!unblock alice@s"))
            .await;
        assert_eq!(h.session.last_text().as_deref(), Some("Unblocked alice@s."));
        assert_eq!(
            h.pipeline.handle_message(message("alice@s", "hi")).await,
            Outcome::Replied
        );
    }

    #[tokio::test]
    async fn group_messages_need_opt_in() {
        let h = harness().await;
        let mut msg = message("alice@s", "hello group");
        msg.is_group = true;
        msg.chat_id = ChatId::new("123@g.us");
        assert_eq!(
            h.pipeline.handle_message(msg.clone()).await,
            Outcome::GroupSkipped
        );

        let h = harness_with(true, false).await;
        assert_eq!(h.pipeline.handle_message(msg).await, Outcome::Replied);
        assert_eq!(h.session.sent()[0].0, "123@g.us");
    }

    #[tokio::test]
    async fn rejected_message_sends_guard_reply_without_ai_call() {
        let h = harness().await;
        let out = h
            .pipeline
            .handle_message(message("alice@s", "click here for free money"))
            .await;

        assert_eq!(out, Outcome::Rejected(Reason::SpamContent));
        assert!(h.replies.calls.lock().unwrap().is_empty());
        assert_eq!(h.state.get_state().total_messages, 0);
        assert!(h.session.last_text().unwrap().contains("spam"));
    }

    #[tokio::test]
    async fn generation_failure_sends_apology() {
        let h = harness_with(false, true).await;
        assert_eq!(
            h.pipeline.handle_message(message("alice@s", "hello")).await,
            Outcome::ReplyFailed
        );
        assert_eq!(h.session.last_text().as_deref(), Some(APOLOGY));
        assert_eq!(h.guard.stats(now_ms()).tracked_senders, 1);
    }

    #[tokio::test]
    async fn idle_chat_locks_are_pruned() {
        let locks = ChatLocks::default();
        drop(locks.lock_chat(&ChatId::new("a@s")).await);

        let held = locks.lock_chat(&ChatId::new("b@s")).await;
        assert_eq!(locks.len().await, 1);

        let other = locks.lock_chat(&ChatId::new("a@s")).await;
        assert_eq!(locks.len().await, 2);

        drop(held);
        drop(other);
        drop(locks.lock_chat(&ChatId::new("c@s")).await);
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn logout_command_reaches_session() {
        let h = harness().await;
        h.pipeline.handle_message(message(OWNER, "!logout")).await;
        assert_eq!(*h.session.logouts.lock().unwrap(), 1);
    }
}
