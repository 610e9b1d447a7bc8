//! Transport adapter over a protocol sidecar.
//!
//! The sidecar speaks newline-delimited JSON: commands on stdin
//! (`connect`, `pair`, `send`, `close`, `logout`) and events on stdout
//! (`qr`, `pairing_code`, `open`, `close`, `creds`, `message`).

use std::{collections::VecDeque, process::Stdio, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pmb_core::{
    config::BridgeConfig,
    credentials::{CredentialUpdate, SessionCredentials},
    domain::{ChatId, InboundMessage, SenderId},
    errors::Error,
    transport::{
        Challenge, DisconnectReason, TransportClient, TransportConnection, TransportEvent,
        TransportHandle,
    },
    utils::{now_ms, truncate_text},
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Launches one sidecar process per transport session.
#[derive(Clone, Debug)]
pub struct BridgeTransport {
    cfg: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl TransportClient for BridgeTransport {
    async fn open(&self, credentials: Option<SessionCredentials>) -> Result<TransportConnection> {
        let mut cmd = Command::new(&self.cfg.command);
        cmd.args(&self.cfg.args)
            .current_dir(&self.cfg.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!(
                "failed to start bridge {}: {e}",
                self.cfg.command.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("bridge stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        let tail = Arc::new(Mutex::new(StderrTail::default()));
        if let Some(stderr) = stderr {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            });
        }

        let handle = Arc::new(BridgeHandle {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            stop: CancellationToken::new(),
            tail: tail.clone(),
        });

        let (tx, events) = mpsc::unbounded_channel();
        let stop = handle.stop.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                  _ = stop.cancelled() => break,
                  line = reader.next_line() => {
                    let line = match line {
                      Ok(Some(line)) => line,
                      Ok(None) => {
                        let stderr = tail.lock().await.snapshot();
                        if stderr.trim().is_empty() {
                          info!("bridge output closed");
                        } else {
                          warn!(stderr = %truncate_text(&stderr, 2000), "bridge output closed");
                        }
                        break;
                      }
                      Err(e) => {
                        warn!(error = %e, "bridge stdout read failed");
                        break;
                      }
                    };
                    if line.trim().is_empty() {
                      continue;
                    }
                    match parse_event(&line) {
                      Ok(Some(event)) => {
                        if tx.send(event).is_err() {
                          break;
                        }
                      }
                      Ok(None) => debug!(line = %truncate_text(&line, 200), "ignoring unknown bridge event"),
                      Err(e) => warn!(error = %e, line = %truncate_text(&line, 200), "malformed bridge event"),
                    }
                  }
                }
            }
        });

        handle
            .write_command(&json!({ "cmd": "connect", "credentials": credentials }))
            .await?;

        Ok(TransportConnection { handle, events })
    }
}

/// Command side of a running sidecar.
pub struct BridgeHandle {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    stop: CancellationToken,
    tail: Arc<Mutex<StderrTail>>,
}

impl BridgeHandle {
    async fn write_command(&self, cmd: &Value) -> Result<()> {
        let mut line = serde_json::to_string(cmd)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Transport("bridge is closed".to_string()))?;
        if let Err(e) = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await
        {
            let stderr = self.tail.lock().await.snapshot();
            let mut msg = format!("bridge write failed: {e}");
            if !stderr.trim().is_empty() {
                msg.push_str("\nstderr (tail):\n");
                msg.push_str(&truncate_text(&stderr, 2000));
            }
            return Err(Error::Transport(msg));
        }
        Ok(())
    }

    async fn kill_child(&self) -> Result<()> {
        self.stop.cancel();
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };

        if child.try_wait()?.is_some() {
            return Ok(());
        }

        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if child.try_wait()?.is_none() {
                    *self.child.lock().await = Some(child);
                    return Err(Error::Io(e));
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TransportHandle for BridgeHandle {
    async fn send_text(&self, chat: &ChatId, text: &str) -> Result<()> {
        self.write_command(&json!({ "cmd": "send", "to": chat.as_str(), "text": text }))
            .await
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<()> {
        self.write_command(&json!({ "cmd": "pair", "phone": phone }))
            .await
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.write_command(&json!({ "cmd": "close" })).await {
            debug!(error = %e, "bridge close command not delivered");
        }
        self.kill_child().await
    }

    async fn logout(&self) -> Result<()> {
        self.write_command(&json!({ "cmd": "logout" })).await
    }
}

/// Map one NDJSON line from the sidecar. Unknown event types yield `None`.
pub fn parse_event(line: &str) -> Result<Option<TransportEvent>> {
    let v: Value = serde_json::from_str(line)?;
    let Some(kind) = v.get("type").and_then(Value::as_str) else {
        return Err(Error::Transport("bridge event without `type`".to_string()));
    };

    let event = match kind {
        "qr" => TransportEvent::Challenge(Challenge::Qr(required_str(&v, kind, "data")?)),
        "pairing_code" => {
            TransportEvent::Challenge(Challenge::PairingCode(required_str(&v, kind, "code")?))
        }
        "open" => TransportEvent::Open,
        "close" => {
            let status = v
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(428);
            TransportEvent::Close(DisconnectReason::from_status(status))
        }
        "creds" => TransportEvent::CredentialsUpdate(CredentialUpdate {
            creds: v
                .get("creds")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            keys: v
                .get("keys")
                .and_then(Value::as_object)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }),
        "message" => {
            let chat = required_str(&v, kind, "chat")?;
            let sender = v
                .get("sender")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| chat.clone());
            let is_group = v
                .get("group")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| chat.ends_with("@g.us"));
            TransportEvent::Message(InboundMessage {
                id: v
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                chat_id: ChatId::new(chat),
                sender: SenderId::new(sender),
                push_name: v
                    .get("push_name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                text: v
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_group,
                from_me: v.get("from_me").and_then(Value::as_bool).unwrap_or(false),
                timestamp_ms: v
                    .get("timestamp")
                    .and_then(Value::as_u64)
                    .unwrap_or_else(now_ms),
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn required_str(v: &Value, kind: &str, field: &str) -> Result<String> {
    v.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Transport(format!("bridge `{kind}` event missing `{field}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_challenges_and_lifecycle() {
        assert_eq!(
            parse_event(r#"{"type":"qr","data":"2@abc"}"#).unwrap(),
            Some(TransportEvent::Challenge(Challenge::Qr("2@abc".into())))
        );
        assert_eq!(
            parse_event(r#"{"type":"pairing_code","code":"WXYZ-1234"}"#).unwrap(),
            Some(TransportEvent::Challenge(Challenge::PairingCode(
                "WXYZ-1234".into()
            )))
        );
        assert_eq!(
            parse_event(r#"{"type":"open"}"#).unwrap(),
            Some(TransportEvent::Open)
        );
        assert_eq!(
            parse_event(r#"{"type":"close","status":401}"#).unwrap(),
            Some(TransportEvent::Close(DisconnectReason::LoggedOut))
        );
        assert_eq!(
            parse_event(r#"{"type":"close"}"#).unwrap(),
            Some(TransportEvent::Close(DisconnectReason::ConnectionClosed))
        );
    }

    #[test]
    fn parses_credential_updates() {
        let ev = parse_event(
            r#"{"type":"creds","creds":{"registrationId":12},"keys":{"pre-key:1":null}}"#,
        )
        .unwrap();
        let Some(TransportEvent::CredentialsUpdate(update)) = ev else {
            panic!("expected credentials update, got {ev:?}");
        };
        assert_eq!(update.creds["registrationId"], json!(12));
        assert_eq!(update.keys.get("pre-key:1"), Some(&Value::Null));
    }

    #[test]
    fn parses_messages_with_defaults() {
        let ev = parse_event(
            r#"{"type":"message","id":"M1","chat":"123@g.us","sender":"1555@s.whatsapp.net","text":"hi","timestamp":1700000000000,"push_name":"Al"}"#,
        )
        .unwrap();
        let Some(TransportEvent::Message(msg)) = ev else {
            panic!("expected message, got {ev:?}");
        };
        assert_eq!(msg.id, "M1");
        assert!(msg.is_group);
        assert!(!msg.from_me);
        assert_eq!(msg.sender.as_str(), "1555@s.whatsapp.net");
        assert_eq!(msg.push_name.as_deref(), Some("Al"));
        assert_eq!(msg.timestamp_ms, 1_700_000_000_000);

        let Some(TransportEvent::Message(direct)) =
            parse_event(r#"{"type":"message","chat":"1555@s.whatsapp.net","text":"yo"}"#).unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(direct.sender.as_str(), "1555@s.whatsapp.net");
        assert!(!direct.is_group);
    }

    #[test]
    fn rejects_malformed_and_skips_unknown() {
        assert!(parse_event("not json").is_err());
        assert!(parse_event(r#"{"data":"x"}"#).is_err());
        assert!(parse_event(r#"{"type":"qr"}"#).is_err());
        assert!(parse_event(r#"{"type":"message","text":"no chat"}"#).is_err());
        assert_eq!(parse_event(r#"{"type":"presence"}"#).unwrap(), None);
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_MAX_LINES + 50) {
            tail.push_line(format!("line {i}"));
        }
        assert_eq!(tail.lines.len(), STDERR_TAIL_MAX_LINES);
        assert!(tail.snapshot().ends_with(&format!("line {}", STDERR_TAIL_MAX_LINES + 49)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drives_a_sidecar_process() {
        let transport = BridgeTransport::new(BridgeConfig {
            command: "sh".into(),
            args: vec![
                "-c".to_string(),
                r#"read connect; echo '{"type":"open"}'; read cmd; echo "$cmd" >&2; sleep 5"#
                    .to_string(),
            ],
            working_dir: std::env::temp_dir(),
        });

        let mut conn = transport.open(None).await.unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), conn.events.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(TransportEvent::Open));

        conn.handle
            .send_text(&ChatId::new("1555@s.whatsapp.net"), "hello")
            .await
            .unwrap();
        conn.handle.close().await.unwrap();
        assert!(conn.handle.send_text(&ChatId::new("x"), "late").await.is_err());
    }
}
