//! Owner commands (`!on`, `!status`, ...) sent to the bot from the owner's account.

use std::time::Duration;

use crate::{
    domain::SenderId,
    guard::GuardStats,
    session::ConnectionState,
    state::BotState,
};

pub const COMMAND_PREFIX: char = '!';
const MAX_BLOCK_MINUTES: u64 = 7 * 24 * 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerCommand {
    On,
    Off,
    Status,
    Unblock(SenderId),
    Block { sender: SenderId, minutes: u64 },
    Logout,
    Help,
}

/// Parse an owner command.
///
/// Returns `None` when `text` is not a known command (it is then handled like
/// any other message) and `Some(Err(usage))` when a known command has bad arguments.
pub fn parse_command(text: &str) -> Option<Result<OwnerCommand, String>> {
    let body = text.trim().strip_prefix(COMMAND_PREFIX)?;
    let mut parts = body.split_whitespace();
    let cmd = parts.next()?.to_lowercase();
    let args: Vec<&str> = parts.collect();

    let parsed = match cmd.as_str() {
        "on" => Ok(OwnerCommand::On),
        "off" => Ok(OwnerCommand::Off),
        "status" => Ok(OwnerCommand::Status),
        "help" => Ok(OwnerCommand::Help),
        "logout" => Ok(OwnerCommand::Logout),
        "unblock" => match args.as_slice() {
            [id] => Ok(OwnerCommand::Unblock(SenderId::new(*id))),
            _ => Err("Usage: !unblock <sender-id>".to_string()),
        },
        "block" => match args.as_slice() {
            [id, minutes] => match minutes.parse::<u64>() {
                Ok(m) if (1..=MAX_BLOCK_MINUTES).contains(&m) => Ok(OwnerCommand::Block {
                    sender: SenderId::new(*id),
                    minutes: m,
                }),
                _ => Err(format!(
                    "Minutes must be a number between 1 and {MAX_BLOCK_MINUTES}."
                )),
            },
            _ => Err("Usage: !block <sender-id> <minutes>".to_string()),
        },
        _ => return None,
    };
    Some(parsed)
}

pub fn help_text() -> String {
    [
        "Owner commands:",
        "!on - start replying to messages",
        "!off - stop replying (owner messages still work)",
        "!status - show bot, connection and guard status",
        "!block <sender-id> <minutes> - block a sender",
        "!unblock <sender-id> - lift a block",
        "!logout - unlink this device",
        "!help - show this list",
    ]
    .join("\n")
}

pub fn format_status(state: &BotState, connection: ConnectionState, guard: GuardStats) -> String {
    let toggled_ago = chrono::Utc::now()
        .signed_duration_since(state.last_toggled_at)
        .to_std()
        .unwrap_or_default();
    let by = state
        .last_toggled_by
        .as_deref()
        .map(|b| format!(" by {b}"))
        .unwrap_or_default();
    let rate = if state.rate_limit.enabled {
        format!(
            "{}/min, {}/hour",
            state.rate_limit.per_minute, state.rate_limit.per_hour
        )
    } else {
        "off".to_string()
    };

    format!(
        "Bot: {}\nConnection: {}\nMessages handled: {}\nLast toggled: {} ago{}\nRate limit: {}\nTracked senders: {}\nActive blocks: {}",
        if state.is_active { "ON" } else { "OFF" },
        connection,
        state.total_messages,
        format_duration(toggled_ago),
        by,
        rate,
        guard.tracked_senders,
        guard.active_blocks,
    )
}

fn format_duration(d: Duration) -> String {
    let seconds = d.as_secs();
    let hours = seconds / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        return format!("{hours}h {mins}m");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}
