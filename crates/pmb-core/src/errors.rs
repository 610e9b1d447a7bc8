/// Core error type for the bot.
///
/// Adapter crates should map their specific errors into this type so the core
/// can decide consistently between "degrade and log" and "propagate".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error ({store}): {reason}")]
    Store { store: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("guard error: {0}")]
    Guard(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn store(store: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Store {
            store: store.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
