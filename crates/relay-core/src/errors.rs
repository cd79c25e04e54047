/// Core error type.
///
/// Adapter crates map their specific errors into this type (usually
/// `Collaborator`) so the pipeline can treat every failure the same way:
/// log it, stop the event, and only tell the user when the message was
/// addressed to the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("duplicate handler: plugin {plugin} already registers command {command}")]
    DuplicateHandler { plugin: String, command: String },

    #[error("stage {stage} failed: {message}")]
    Stage { stage: &'static str, message: String },

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
}

impl Error {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
