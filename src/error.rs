use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlackboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Publish error: {message}")]
    Publish { message: String },

    #[error("Transport error in {transport}: {message}")]
    Transport { transport: String, message: String },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("System error: {message}")]
    System { message: String },
}

impl BlackboxError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn publish<S: Into<String>>(message: S) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }

    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlackboxError>;
