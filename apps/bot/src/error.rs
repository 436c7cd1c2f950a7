use thiserror::Error;

/// Invalid or missing configuration. Always fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(name: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self::Invalid {
            name,
            value: value.into(),
            reason,
        }
    }
}

/// Connection registration failure. The caller owns the socket and must close it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(String),
    #[error("socket for connection {0} is already closed")]
    SocketClosed(String),
}

/// A command descriptor that cannot be built.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command {name}: invalid pattern {pattern:?}: {source}")]
    Pattern {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("command {0} has no patterns")]
    NoPatterns(String),
    #[error("command {0} has no handler")]
    NoHandler(String),
}

/// Transport-level failures (bind, dial, handshake).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("client mode requires a WebSocket URL")]
    MissingUrl,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Anything that stops the binary from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
