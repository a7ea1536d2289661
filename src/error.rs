use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Bytes that cannot be interpreted as an HTTP message.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The buffer holds only a prefix of a message; retry with more bytes.
    #[error("Incomplete message: {0}")]
    Incomplete(String),

    #[error("HTTP/2 error: {0}")]
    H2(String),

    /// The proxy under test behaved differently than computed.
    #[error("{0}")]
    Mismatch(#[from] crate::message::Mismatch),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    /// The harness itself is broken, as opposed to the proxy misbehaving.
    #[error("Framework error: {0}")]
    Framework(String),
}

impl Error {
    pub fn parse<T: fmt::Display>(msg: T) -> Self {
        Error::Parse(msg.to_string())
    }

    pub fn incomplete<T: fmt::Display>(msg: T) -> Self {
        Error::Incomplete(msg.to_string())
    }

    pub fn h2<T: fmt::Display>(msg: T) -> Self {
        Error::H2(msg.to_string())
    }

    pub fn assertion<T: fmt::Display>(msg: T) -> Self {
        Error::Assertion(msg.to_string())
    }

    pub fn framework<T: fmt::Display>(msg: T) -> Self {
        Error::Framework(msg.to_string())
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete(_))
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, Error::Parse(_) | Error::Incomplete(_))
    }
}
