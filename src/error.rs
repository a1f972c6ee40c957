use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame source error: {0}")]
    SourceError(String),

    #[error("Broadcaster closed")]
    BroadcasterClosed,

    #[error("Encoder error: {0}")]
    EncoderError(String),

    /// Every (codec, candidate, reason) triple collected while negotiating
    #[error("Codec negotiation failed:\n{}", .0.join("\n\n"))]
    Negotiation(Vec<String>),

    #[error("Binding error: {0}")]
    BindingError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("WHIP protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtcError(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
