use crate::SessionState;

/// Result alias that carries the custom [`SlidecastError`] type.
pub type Result<T> = std::result::Result<T, SlidecastError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SlidecastError {
    /// Session parameters that can never produce a recording, such as an
    /// empty slide list or a non-positive duration.
    #[error("invalid session parameters: {0}")]
    Validation(String),
    /// The encoder could not be built, rejected input, or stopped responding.
    #[error("encoder failure: {0}")]
    Encoder(String),
    /// The drawing surface could not be allocated or read back.
    #[error("surface failure: {0}")]
    Surface(String),
    /// A voice input could not be opened. Sessions degrade to music-only
    /// audio instead of surfacing this.
    #[error("voice input unavailable: {0}")]
    Input(String),
    /// No speaker could be opened for the preview monitor.
    #[error("audio output unavailable: {0}")]
    Output(String),
    /// The operation is not allowed once the session reached `state`.
    #[error("session is {0:?}; start a new session instead")]
    InvalidState(SessionState),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Wav(#[from] hound::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl SlidecastError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    pub fn encoder<T: Into<String>>(msg: T) -> Self {
        Self::Encoder(msg.into())
    }
}

impl From<&str> for SlidecastError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SlidecastError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
