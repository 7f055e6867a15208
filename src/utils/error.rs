//! Error types for syncplay
//!
//! This module defines the error type shared by the playback engine.
//! We use thiserror for the library error and anyhow for the binary's
//! top-level error handling.

use thiserror::Error;

/// Main error type for syncplay
#[derive(Error, Debug)]
pub enum PlayerError {
    /// The source could not be opened or probed
    #[error("Open error: {0}")]
    Open(String),

    /// Decoder errors
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Audio errors
    #[error("Audio error: {0}")]
    Audio(String),

    /// Presentation sink errors
    #[error("Renderer error: {0}")]
    Renderer(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File error: {0}")]
    FileIO(#[from] std::io::Error),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A queue or thread was shut down while the operation was pending
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for PlayerError {
    fn from(err: ffmpeg_next::Error) -> Self {
        PlayerError::Decoder(format!("FFmpeg error: {}", err))
    }
}

/// Convenience type alias for Results in syncplay
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Extension trait for converting other errors to PlayerError
pub trait IntoPlayerError<T> {
    /// Convert this error into a PlayerError with the given context
    fn open_err(self, context: &str) -> Result<T>;
    fn decoder_err(self, context: &str) -> Result<T>;
    fn audio_err(self, context: &str) -> Result<T>;
    fn renderer_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoPlayerError<T> for std::result::Result<T, E> {
    fn open_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Open(format!("{}: {}", context, e)))
    }

    fn decoder_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Decoder(format!("{}: {}", context, e)))
    }

    fn audio_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Audio(format!("{}: {}", context, e)))
    }

    fn renderer_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Renderer(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| PlayerError::Config(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::PlayerError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::PlayerError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
