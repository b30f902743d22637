//! Failure taxonomy of the acquisition pipeline.

use thiserror::Error;

pub type AcquireResult<T> = Result<T, AcquireError>;

/// Terminal failures surfaced to whoever asked for an acquisition.
///
/// Transient encoder trouble never shows up here: the compressor retries and
/// then falls back to the untouched input instead.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The resolver does not recognize the source.
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),
    /// The source wants a login or cookies.
    #[error("authentication required: {0}")]
    AuthRequired(String),
    /// Metadata lookup failed for some other reason.
    #[error("could not resolve video: {0}")]
    ResolveFailed(String),
    /// The media fetch failed or produced no file.
    #[error("download failed: {0}")]
    DownloadFailed(String),
    /// Still over the upload ceiling after the escalated recompression.
    #[error("file is {size_mb:.2} MB, over the {ceiling_mb:.2} MB upload limit")]
    FileTooLarge { size_mb: f64, ceiling_mb: f64 },
    /// Filesystem trouble while archiving or reading the archive.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AcquireError {
    /// Failures that earn the one-shot "update yt-dlp and try again" pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResolveFailed(_) | Self::DownloadFailed(_))
    }

    /// Short diagnostic suitable for relaying to the requester.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedUrl(_) => "That URL is not supported.".to_string(),
            Self::AuthRequired(_) => {
                "That video needs a login. Provide a cookies file (YANK_COOKIES_FILE) and try again."
                    .to_string()
            }
            Self::ResolveFailed(detail) => format!("Could not look up the video: {detail}"),
            Self::DownloadFailed(detail) => format!("The download failed: {detail}"),
            Self::FileTooLarge {
                size_mb,
                ceiling_mb,
            } => format!(
                "Even after heavy compression the video is {size_mb:.1} MB, above the {ceiling_mb:.0} MB limit."
            ),
            Self::Internal(err) => format!("Archiving failed: {err}"),
        }
    }
}
