//! Metadata lookup through `yt-dlp -J`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AcquireError, AcquireResult};
use crate::tools::{Toolchain, diagnostic, run_captured};

/// Subset of yt-dlp's info JSON that the archive cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub uploader: Option<String>,
    /// Extractor name, e.g. `Youtube` or `TikTok`.
    pub service: String,
    /// Original upload time as epoch seconds when the site reports one.
    pub timestamp: Option<i64>,
    pub duration: Option<f64>,
    pub source_url: String,
    pub webpage_url: String,
}

/// Raw `-J` payload. Everything is optional because extractors vary wildly.
#[derive(Debug, Deserialize)]
struct InfoJson {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    extractor_key: Option<String>,
    extractor: Option<String>,
    timestamp: Option<f64>,
    release_timestamp: Option<f64>,
    duration: Option<f64>,
    webpage_url: Option<String>,
}

const AUTH_MARKERS: &[&str] = &[
    "Authentication is required",
    "Sign in to confirm",
    "login required",
    "Use --cookies",
    "--cookies-from-browser",
];

pub fn resolve(toolchain: &Toolchain, url: &str) -> AcquireResult<ResolvedMetadata> {
    let mut command = toolchain.yt_dlp_command();
    command.arg("-J").arg("--no-warnings").arg("--no-playlist").arg(url);

    let output = run_captured(command, "yt-dlp metadata")
        .map_err(|err| AcquireError::ResolveFailed(format!("{err:#}")))?;

    if !output.success {
        warn!(
            url,
            status = %output.status,
            stderr = %output.stderr.trim(),
            "metadata lookup failed"
        );
        return Err(classify_failure(&output.stderr, &output.stdout));
    }

    let metadata = parse_info(&output.stdout, url)?;
    info!(url, id = %metadata.id, title = %metadata.title, "resolved metadata");
    Ok(metadata)
}

fn classify_failure(stderr: &str, stdout: &str) -> AcquireError {
    let detail = diagnostic(stderr, stdout, "the resolver gave no explanation");
    if stderr.contains("Unsupported URL") {
        AcquireError::UnsupportedUrl(detail)
    } else if AUTH_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        AcquireError::AuthRequired(detail)
    } else {
        AcquireError::ResolveFailed(detail)
    }
}

fn parse_info(raw: &str, url: &str) -> AcquireResult<ResolvedMetadata> {
    let info: InfoJson = serde_json::from_str(raw.trim())
        .map_err(|err| AcquireError::ResolveFailed(format!("unreadable metadata: {err}")))?;

    let id = info
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AcquireError::ResolveFailed("metadata has no video id".to_string()))?;
    let title = info
        .title
        .or(info.fulltitle)
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| id.clone());
    let service = info
        .extractor_key
        .or(info.extractor)
        .unwrap_or_else(|| "Generic".to_string());

    Ok(ResolvedMetadata {
        title,
        description: info.description.unwrap_or_default(),
        uploader: info.uploader.or(info.channel),
        service,
        timestamp: info
            .timestamp
            .or(info.release_timestamp)
            .map(|value| value as i64),
        duration: info.duration,
        source_url: url.to_string(),
        webpage_url: info.webpage_url.unwrap_or_else(|| url.to_string()),
        id,
    })
}
