//! Drives one URL from cache check to archived record.
//!
//! ```text
//! CHECK_CACHE -> RESOLVE -> DOWNLOAD -> NORMALIZE -> SIZE_GUARD -> ARCHIVE -> DONE
//! ```
//!
//! Resolve and download failures on the first attempt trigger one
//! `yt-dlp -U` followed by a fresh run from RESOLVE.

use anyhow::Context;
use std::fs;
use std::path::Path;
use std::thread;
use tracing::{info, warn};

use crate::archive::{Archive, ArchiveInput, ArchiveRecord};
use crate::compressor::{Compressor, file_size_mb};
use crate::config::Settings;
use crate::downloader;
use crate::error::{AcquireError, AcquireResult};
use crate::resolver;
use crate::subtitles;
use crate::tools::{Toolchain, run_captured};

/// Fraction of the nominal target used when the first result is oversize.
pub const ESCALATION_FACTOR: f64 = 0.85;
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub url: String,
    pub user_id: String,
}

impl AcquireRequest {
    pub fn new(url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_id: user_id.into(),
        }
    }
}

/// Progress worth relaying to the requester while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    HeavyCompression { size_mb: f64, ceiling_mb: f64 },
    RetryingAfterUpdate { reason: String },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, url: &str, notice: &Notice);
}

impl<F> Notifier for F
where
    F: Fn(&str, &Notice) + Send + Sync,
{
    fn notify(&self, url: &str, notice: &Notice) {
        self(url, notice)
    }
}

/// Notifier that only writes to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, url: &str, notice: &Notice) {
        match notice {
            Notice::HeavyCompression {
                size_mb,
                ceiling_mb,
            } => info!(url, size_mb, ceiling_mb, "file too large, compressing harder"),
            Notice::RetryingAfterUpdate { reason } => {
                info!(url, reason = %reason, "updating yt-dlp and retrying")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub record: ArchiveRecord,
    pub title: String,
    pub description: String,
    pub service: String,
    /// Served from the index without touching any tool.
    pub cached: bool,
    /// The archived file is the unnormalized download.
    pub degraded: bool,
}

impl Acquisition {
    fn from_record(record: ArchiveRecord, cached: bool, degraded: bool) -> Self {
        Self {
            title: record.metadata.title.clone(),
            description: record.metadata.description.clone(),
            service: record.metadata.service.clone(),
            record,
            cached,
            degraded,
        }
    }
}

pub struct Acquirer {
    settings: Settings,
    toolchain: Toolchain,
    archive: Archive,
}

impl Acquirer {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let archive = Archive::open(&settings.archive_root)?;
        Ok(Self {
            toolchain: Toolchain::from_settings(&settings),
            archive,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn acquire(
        &self,
        request: &AcquireRequest,
        notifier: &dyn Notifier,
    ) -> AcquireResult<Acquisition> {
        if let Some(record) = self.archive.lookup(&request.url)? {
            info!(url = %request.url, path = %record.video.display(), "cache hit");
            return Ok(Acquisition::from_record(record, true, false));
        }

        let mut attempt = 1;
        loop {
            match self.run_pipeline(request, notifier) {
                Ok(acquisition) => return Ok(acquisition),
                Err(err) if attempt < MAX_ATTEMPTS && err.is_retryable() => {
                    warn!(url = %request.url, attempt, error = %err, "acquisition failed, updating yt-dlp");
                    notifier.notify(
                        &request.url,
                        &Notice::RetryingAfterUpdate {
                            reason: err.to_string(),
                        },
                    );
                    self.update_downloader();
                    if !self.settings.retry.update_pause.is_zero() {
                        thread::sleep(self.settings.retry.update_pause);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    warn!(url = %request.url, attempt, error = %err, "acquisition failed");
                    return Err(err);
                }
            }
        }
    }

    /// RESOLVE through ARCHIVE inside a scratch directory that is removed
    /// on every exit path.
    fn run_pipeline(
        &self,
        request: &AcquireRequest,
        notifier: &dyn Notifier,
    ) -> AcquireResult<Acquisition> {
        let scratch = self.scratch_dir()?;
        let metadata = resolver::resolve(&self.toolchain, &request.url)?;

        let source = downloader::download(&self.toolchain, &metadata, scratch.path())?
            .ok_or_else(|| {
                AcquireError::DownloadFailed(format!(
                    "no downloaded file matches id {}",
                    metadata.id
                ))
            })?;

        let compressor = Compressor::new(&self.toolchain, &self.settings.retry);
        let ceiling_mb = self.settings.upload_limit_mb;
        let mut normalized = compressor.normalize(&source, self.settings.target_size_mb);
        let mut size_mb = measure(&normalized.path)?;

        if size_mb > ceiling_mb {
            notifier.notify(
                &request.url,
                &Notice::HeavyCompression {
                    size_mb,
                    ceiling_mb,
                },
            );
            let escalated_target = self.settings.target_size_mb * ESCALATION_FACTOR;
            normalized = compressor.normalize(&source, escalated_target);
            size_mb = measure(&normalized.path)?;
            if size_mb > ceiling_mb {
                return Err(AcquireError::FileTooLarge {
                    size_mb,
                    ceiling_mb,
                });
            }
        }

        let base_name = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let subtitle = subtitles::select(scratch.path(), &base_name);

        let record = self.archive.store(ArchiveInput {
            url: &request.url,
            user_id: &request.user_id,
            metadata: &metadata,
            video: &normalized.path,
            subtitle: subtitle.as_deref(),
        })?;
        Ok(Acquisition::from_record(
            record,
            false,
            normalized.is_degraded(),
        ))
    }

    fn scratch_dir(&self) -> AcquireResult<tempfile::TempDir> {
        let root = &self.settings.scratch_root;
        fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("acquire-")
            .tempdir_in(root)
            .with_context(|| format!("creating scratch directory in {}", root.display()))?;
        Ok(dir)
    }

    fn update_downloader(&self) {
        let mut command = self.toolchain.yt_dlp_command();
        command.arg("-U");
        match run_captured(command, "yt-dlp update") {
            Ok(output) if output.success => info!(output = %output.stdout.trim(), "yt-dlp updated"),
            Ok(output) => warn!(status = %output.status, stderr = %output.stderr.trim(), "yt-dlp update failed"),
            Err(err) => warn!(error = %err, "yt-dlp update could not run"),
        }
    }

    /// Removes the record for `url` and its index entry.
    pub fn delete(&self, url: &str) -> anyhow::Result<bool> {
        self.archive.delete(url)
    }

    pub fn list(&self, user_id: &str) -> anyhow::Result<Vec<ArchiveRecord>> {
        self.archive.list(user_id)
    }
}

fn measure(path: &Path) -> AcquireResult<f64> {
    file_size_mb(path)
        .with_context(|| format!("measuring {}", path.display()))
        .map_err(AcquireError::from)
}
