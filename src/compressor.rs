//! Two-pass, bitrate-targeted re-encode that normalizes every archived video
//! to H.264/AAC, yuv420p and a front-loaded `moov` atom.
//!
//! Compression is best effort: transient encoder failures are retried a few
//! times and, when every attempt fails, the caller gets the untouched input
//! back flagged as [`NormalizeOutcome::Degraded`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RetryPolicy;
use crate::tools::{Toolchain, diagnostic, run_captured};

pub const AUDIO_BITRATE: u64 = 128 * 1024;
pub const MIN_VIDEO_BITRATE: u64 = 100 * 1024;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const OUTPUT_SUFFIX: &str = "_normalized";
const NULL_DEVICE: &str = if cfg!(windows) { "NUL" } else { "/dev/null" };

static PASSLOG_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Size of `path` in MiB.
pub fn file_size_mb(path: &Path) -> io::Result<f64> {
    Ok(fs::metadata(path)?.len() as f64 / BYTES_PER_MB)
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("encoder pass {pass} failed: {detail}")]
    Encode { pass: u8, detail: String },
    #[error("encoder produced no output at {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("io failure: {0}")]
    Io(#[from] io::Error),
}

/// What ffprobe reports about the input container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    pub duration_secs: f64,
    pub bitrate: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    Compressed,
    /// Every attempt failed and the original file was handed back.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub path: PathBuf,
    pub outcome: NormalizeOutcome,
}

impl Normalized {
    pub fn is_degraded(&self) -> bool {
        self.outcome == NormalizeOutcome::Degraded
    }
}

/// Parameters of one encode; lives only as long as a single attempt.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub target_size_mb: f64,
    pub video_bitrate: u64,
    pub passlog: PathBuf,
}

/// Video bitrate (bits/s) that lands `duration` seconds of media at
/// `target_size_mb`, after reserving [`AUDIO_BITRATE`] for the audio track.
///
/// Inputs already below the target never get a higher bitrate than they
/// currently have, and the result never drops below [`MIN_VIDEO_BITRATE`].
pub fn plan_video_bitrate(probe: &Probe, input_size_mb: f64, target_size_mb: f64) -> u64 {
    let mut total = target_size_mb * 8.0 * BYTES_PER_MB / probe.duration_secs;
    if input_size_mb < target_size_mb
        && let Some(current) = probe.bitrate
    {
        total = total.min(current as f64);
    }
    let video = total - AUDIO_BITRATE as f64;
    video.max(MIN_VIDEO_BITRATE as f64) as u64
}

/// `ffprobe ... -of default=noprint_wrappers=1:nokey=1` prints the duration on
/// the first line and the bitrate (or `N/A`) on the second.
fn parse_probe(stdout: &str) -> Result<Probe, TranscodeError> {
    let mut lines = stdout.lines().map(str::trim).filter(|line| !line.is_empty());
    let duration_secs = lines
        .next()
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .ok_or_else(|| TranscodeError::Probe(format!("no usable duration in {stdout:?}")))?;
    let bitrate = lines
        .next()
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|bits| bits.is_finite() && *bits > 0.0)
        .map(|bits| bits as u64);
    Ok(Probe {
        duration_secs,
        bitrate,
    })
}

fn output_path_for(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    input.with_file_name(format!("{stem}{OUTPUT_SUFFIX}.mp4"))
}

/// Pass-log prefix unique to this process and call, so concurrent encodes in
/// one directory never share x264 statistics files.
fn passlog_prefix(input: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let serial = PASSLOG_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("yank2pass-{}-{nanos}-{serial}", std::process::id());
    input.with_file_name(name)
}

fn remove_passlogs(prefix: &Path) {
    let (Some(dir), Some(name)) = (prefix.parent(), prefix.file_name()) else {
        return;
    };
    let name = name.to_string_lossy();
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(name.as_ref())
            && let Err(err) = fs::remove_file(entry.path())
        {
            warn!(path = %entry.path().display(), error = %err, "could not remove pass log");
        }
    }
}

pub struct Compressor<'a> {
    toolchain: &'a Toolchain,
    attempts: u32,
    delay: Duration,
}

impl<'a> Compressor<'a> {
    pub fn new(toolchain: &'a Toolchain, retry: &RetryPolicy) -> Self {
        Self {
            toolchain,
            attempts: retry.compress_attempts.max(1),
            delay: retry.compress_delay,
        }
    }

    /// Re-encodes `input` towards `target_size_mb`, always, even when the
    /// input already fits. Never fails: on exhaustion the input comes back.
    pub fn normalize(&self, input: &Path, target_size_mb: f64) -> Normalized {
        for attempt in 1..=self.attempts {
            match self.attempt(input, target_size_mb) {
                Ok(path) => {
                    return Normalized {
                        path,
                        outcome: NormalizeOutcome::Compressed,
                    };
                }
                Err(err) => {
                    warn!(
                        input = %input.display(),
                        attempt,
                        attempts = self.attempts,
                        error = %err,
                        "normalization attempt failed"
                    );
                    if attempt < self.attempts && !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
            }
        }

        warn!(
            input = %input.display(),
            "normalization degraded: passing the original file through"
        );
        Normalized {
            path: input.to_path_buf(),
            outcome: NormalizeOutcome::Degraded,
        }
    }

    fn attempt(&self, input: &Path, target_size_mb: f64) -> Result<PathBuf, TranscodeError> {
        let input_size_mb = file_size_mb(input)?;
        let probe = self.probe(input)?;
        let job = TranscodeJob {
            input: input.to_path_buf(),
            output: output_path_for(input),
            target_size_mb,
            video_bitrate: plan_video_bitrate(&probe, input_size_mb, target_size_mb),
            passlog: passlog_prefix(input),
        };
        info!(
            input = %input.display(),
            size_mb = input_size_mb,
            target_mb = job.target_size_mb,
            duration = probe.duration_secs,
            video_bitrate = job.video_bitrate,
            "normalizing video"
        );

        let result = self.encode(&job);
        remove_passlogs(&job.passlog);
        result?;
        Ok(job.output)
    }

    pub fn probe(&self, input: &Path) -> Result<Probe, TranscodeError> {
        let mut command = self.toolchain.ffprobe_command();
        command
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration,bit_rate")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(input);
        let output = run_captured(command, "ffprobe")
            .map_err(|err| TranscodeError::Probe(format!("{err:#}")))?;
        if !output.success {
            return Err(TranscodeError::Probe(diagnostic(
                &output.stderr,
                &output.stdout,
                "ffprobe failed",
            )));
        }
        parse_probe(&output.stdout)
    }

    fn encode(&self, job: &TranscodeJob) -> Result<(), TranscodeError> {
        self.run_pass(job, 1)?;
        self.run_pass(job, 2)?;
        let written = fs::metadata(&job.output).map(|meta| meta.len()).unwrap_or(0);
        if written == 0 {
            return Err(TranscodeError::MissingOutput(job.output.clone()));
        }
        Ok(())
    }

    fn run_pass(&self, job: &TranscodeJob, pass: u8) -> Result<(), TranscodeError> {
        let mut command = self.toolchain.ffmpeg_command();
        command
            .arg("-y")
            .arg("-i")
            .arg(&job.input)
            .arg("-c:v")
            .arg("libx264")
            .arg("-b:v")
            .arg(job.video_bitrate.to_string())
            .arg("-pass")
            .arg(pass.to_string())
            .arg("-passlogfile")
            .arg(&job.passlog);
        if pass == 1 {
            command.arg("-an");
        } else {
            command.arg("-c:a").arg("aac").arg("-b:a").arg("128k");
        }
        command.arg("-pix_fmt").arg("yuv420p");
        if pass == 1 {
            command.arg("-f").arg("mp4").arg(NULL_DEVICE);
        } else {
            command.arg("-movflags").arg("+faststart").arg(&job.output);
        }

        let output = run_captured(command, "ffmpeg").map_err(|err| TranscodeError::Encode {
            pass,
            detail: format!("{err:#}"),
        })?;
        if !output.success {
            return Err(TranscodeError::Encode {
                pass,
                detail: diagnostic(&output.stderr, &output.stdout, "ffmpeg failed"),
            });
        }
        Ok(())
    }
}
