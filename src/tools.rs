//! Thin layer over the external programs the pipeline shells out to.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::debug;

use crate::config::Settings;

/// Locations of yt-dlp, ffmpeg and ffprobe plus the optional cookies jar
/// handed to yt-dlp.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub cookies: Option<PathBuf>,
}

impl Toolchain {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            yt_dlp: settings.yt_dlp.clone(),
            ffmpeg: settings.ffmpeg.clone(),
            ffprobe: settings.ffprobe.clone(),
            cookies: settings.cookies_file.clone(),
        }
    }

    /// yt-dlp command with the cookies jar attached when one exists on disk.
    pub fn yt_dlp_command(&self) -> Command {
        let mut command = Command::new(&self.yt_dlp);
        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }
        command
    }

    pub fn ffmpeg_command(&self) -> Command {
        Command::new(&self.ffmpeg)
    }

    pub fn ffprobe_command(&self) -> Command {
        Command::new(&self.ffprobe)
    }

    /// Fails loudly when any of the three programs is missing.
    pub fn check(&self) -> Result<()> {
        let mut missing = Vec::new();
        for (program, flag) in [
            (&self.yt_dlp, "--version"),
            (&self.ffmpeg, "-version"),
            (&self.ffprobe, "-version"),
        ] {
            if let Err(err) = ensure_program_available(program, flag) {
                missing.push(err.to_string());
            }
        }
        if !missing.is_empty() {
            bail!("missing required dependencies: {}", missing.join("; "));
        }
        Ok(())
    }
}

/// Runs `<program> <flag>` and succeeds only on a zero exit status.
pub fn ensure_program_available(program: &Path, flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!("{} is not installed or not in PATH: {}", program.display(), err),
    }
}

/// Captured result of a finished subprocess with output decoded lossily.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs the command to completion, capturing both streams. Only a failure to
/// spawn is an error; a non-zero exit is reported through `success`.
pub fn run_captured(mut command: Command, label: &str) -> Result<CommandOutput> {
    debug!(tool = label, command = ?command, "running external tool");
    let output = command
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("launching {label}"))?;
    Ok(output.into())
}

/// Picks a one-line explanation out of a tool's output: the tail of the last
/// stderr line after its final `:`, else the last stdout line, else `fallback`.
pub fn diagnostic(stderr: &str, stdout: &str, fallback: &str) -> String {
    let from_stderr = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.rsplit(':').map(str::trim).find(|part| !part.is_empty()));
    let from_stdout = || {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    };
    from_stderr
        .or_else(from_stdout)
        .unwrap_or(fallback)
        .to_string()
}
