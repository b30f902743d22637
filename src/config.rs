#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CONFIG_PATH: &str = "yank.toml";
pub const DEFAULT_ARCHIVE_ROOT: &str = "archive";
pub const DEFAULT_TARGET_SIZE_MB: f64 = 75.0;
pub const DEFAULT_UPLOAD_LIMIT_MB: f64 = 95.0;
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_FFPROBE: &str = "ffprobe";
const SCRATCH_DIR_NAME: &str = "yank-scratch";

/// Timing knobs for the two retry loops (encoder retries and the one-shot
/// tool update).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub compress_attempts: u32,
    pub compress_delay: Duration,
    pub update_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            compress_attempts: 3,
            compress_delay: Duration::from_secs(2),
            update_pause: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No sleeping at all; handy for tests that drive failing tools.
    pub fn immediate() -> Self {
        Self {
            compress_delay: Duration::ZERO,
            update_pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Everything the acquisition pipeline needs to know about its environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub archive_root: PathBuf,
    pub scratch_root: PathBuf,
    pub target_size_mb: f64,
    pub upload_limit_mb: f64,
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl Settings {
    /// Settings for explicit roots with stock tool names and limits. Used by
    /// tests and embedders that do not read the environment.
    pub fn with_roots(archive_root: &Path, scratch_root: &Path) -> Self {
        Self {
            archive_root: archive_root.to_path_buf(),
            scratch_root: scratch_root.to_path_buf(),
            target_size_mb: DEFAULT_TARGET_SIZE_MB,
            upload_limit_mb: DEFAULT_UPLOAD_LIMIT_MB,
            yt_dlp: PathBuf::from(DEFAULT_YT_DLP),
            ffmpeg: PathBuf::from(DEFAULT_FFMPEG),
            ffprobe: PathBuf::from(DEFAULT_FFPROBE),
            cookies_file: None,
            retry: RetryPolicy::default(),
        }
    }
}

pub fn load_settings() -> Result<Settings> {
    resolve_settings(SettingsOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub archive_root: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub target_size_mb: Option<f64>,
    pub upload_limit_mb: Option<f64>,
    pub env_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

/// Optional TOML file. Keys mirror the environment variables in lower case.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    archive_root: Option<PathBuf>,
    scratch_root: Option<PathBuf>,
    target_size_mb: Option<f64>,
    upload_limit_mb: Option<f64>,
    yt_dlp: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
    ffprobe: Option<PathBuf>,
    cookies_file: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let config_path = overrides
        .config_path
        .clone()
        .or_else(|| lookup_value("YANK_CONFIG", &file_vars, &env_var_string).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let file_settings = read_config_file(&config_path)?;
    Ok(build_settings(
        &file_vars,
        file_settings,
        env_var_string,
        overrides,
    ))
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    file_settings: FileSettings,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let lookup_mb = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| lookup(*key))
            .and_then(|value| parse_positive_mb(&value))
    };

    let archive_root = overrides
        .archive_root
        .or_else(|| lookup("YANK_ARCHIVE_ROOT").map(PathBuf::from))
        .or(file_settings.archive_root)
        .unwrap_or_else(default_archive_root);
    let scratch_root = overrides
        .scratch_root
        .or_else(|| lookup("YANK_SCRATCH_ROOT").map(PathBuf::from))
        .or(file_settings.scratch_root)
        .unwrap_or_else(|| env::temp_dir().join(SCRATCH_DIR_NAME));
    let target_size_mb = overrides
        .target_size_mb
        .or_else(|| lookup_mb(&["YANK_TARGET_SIZE_MB", "MAX_SIZE_MB"]))
        .or(file_settings.target_size_mb.filter(|mb| *mb > 0.0))
        .unwrap_or(DEFAULT_TARGET_SIZE_MB);
    let upload_limit_mb = overrides
        .upload_limit_mb
        .or_else(|| lookup_mb(&["YANK_UPLOAD_LIMIT_MB", "UPLOAD_LIMIT_MB"]))
        .or(file_settings.upload_limit_mb.filter(|mb| *mb > 0.0))
        .unwrap_or(DEFAULT_UPLOAD_LIMIT_MB);
    let tool = |key: &str, from_file: Option<PathBuf>, default: &str| {
        lookup(key)
            .map(PathBuf::from)
            .or(from_file)
            .unwrap_or_else(|| PathBuf::from(default))
    };

    Settings {
        archive_root,
        scratch_root,
        target_size_mb,
        upload_limit_mb,
        yt_dlp: tool("YT_DLP_BIN", file_settings.yt_dlp, DEFAULT_YT_DLP),
        ffmpeg: tool("FFMPEG_BIN", file_settings.ffmpeg, DEFAULT_FFMPEG),
        ffprobe: tool("FFPROBE_BIN", file_settings.ffprobe, DEFAULT_FFPROBE),
        cookies_file: lookup("YANK_COOKIES_FILE")
            .map(PathBuf::from)
            .or(file_settings.cookies_file),
        retry: RetryPolicy::default(),
    }
}

fn default_archive_root() -> PathBuf {
    env::current_dir()
        .map(|cwd| cwd.join(DEFAULT_ARCHIVE_ROOT))
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ARCHIVE_ROOT))
}

fn parse_positive_mb(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|mb| mb.is_finite() && *mb > 0.0)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

fn read_config_file(path: &Path) -> Result<FileSettings> {
    if !path.exists() {
        return Ok(FileSettings::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
