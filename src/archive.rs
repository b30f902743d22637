//! On-disk archive: one directory per acquisition under
//! `<root>/<user>/<timestamp>/`, plus the URL index that points into it.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::index::{ArchiveIndex, write_json_atomic};
use crate::resolver::ResolvedMetadata;

pub const METADATA_FILE: &str = "metadata.json";
const RECORD_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const MAX_COLLISION_SUFFIX: u32 = 1000;

/// What gets persisted next to every archived video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub uploader: Option<String>,
    pub service: String,
    /// Original upload time, RFC 3339.
    pub timestamp: Option<String>,
    /// Length in seconds as reported by the resolver.
    #[serde(default)]
    pub duration: Option<f64>,
    pub source_url: String,
    pub webpage_url: String,
    pub archived_at: String,
    pub requested_by: String,
    pub video_file: String,
    pub subtitle_file: Option<String>,
}

impl MetadataDocument {
    fn new(
        metadata: &ResolvedMetadata,
        user_id: &str,
        archived_at: DateTime<Local>,
        video_file: String,
        subtitle_file: Option<String>,
    ) -> Self {
        Self {
            id: metadata.id.clone(),
            title: metadata.title.clone(),
            description: metadata.description.clone(),
            uploader: metadata.uploader.clone(),
            service: metadata.service.clone(),
            timestamp: metadata
                .timestamp
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|datetime| datetime.to_rfc3339()),
            duration: metadata.duration,
            source_url: metadata.source_url.clone(),
            webpage_url: metadata.webpage_url.clone(),
            archived_at: archived_at.to_rfc3339(),
            requested_by: user_id.to_string(),
            video_file,
            subtitle_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    pub dir: PathBuf,
    pub video: PathBuf,
    pub metadata: MetadataDocument,
    pub subtitle: Option<PathBuf>,
}

/// Files handed to [`Archive::store`]; both are moved, not copied.
pub struct ArchiveInput<'a> {
    pub url: &'a str,
    pub user_id: &'a str,
    pub metadata: &'a ResolvedMetadata,
    pub video: &'a Path,
    pub subtitle: Option<&'a Path>,
}

pub struct Archive {
    root: PathBuf,
    index: ArchiveIndex,
}

impl Archive {
    pub fn open(root: &Path) -> Result<Self> {
        let root = std::path::absolute(root)
            .with_context(|| format!("resolving archive root {}", root.display()))?;
        Ok(Self {
            index: ArchiveIndex::new(&root),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Cached record for `url`; `None` when unknown, when the archived file
    /// has disappeared or when its metadata document is unreadable.
    pub fn lookup(&self, url: &str) -> Result<Option<ArchiveRecord>> {
        let Some(video) = self.index.get(url) else {
            return Ok(None);
        };
        let Some(dir) = video.parent() else {
            return Ok(None);
        };
        let mut record = match load_record(dir) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(dir = %dir.display(), "indexed record has no metadata document");
                return Ok(None);
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "indexed record is unreadable, treating as a miss");
                return Ok(None);
            }
        };
        record.video = video;
        Ok(Some(record))
    }

    /// Moves the finished files into a fresh record directory, then points
    /// the index at the video. On any failure the record directory is
    /// removed again, so no video is left behind without an index entry.
    pub fn store(&self, input: ArchiveInput<'_>) -> Result<ArchiveRecord> {
        let user_dir = self.root.join(sanitize_user_id(input.user_id));
        let archived_at = Local::now();
        let dir = allocate_record_dir(&user_dir, &archived_at)?;

        let stored = self
            .populate(&dir, &input, archived_at)
            .and_then(|record| self.index.put(input.url, &record.video).map(|()| record));
        match stored {
            Ok(record) => {
                info!(url = input.url, dir = %record.dir.display(), "archived");
                Ok(record)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %cleanup, "could not remove partial record");
                }
                Err(err)
            }
        }
    }

    fn populate(
        &self,
        dir: &Path,
        input: &ArchiveInput<'_>,
        archived_at: DateTime<Local>,
    ) -> Result<ArchiveRecord> {
        let video_name = file_name_of(input.video)?;
        let subtitle_name = input.subtitle.map(file_name_of).transpose()?;
        let metadata = MetadataDocument::new(
            input.metadata,
            input.user_id,
            archived_at,
            video_name.clone(),
            subtitle_name.clone(),
        );
        write_json_atomic(&dir.join(METADATA_FILE), &metadata)?;

        let video = dir.join(&video_name);
        move_file(input.video, &video)?;
        let subtitle = match (input.subtitle, subtitle_name) {
            (Some(source), Some(name)) => {
                let target = dir.join(name);
                move_file(source, &target)?;
                Some(target)
            }
            _ => None,
        };

        Ok(ArchiveRecord {
            dir: dir.to_path_buf(),
            video,
            metadata,
            subtitle,
        })
    }

    /// Forgets `url` and removes its record directory. Returns whether the
    /// URL was known.
    pub fn delete(&self, url: &str) -> Result<bool> {
        let Some(video) = self.index.delete(url)? else {
            return Ok(false);
        };
        match video.parent() {
            Some(dir) if self.is_record_dir(dir) => {
                if dir.exists() {
                    fs::remove_dir_all(dir)
                        .with_context(|| format!("removing {}", dir.display()))?;
                    info!(url, dir = %dir.display(), "deleted archive record");
                }
            }
            _ => warn!(
                url,
                path = %video.display(),
                "indexed path is outside the archive, leaving files alone"
            ),
        }
        Ok(true)
    }

    /// Records archived for `user_id` whose video is still on disk, newest
    /// first.
    pub fn list(&self, user_id: &str) -> Result<Vec<ArchiveRecord>> {
        let user_dir = self.root.join(sanitize_user_id(user_id));
        if !user_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in WalkDir::new(&user_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
        {
            match load_record(entry.path()) {
                Ok(Some(record)) if record.video.is_file() => records.push(record),
                Ok(_) => {}
                Err(err) => warn!(dir = %entry.path().display(), error = %err, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| {
            b.metadata
                .archived_at
                .cmp(&a.metadata.archived_at)
                .then_with(|| b.dir.cmp(&a.dir))
        });
        Ok(records)
    }

    /// `<root>/<user>/<record>` exactly, never the root or a user directory.
    fn is_record_dir(&self, dir: &Path) -> bool {
        let Ok(relative) = dir.strip_prefix(&self.root) else {
            return false;
        };
        let components: Vec<_> = relative.components().collect();
        components.len() == 2
            && components
                .iter()
                .all(|component| matches!(component, Component::Normal(_)))
    }
}

/// Reads a record directory back. `Ok(None)` when it has no metadata file.
pub fn load_record(dir: &Path) -> Result<Option<ArchiveRecord>> {
    let metadata_path = dir.join(METADATA_FILE);
    let raw = match fs::read_to_string(&metadata_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", metadata_path.display()));
        }
    };
    let metadata: MetadataDocument = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", metadata_path.display()))?;
    let subtitle = metadata
        .subtitle_file
        .as_ref()
        .map(|name| dir.join(name))
        .filter(|path| path.is_file());
    Ok(Some(ArchiveRecord {
        dir: dir.to_path_buf(),
        video: dir.join(&metadata.video_file),
        subtitle,
        metadata,
    }))
}

/// Maps an arbitrary requester id onto one safe path segment.
pub fn sanitize_user_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "unknown".to_string(),
        _ => cleaned,
    }
}

/// Creates `<user_dir>/<timestamp>`, or `<timestamp>-N` when that second is
/// already taken.
fn allocate_record_dir(user_dir: &Path, at: &DateTime<Local>) -> Result<PathBuf> {
    fs::create_dir_all(user_dir).with_context(|| format!("creating {}", user_dir.display()))?;
    let stamp = at.format(RECORD_TIMESTAMP_FORMAT).to_string();
    for suffix in 0..MAX_COLLISION_SUFFIX {
        let name = if suffix == 0 {
            stamp.clone()
        } else {
            format!("{stamp}-{suffix}")
        };
        let candidate = user_dir.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("creating {}", candidate.display()));
            }
        }
    }
    bail!(
        "too many records for {} in {}",
        stamp,
        user_dir.display()
    )
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Rename, falling back to copy + remove when the scratch root lives on a
/// different filesystem.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("removing {}", from.display()))?;
    Ok(())
}
