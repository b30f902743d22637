//! Picks the subtitle track that travels with an archived video.

use std::fs;
use std::path::{Path, PathBuf};

const SUBTITLE_EXTENSIONS: &[&str] = &[
    "vtt", "srt", "ass", "ssa", "ttml", "srv1", "srv2", "srv3", "xml",
];

pub fn is_subtitle_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUBTITLE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// `Clip.en.vtt`, `Clip.en-US.srt` and `Clip.EN.vtt` all count as English.
fn is_english(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains(".en.") || lower.contains(".en-")
}

/// Returns the subtitle for `video_base_name` (file name without extension)
/// in `directory`, preferring an English track. Among several non-English
/// candidates the choice follows directory order and is not stable.
pub fn select(directory: &Path, video_base_name: &str) -> Option<PathBuf> {
    let prefix = format!("{video_base_name}.");
    let entries = fs::read_dir(directory).ok()?;

    let mut fallback = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_subtitle_file(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        if is_english(&name[video_base_name.len()..]) {
            return Some(path);
        }
        fallback.get_or_insert(path);
    }
    fallback
}
