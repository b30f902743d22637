//! Media fetch through yt-dlp into a per-job scratch directory.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{AcquireError, AcquireResult};
use crate::resolver::ResolvedMetadata;
use crate::subtitles::is_subtitle_file;
use crate::tools::{Toolchain, diagnostic, run_captured};

/// Best mp4 video + m4a audio, falling back to whatever single file exists.
const FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";
const OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";
/// English first, then everything else except live chat replays.
const SUBTITLE_LANGS: &str = "en.*,all,-live_chat";

/// Downloads `metadata.source_url` into `scratch_dir` and returns the merged
/// media file, or `None` when yt-dlp succeeded but nothing carries the id.
pub fn download(
    toolchain: &Toolchain,
    metadata: &ResolvedMetadata,
    scratch_dir: &Path,
) -> AcquireResult<Option<PathBuf>> {
    fs::create_dir_all(scratch_dir).map_err(|err| {
        AcquireError::DownloadFailed(format!("cannot create {}: {err}", scratch_dir.display()))
    })?;

    let mut command = toolchain.yt_dlp_command();
    command
        .arg("-f")
        .arg(FORMAT_SELECTOR)
        .arg("--merge-output-format")
        .arg("mp4")
        .arg("--write-subs")
        .arg("--sub-langs")
        .arg(SUBTITLE_LANGS)
        .arg("--no-playlist")
        .arg("--no-progress")
        .arg("--no-warnings")
        .arg("--windows-filenames")
        .arg("-o")
        .arg(scratch_dir.join(OUTPUT_TEMPLATE))
        .arg(&metadata.source_url);

    info!(url = %metadata.source_url, id = %metadata.id, "downloading media");
    let output = run_captured(command, "yt-dlp download")
        .map_err(|err| AcquireError::DownloadFailed(format!("{err:#}")))?;

    if !output.success {
        warn!(
            url = %metadata.source_url,
            status = %output.status,
            stderr = %output.stderr.trim(),
            "download failed"
        );
        return Err(AcquireError::DownloadFailed(diagnostic(
            &output.stderr,
            &output.stdout,
            "yt-dlp exited without an explanation",
        )));
    }

    let found = find_media_file(scratch_dir, &metadata.id).map_err(|err| {
        AcquireError::DownloadFailed(format!("cannot read {}: {err}", scratch_dir.display()))
    })?;
    if found.is_none() {
        warn!(id = %metadata.id, dir = %scratch_dir.display(), "no downloaded file matches the id");
    }
    Ok(found)
}

/// Finds the media file whose name contains `video_id`, skipping subtitles,
/// partial downloads and sidecar files. yt-dlp cannot always report the final
/// merged name, so the id is the stable handle.
pub fn find_media_file(dir: &Path, video_id: &str) -> std::io::Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(video_id) || is_sidecar(&name) || is_subtitle_file(&path) {
            continue;
        }
        candidates.push(path);
    }
    // Prefer the merged mp4 when format-specific leftovers are still around.
    candidates.sort_by_key(|path| {
        let is_mp4 = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
        (!is_mp4, path.clone())
    });
    Ok(candidates.into_iter().next())
}

fn is_sidecar(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    [
        ".part", ".ytdl", ".json", ".description", ".jpg", ".webp", ".png", ".temp",
    ]
    .iter()
    .any(|suffix| lower.ends_with(suffix))
        || lower.contains(".part-frag")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use crate::test_support::StubTools;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn download_returns_the_id_matching_file() -> Result<()> {
        let dir = tempdir()?;
        let stubs = StubTools::install(dir.path())?;
        stubs.set_video("XYZ", "Any Title")?;
        stubs.set_subtitles(&["en.vtt"])?;
        let toolchain = stubs.toolchain();
        let meta = resolve(&toolchain, "https://example.com/x")?;

        let scratch = dir.path().join("scratch");
        let path = download(&toolchain, &meta, &scratch)?.expect("file found");
        assert_eq!(path, scratch.join("Any Title [XYZ].mp4"));
        assert!(scratch.join("Any Title [XYZ].en.vtt").exists());

        let call = stubs
            .calls()
            .into_iter()
            .find(|line| line.contains("--merge-output-format"))
            .expect("download call logged");
        assert!(call.contains("--write-subs"));
        assert!(call.contains(SUBTITLE_LANGS));
        assert!(call.contains(FORMAT_SELECTOR));
        Ok(())
    }

    #[test]
    fn download_reports_tool_failures() -> Result<()> {
        let dir = tempdir()?;
        let stubs = StubTools::install(dir.path())?;
        stubs.fail_downloads(1)?;
        let toolchain = stubs.toolchain();
        let meta = resolve(&toolchain, "https://example.com/x")?;

        match download(&toolchain, &meta, &dir.path().join("scratch")).unwrap_err() {
            AcquireError::DownloadFailed(detail) => assert_eq!(detail, "Forbidden"),
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn download_returns_none_when_id_is_missing() -> Result<()> {
        let dir = tempdir()?;
        let stubs = StubTools::install(dir.path())?;
        let toolchain = stubs.toolchain();
        let mut meta = resolve(&toolchain, "https://example.com/x")?;
        meta.id = "other-id".to_string();

        assert!(download(&toolchain, &meta, &dir.path().join("scratch"))?.is_none());
        Ok(())
    }

    #[test]
    fn find_media_file_skips_sidecars_and_subtitles() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("Clip [id9].en.vtt"), "WEBVTT")?;
        fs::write(dir.path().join("Clip [id9].info.json"), "{}")?;
        fs::write(dir.path().join("Clip [id9].f137.mp4.part"), "")?;
        fs::write(dir.path().join("Clip [id9].webm"), "")?;
        fs::write(dir.path().join("Clip [id9].mp4"), "")?;
        fs::write(dir.path().join("Other [zz].mp4"), "")?;

        let found = find_media_file(dir.path(), "id9")?;
        assert_eq!(found, Some(dir.path().join("Clip [id9].mp4")));
        assert_eq!(find_media_file(dir.path(), "nope")?, None);
        Ok(())
    }
}
