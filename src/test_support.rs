//! Stub yt-dlp / ffmpeg / ffprobe scripts for tests.
//!
//! Every stub appends `<tool> <args>` to `calls.log` and reads its behaviour
//! from small state files next to it, so a test can queue failures or output
//! sizes without touching global state.

use anyhow::Result;
use serde_json::json;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::{RetryPolicy, Settings};
use crate::tools::Toolchain;

/// Writes an executable bash script named `name` into `dir`.
pub(crate) fn install_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let script_path = dir.join(name);
    fs::write(&script_path, format!("#!/usr/bin/env bash\nset -u\n{body}"))?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
    }
    Ok(script_path)
}

const COMMON: &str = r#"STUB_DIR="__STUB_DIR__"
take() {
  local f="$STUB_DIR/$1"
  [ -s "$f" ] || return 1
  local n
  n=$(cat "$f")
  [ "$n" -gt 0 ] || return 1
  echo $((n - 1)) > "$f"
  return 0
}
"#;

const YT_DLP: &str = r#"echo "yt-dlp $*" >> "$STUB_DIR/calls.log"
args=("$@")
template=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o|--output)
      shift
      template="$1"
      ;;
  esac
  shift
done

if printf '%s\n' "${args[@]}" | grep -q -- '^--version$'; then
  echo "2025.01.01"
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- '^-U$'; then
  echo "Updated yt-dlp to stable@2025.02.02"
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- '^-J$'; then
  if [ -f "$STUB_DIR/resolver-stderr" ]; then
    cat "$STUB_DIR/resolver-stderr" >&2
    exit 1
  fi
  if take resolve-failures; then
    echo "ERROR: [generic] Unable to download webpage: timed out" >&2
    exit 1
  fi
  cat "$STUB_DIR/meta.json"
  exit 0
fi

if [[ -n "$template" ]]; then
  if take download-failures; then
    echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
    exit 1
  fi
  id=$(cat "$STUB_DIR/id")
  title=$(cat "$STUB_DIR/title")
  size=$(cat "$STUB_DIR/download-size")
  out=$(printf '%s' "$template" | sed -e "s|%(title)s|$title|g" -e "s|%(id)s|$id|g" -e "s|%(ext)s|mp4|g")
  mkdir -p "$(dirname "$out")"
  head -c "$size" /dev/zero > "$out"
  base="${out%.mp4}"
  if [ -f "$STUB_DIR/subtitles" ]; then
    while read -r suffix; do
      [ -n "$suffix" ] && echo "WEBVTT" > "$base.$suffix"
    done < "$STUB_DIR/subtitles"
  fi
  exit 0
fi

exit 0
"#;

const FFPROBE: &str = r#"echo "ffprobe $*" >> "$STUB_DIR/calls.log"
if [ "${1:-}" = "-version" ]; then
  exit 0
fi
if take probe-failures; then
  echo "input.mp4: Invalid data found when processing input" >&2
  exit 1
fi
cat "$STUB_DIR/probe-output"
"#;

const FFMPEG: &str = r#"echo "ffmpeg $*" >> "$STUB_DIR/calls.log"
if [ "${1:-}" = "-version" ]; then
  exit 0
fi
if take encoder-failures; then
  echo "Error opening output file: Resource busy" >&2
  exit 1
fi
pass=""
passlog=""
out=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -pass)
      shift
      pass="$1"
      ;;
    -passlogfile)
      shift
      passlog="$1"
      ;;
  esac
  out="$1"
  shift
done
if [ "$pass" = "1" ]; then
  touch "$passlog-0.log" "$passlog-0.log.mbtree"
  exit 0
fi
size=2048
if [ -s "$STUB_DIR/encoder-sizes" ]; then
  size=$(head -n 1 "$STUB_DIR/encoder-sizes")
  tail -n +2 "$STUB_DIR/encoder-sizes" > "$STUB_DIR/encoder-sizes.tmp"
  mv "$STUB_DIR/encoder-sizes.tmp" "$STUB_DIR/encoder-sizes"
fi
head -c "$size" /dev/zero > "$out"
"#;

/// A directory of stub tools sharing one call log.
pub(crate) struct StubTools {
    pub dir: PathBuf,
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl StubTools {
    /// Installs the stubs under `root/stubs` with a 60 second probe result,
    /// a 4 KiB download and no subtitles.
    pub fn install(root: &Path) -> Result<Self> {
        let dir = root.join("stubs");
        fs::create_dir_all(&dir)?;
        let dir_str = dir.to_string_lossy().into_owned();
        let script = |body: &str| format!("{}{}", COMMON.replace("__STUB_DIR__", &dir_str), body);
        let stubs = Self {
            yt_dlp: install_script(&dir, "yt-dlp", &script(YT_DLP))?,
            ffmpeg: install_script(&dir, "ffmpeg", &script(FFMPEG))?,
            ffprobe: install_script(&dir, "ffprobe", &script(FFPROBE))?,
            dir,
        };
        stubs.set_video("V1", "Sample Clip")?;
        stubs.set_download_size(4096)?;
        stubs.set_probe_output("60.000000\n5592405\n")?;
        fs::write(stubs.dir.join("calls.log"), "")?;
        Ok(stubs)
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            yt_dlp: self.yt_dlp.clone(),
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            cookies: None,
        }
    }

    /// Settings rooted under `root` that point at the stubs and never sleep.
    pub fn settings(&self, root: &Path) -> Settings {
        let mut settings = Settings::with_roots(&root.join("archive"), &root.join("scratch"));
        settings.yt_dlp = self.yt_dlp.clone();
        settings.ffmpeg = self.ffmpeg.clone();
        settings.ffprobe = self.ffprobe.clone();
        settings.retry = RetryPolicy::immediate();
        settings
    }

    pub fn set_video(&self, id: &str, title: &str) -> Result<()> {
        fs::write(self.dir.join("id"), id)?;
        fs::write(self.dir.join("title"), title)?;
        let meta = json!({
            "id": id,
            "title": title,
            "description": "A description",
            "uploader": "Uploader",
            "extractor_key": "Generic",
            "timestamp": 1_700_000_000,
            "duration": 60.0,
            "webpage_url": format!("https://example.com/watch/{id}"),
        });
        fs::write(self.dir.join("meta.json"), serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    pub fn set_resolver_output(&self, raw: &str) -> Result<()> {
        fs::write(self.dir.join("meta.json"), raw)?;
        Ok(())
    }

    /// Every `-J` call fails with this stderr.
    pub fn set_resolver_error(&self, stderr: &str) -> Result<()> {
        fs::write(self.dir.join("resolver-stderr"), stderr)?;
        Ok(())
    }

    pub fn set_download_size(&self, bytes: u64) -> Result<()> {
        fs::write(self.dir.join("download-size"), bytes.to_string())?;
        Ok(())
    }

    /// Subtitle suffixes written next to the download, e.g. `en.vtt`.
    pub fn set_subtitles(&self, suffixes: &[&str]) -> Result<()> {
        fs::write(self.dir.join("subtitles"), suffixes.join("\n") + "\n")?;
        Ok(())
    }

    pub fn set_probe_output(&self, output: &str) -> Result<()> {
        fs::write(self.dir.join("probe-output"), output)?;
        Ok(())
    }

    /// Sizes in bytes for successive second-pass outputs.
    pub fn queue_encoder_sizes(&self, sizes: &[u64]) -> Result<()> {
        let lines: Vec<String> = sizes.iter().map(u64::to_string).collect();
        fs::write(self.dir.join("encoder-sizes"), lines.join("\n") + "\n")?;
        Ok(())
    }

    pub fn fail_encoder(&self, times: u32) -> Result<()> {
        self.set_counter("encoder-failures", times)
    }

    pub fn fail_probe(&self, times: u32) -> Result<()> {
        self.set_counter("probe-failures", times)
    }

    pub fn fail_downloads(&self, times: u32) -> Result<()> {
        self.set_counter("download-failures", times)
    }

    pub fn fail_resolves(&self, times: u32) -> Result<()> {
        self.set_counter("resolve-failures", times)
    }

    fn set_counter(&self, name: &str, times: u32) -> Result<()> {
        fs::write(self.dir.join(name), times.to_string())?;
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Number of logged calls starting with `prefix` (e.g. `"ffmpeg"`).
    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}
