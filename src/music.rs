//! Local music library
//!
//! Scans a directory tree for playable files, refreshing the listing on a
//! configured interval, and resolves fuzzy song requests to the closest
//! filename. The chosen file is announced with a recognition frame and its
//! audio delivered through the session's ordered audio queue.

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::audio;
use crate::config::MusicConfig;
use crate::server::session::SessionShared;
use crate::utils::lcs_ratio;

/// Minimum similarity for a fuzzy filename match.
const MATCH_THRESHOLD: f64 = 0.4;

struct ScanState {
    files: Vec<String>,
    scanned_at: Instant,
}

pub struct MusicLibrary {
    dir: PathBuf,
    extensions: Vec<String>,
    refresh: Duration,
    state: Mutex<ScanState>,
}

impl MusicLibrary {
    pub fn new(config: &MusicConfig) -> Self {
        let dir = PathBuf::from(&config.music_dir);
        let extensions =
            config.music_ext.iter().map(|e| e.to_ascii_lowercase()).collect::<Vec<_>>();
        let files = scan(&dir, &extensions);
        info!("music library: {} files under {}", files.len(), dir.display());
        Self {
            dir,
            extensions,
            refresh: Duration::from_secs(config.refresh_time),
            state: Mutex::new(ScanState { files, scanned_at: Instant::now() }),
        }
    }

    /// Current file listing (relative paths), rescanning when stale.
    pub fn files(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.scanned_at.elapsed() >= self.refresh {
            state.files = scan(&self.dir, &self.extensions);
            state.scanned_at = Instant::now();
        }
        state.files.clone()
    }

    /// Best fuzzy match for a requested song name, by similarity against the
    /// filename without extension.
    pub fn best_match(&self, requested: &str) -> Option<String> {
        let mut best: Option<(f64, String)> = None;
        for file in self.files() {
            let stem = Path::new(&file)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| file.clone());
            let ratio = lcs_ratio(requested, &stem);
            if ratio >= MATCH_THRESHOLD && best.as_ref().map(|(r, _)| ratio > *r).unwrap_or(true)
            {
                best = Some((ratio, file));
            }
        }
        best.map(|(_, file)| file)
    }

    /// Pick the requested song (fuzzy) or a uniformly random one.
    pub fn choose(&self, requested: Option<&str>) -> Option<String> {
        if let Some(song) = requested.filter(|s| !s.is_empty()) {
            if let Some(hit) = self.best_match(song) {
                info!("matched requested song \"{}\" to {}", song, hit);
                return Some(hit);
            }
        }
        let files = self.files();
        if files.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..files.len());
        Some(files[idx].clone())
    }

    /// Queue the selected file for emission. The announcement goes out as a
    /// text-only recognition frame once the file is known; the file's frames
    /// are the whole reply, a single emitter item at index 0.
    pub async fn play(&self, shared: &SessionShared, requested: Option<&str>) -> Result<()> {
        let Some(selected) = self.choose(requested) else {
            bail!("no music files under {}", self.dir.display());
        };
        let path = self.dir.join(&selected);
        if !path.exists() {
            bail!("selected music file vanished: {}", path.display());
        }

        let announcement = format!("正在播放{}", selected);
        info!("{}", announcement);
        shared.send_stt_flow(&announcement).await;

        shared.set_llm_finished(true);
        shared.record_segment_index(0);
        let job = tokio::spawn(async move { load_frames(&path).await });
        shared.submit_audio_job(job, selected, 0);
        Ok(())
    }
}

/// Decode a music file into wire frames. `.p3` files are already packetized;
/// `.wav` decodes natively; anything else goes through ffmpeg.
async fn load_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "p3" => audio::read_p3_frames(path),
        "wav" => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            audio::wav_to_opus_frames(&bytes)
        }
        _ => {
            let pcm = audio::decode_media_to_pcm(path).await?;
            audio::pcm_to_opus_frames(&pcm)
        }
    }
}

fn scan(dir: &Path, extensions: &[String]) -> Vec<String> {
    if !dir.exists() {
        warn!("music directory does not exist: {}", dir.display());
        return Vec::new();
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        if extensions.iter().any(|allowed| *allowed == ext) {
            if let Ok(rel) = entry.path().strip_prefix(dir) {
                files.push(rel.to_string_lossy().to_string());
            }
        }
    }
    files.sort();
    files
}

/// Extract the requested song name from a play-music intent or utterance,
/// e.g. "播放音乐 [春天]" or "播放音乐春天" → "春天".
pub fn extract_song_name(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("播放音乐")?;
    let name = rest.trim().trim_matches(|c| c == '[' || c == ']' || c == '\'' || c == '"');
    if name.is_empty() {
        None
    } else {
        Some(name.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MusicConfig;

    fn library_with(files: &[&str]) -> (tempfile::TempDir, MusicLibrary) {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let config = MusicConfig {
            music_dir: dir.path().to_string_lossy().to_string(),
            music_ext: vec![".mp3".into(), ".wav".into(), ".p3".into()],
            refresh_time: 60,
        };
        let lib = MusicLibrary::new(&config);
        (dir, lib)
    }

    #[test]
    fn scan_filters_by_extension() {
        let (_dir, lib) = library_with(&["春天.mp3", "夏夜.wav", "notes.txt"]);
        let files = lib.files();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&"春天.mp3".to_string()));
        assert!(!files.iter().any(|f| f.ends_with(".txt")));
    }

    #[test]
    fn fuzzy_match_prefers_closest_name() {
        let (_dir, lib) = library_with(&["春天.mp3", "春天的故事.mp3", "冬雪.mp3"]);
        assert_eq!(lib.best_match("春天").as_deref(), Some("春天.mp3"));
        assert!(lib.best_match("完全不相干的歌").is_none());
    }

    #[test]
    fn choose_falls_back_to_random() {
        let (_dir, lib) = library_with(&["春天.mp3"]);
        assert_eq!(lib.choose(Some("不存在的歌")).as_deref(), Some("春天.mp3"));
        assert_eq!(lib.choose(None).as_deref(), Some("春天.mp3"));
    }

    #[test]
    fn song_name_extraction() {
        assert_eq!(extract_song_name("播放音乐 [春天]").as_deref(), Some("春天"));
        assert_eq!(extract_song_name("播放音乐春天").as_deref(), Some("春天"));
        assert_eq!(extract_song_name("随便聊聊"), None);
        assert_eq!(extract_song_name("播放音乐"), None);
    }
}
