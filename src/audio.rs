use hound::WavReader;
use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    let duration = frames / spec.sample_rate as f64;
    Ok(duration)
}

/// Picks a background track from the songs directory, or None when the
/// directory is missing or holds no usable mp3. Missing background music is
/// expected and handled by the assembler, so every problem here just logs.
pub fn choose_background_track(songs_dir: &Path) -> Option<PathBuf> {
    let entries = match fs::read_dir(songs_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Songs directory {} not readable: {}", songs_dir.display(), e);
            return None;
        }
    };

    let songs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'))
                && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
        })
        .collect();

    if songs.is_empty() {
        warn!("No usable mp3 files in {}", songs_dir.display());
        return None;
    }

    let song = songs.choose(&mut rand::thread_rng())?.clone();
    info!("Chose background track: {}", song.display());
    Some(song)
}
