use crate::audio::{choose_background_track, wav_duration_seconds};
use crate::config::Config;
use crate::subtitle::{self, Transcriber};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

const CANVAS_W: u32 = 1080;
const CANVAS_H: u32 = 1920;
const PORTRAIT_RATIO: f64 = 9.0 / 16.0;
const FRAME_RATE: u32 = 30;
const BACKGROUND_GAIN: f64 = 0.1;
const MAX_CUE_WORDS: usize = 10;

/// Everything the assembler consumes from the run's checkpoints.
pub struct AssembleInput {
    pub image_paths: Vec<PathBuf>,
    pub tts_path: PathBuf,
    pub script: String,
}

/// Centered crop box bringing `(w, h)` to the 9:16 portrait ratio: a frame
/// narrower than 9:16 keeps its width and loses height, anything else keeps
/// its height and loses width.
pub fn crop_box(width: u32, height: u32) -> (u32, u32) {
    let ratio = width as f64 / height as f64;
    if ratio < PORTRAIT_RATIO {
        (width, (width as f64 / PORTRAIT_RATIO).round() as u32)
    } else {
        ((PORTRAIT_RATIO * height as f64).round() as u32, height)
    }
}

/// Display schedule: indices into the image list, cycling in order with each
/// instance shown for `req_dur`, until the accumulated duration covers
/// `total`. Whole cycles are appended, so the schedule may overshoot; the
/// final encode clamps to the audio duration.
pub fn build_schedule(image_count: usize, req_dur: f64, total: f64) -> Vec<usize> {
    let mut schedule = Vec::new();
    if image_count == 0 || req_dur <= 0.0 {
        return schedule;
    }
    let mut accumulated = 0.0;
    while accumulated < total {
        for index in 0..image_count {
            schedule.push(index);
            accumulated += req_dur;
        }
    }
    schedule
}

fn run_ffmpeg(mut command: Command) -> anyhow::Result<()> {
    let output = command.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffmpeg failed: {}", stderr.trim());
    }
    Ok(())
}

fn run_ffprobe(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("ffprobe").args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ffprobe failed: {}", stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Probes a still image, returning its pixel dimensions or an error when the
/// file does not decode as an image.
fn probe_image_dimensions(path: &Path) -> anyhow::Result<(u32, u32)> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Non-UTF8 image path: {}", path.display()))?;
    let raw = run_ffprobe(&[
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        path_str,
    ])?;
    let json: Value = serde_json::from_str(&raw)?;
    let streams = json["streams"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("No streams in {}", path.display()))?;
    for stream in streams {
        let width = stream["width"].as_u64().unwrap_or(0) as u32;
        let height = stream["height"].as_u64().unwrap_or(0) as u32;
        if width > 0 && height > 0 {
            return Ok((width, height));
        }
    }
    anyhow::bail!("No decodable video stream in {}", path.display())
}

/// A checkpointed image path may point at the working copy from a previous
/// process. When that copy is gone, fall back to the durable copy with the
/// same filename.
fn resolve_image(path: &Path, images_dir: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let durable = images_dir.join(path.file_name()?);
    durable.exists().then_some(durable)
}

/// Normalizes one image to the portrait canvas: centered crop to 9:16, then
/// scale to 1080x1920.
fn normalize_image(source: &Path, dest: &Path, width: u32, height: u32) -> anyhow::Result<()> {
    let (crop_w, crop_h) = crop_box(width, height);
    let filter = format!(
        "crop={}:{}:(iw-{})/2:(ih-{})/2,scale={}:{}",
        crop_w, crop_h, crop_w, crop_h, CANVAS_W, CANVAS_H
    );
    let mut command = Command::new("ffmpeg");
    command
        .arg("-y")
        .arg("-i")
        .arg(source)
        .args(["-vf", &filter, "-frames:v", "1"])
        .arg(dest);
    run_ffmpeg(command)
}

/// Renders the final video: tiled images covering the narration exactly,
/// burned-in centered subtitles, narration plus optional low-gain background
/// music. Returns the durable path of the finished file.
pub async fn assemble(config: &Config, input: &AssembleInput) -> anyhow::Result<PathBuf> {
    // 1. Keep only images that exist and decode.
    let mut valid = Vec::new();
    for path in &input.image_paths {
        let Some(resolved) = resolve_image(path, &config.images_dir) else {
            warn!("Image not found, skipping: {}", path.display());
            continue;
        };
        match probe_image_dimensions(&resolved) {
            Ok(dims) => valid.push((resolved, dims)),
            Err(e) => warn!("Image does not decode, skipping {}: {}", resolved.display(), e),
        }
    }
    if valid.is_empty() {
        anyhow::bail!("No valid images found to create video");
    }

    let audio_duration = wav_duration_seconds(&input.tts_path)?;
    if audio_duration <= 0.0 {
        anyhow::bail!("Narration audio has zero duration");
    }
    let req_dur = audio_duration / valid.len() as f64;
    info!(
        "Assembling {} image(s) over {:.2}s of narration ({:.2}s each)",
        valid.len(),
        audio_duration,
        req_dur
    );

    // 2. Normalize every frame to the portrait canvas; a broken image drops
    // out of the sequence instead of aborting the run.
    let mut normalized = Vec::new();
    for (i, (path, (width, height))) in valid.iter().enumerate() {
        let dest = config.work_dir.join(format!("norm_{:03}.png", i));
        match normalize_image(path, &dest, *width, *height) {
            Ok(()) => normalized.push(dest),
            Err(e) => warn!("Failed to normalize {}: {}", path.display(), e),
        }
    }
    if normalized.is_empty() {
        anyhow::bail!("Failed to produce any normalized clips");
    }

    // 3. Tile the sequence until it covers the narration.
    let schedule = build_schedule(normalized.len(), req_dur, audio_duration);
    let concat_list = config.work_dir.join("frames.txt");
    {
        let mut f = File::create(&concat_list)?;
        for &index in &schedule {
            writeln!(f, "file '{}'", normalized[index].display())?;
            writeln!(f, "duration {:.6}", req_dur)?;
        }
        // The concat demuxer ignores the last duration unless the final
        // entry is repeated.
        if let Some(&last) = schedule.last() {
            writeln!(f, "file '{}'", normalized[last].display())?;
        }
    }

    // 4. Subtitles: service transcription when configured, otherwise the
    // local length-weighted estimate; either way equalized to short cues.
    let srt_path = match Transcriber::from_config(config) {
        Ok(transcriber) => transcriber.transcribe(&input.tts_path, &config.work_dir).await?,
        Err(e) => {
            info!("No transcription service ({}), estimating cue timing", e);
            let cues = subtitle::estimate_cues(&input.script, audio_duration);
            let path = config.work_dir.join(format!("{}.srt", Uuid::new_v4()));
            subtitle::write_srt(&path, &cues)?;
            path
        }
    };
    subtitle::equalize_file(&srt_path, MAX_CUE_WORDS)?;

    // 5. Background track is optional; narration-only is fine.
    let background = choose_background_track(&config.songs_dir);

    let out_name = format!("{}.mp4", Uuid::new_v4());
    let work_out = config.work_dir.join(&out_name);
    let srt_str = srt_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Non-UTF8 subtitle path"))?;
    let subtitle_filter = format!(
        "fps={},subtitles={}:force_style='Fontsize=28,Alignment=10,PrimaryColour=&H00FFFF&,OutlineColour=&H000000&,Outline=3,Shadow=0'",
        FRAME_RATE,
        srt_str.replace('\'', r"\'")
    );

    let mut command = Command::new("ffmpeg");
    command
        .arg("-y")
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(&concat_list)
        .arg("-i")
        .arg(&input.tts_path);
    let filter_complex = if let Some(song) = &background {
        command.arg("-i").arg(song);
        format!(
            "[0:v]{}[v];[1:a]volume=1.0[n];[2:a]volume={}[b];[n][b]amix=inputs=2:duration=first:normalize=0[a]",
            subtitle_filter, BACKGROUND_GAIN
        )
    } else {
        format!("[0:v]{}[v];[1:a]volume=1.0[a]", subtitle_filter)
    };
    command
        .args(["-filter_complex", &filter_complex])
        .args(["-map", "[v]", "-map", "[a]"])
        .args(["-c:v", "libx264", "-c:a", "aac"])
        .args(["-t", &format!("{:.6}", audio_duration)])
        .arg(&work_out);
    run_ffmpeg(command)?;

    // 6. Copy to the durable videos directory; that path is the artifact.
    let durable = config.videos_dir.join(&out_name);
    fs::copy(&work_out, &durable)?;
    info!("Wrote final video to {}", durable.display());
    Ok(durable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_images_crop_by_width() {
        // 16:9 is wider than 9:16, so height is kept.
        let (w, h) = crop_box(1920, 1080);
        assert_eq!(h, 1080);
        assert_eq!(w, (0.5625_f64 * 1080.0).round() as u32);
        assert!(w < 1920);
    }

    #[test]
    fn narrow_images_crop_by_height() {
        // 9:20 is narrower than 9:16, so width is kept.
        let (w, h) = crop_box(900, 2000);
        assert_eq!(w, 900);
        assert_eq!(h, (900.0_f64 / 0.5625).round() as u32);
        assert!(h < 2000);
    }

    #[test]
    fn exact_portrait_ratio_passes_through() {
        let (w, h) = crop_box(1080, 1920);
        assert_eq!((w, h), (1080, 1920));
    }

    #[test]
    fn schedule_covers_audio_duration() {
        // 3 images, 10s of audio: each shown 10/3 s.
        let req_dur = 10.0 / 3.0;
        let schedule = build_schedule(3, req_dur, 10.0);
        let accumulated = schedule.len() as f64 * req_dur;
        assert!(accumulated >= 10.0);
        assert_eq!(schedule, vec![0, 1, 2]);
    }

    #[test]
    fn schedule_cycles_whole_passes_until_covered() {
        // 2 images at 1s each against 3s of audio: two full cycles.
        let schedule = build_schedule(2, 1.0, 3.0);
        assert_eq!(schedule, vec![0, 1, 0, 1]);
        assert!(schedule.len() as f64 * 1.0 >= 3.0);
    }

    #[test]
    fn empty_image_set_yields_empty_schedule() {
        assert!(build_schedule(0, 1.0, 10.0).is_empty());
    }

    #[tokio::test]
    async fn zero_loadable_images_abort_before_any_encoding() {
        let dir = std::env::temp_dir().join(format!("autoshorts-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let config = Config {
            state_file: dir.join("runs.json"),
            work_dir: dir.clone(),
            images_dir: dir.join("images"),
            videos_dir: dir.join("videos"),
            songs_dir: dir.join("songs"),
            niche: "Science".into(),
            language: "English".into(),
            model: "gpt-4o-mini".into(),
            image_prompt_model: "gpt-4o-mini".into(),
            script_sentences: 12,
            image_backend: crate::config::ImageBackendKind::Broker,
            worker_url: None,
            piper_model: "model.onnx".into(),
            transcribe_url: None,
            transcribe_api_key: None,
            openrouter_api_key: None,
            groq_api_key: None,
        };
        let input = AssembleInput {
            image_paths: vec![
                PathBuf::from("/nonexistent/0.png"),
                PathBuf::from("/nonexistent/1.png"),
            ],
            tts_path: dir.join("narration.wav"),
            script: "Lava is hot.".into(),
        };

        let err = assemble(&config, &input).await.unwrap_err();
        assert!(err.to_string().contains("No valid images"));
        // Nothing reached the videos directory.
        assert!(!config.videos_dir.exists());
    }
}
