use crate::config::Config;
use regex::Regex;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct SrtCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl SrtCue {
    fn words(&self) -> Vec<&str> {
        self.text.split_whitespace().collect()
    }
}

pub fn parse_srt(content: &str) -> Vec<SrtCue> {
    let time_re = Regex::new(
        r"(\d{2}):(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(\d{2}):(\d{2}):(\d{2})[,.](\d{3})",
    )
    .unwrap();

    let mut cues = Vec::new();
    for block in content.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty()).peekable();
        // Cue index line is optional in practice, skip it when present.
        if lines
            .peek()
            .is_some_and(|l| l.trim().chars().all(|c| c.is_ascii_digit()))
        {
            lines.next();
        }
        let Some(time_line) = lines.next() else {
            continue;
        };
        let Some(caps) = time_re.captures(time_line) else {
            continue;
        };
        let field = |i: usize| caps[i].parse::<f64>().unwrap();
        let start = field(1) * 3600.0 + field(2) * 60.0 + field(3) + field(4) / 1000.0;
        let end = field(5) * 3600.0 + field(6) * 60.0 + field(7) + field(8) / 1000.0;
        let text = lines.collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            cues.push(SrtCue { start, end, text });
        }
    }
    cues
}

pub fn write_srt(path: &Path, cues: &[SrtCue]) -> anyhow::Result<()> {
    let mut f = File::create(path)?;
    for (i, cue) in cues.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(
            f,
            "{} --> {}",
            format_srt_time(cue.start),
            format_srt_time(cue.end)
        )?;
        for line in wrap_text(&cue.text, 80) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if current.len() + word.len() + 1 > width && !current.is_empty() {
            lines.push(current.clone());
            current.clear();
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Regroups cues so no cue carries more than `max_words` words, independent
/// of the transcription service's native segmentation. Words keep a linear
/// share of their source cue's time span; an oversized cue is split into
/// near-equal groups rather than one full group plus a remainder.
pub fn equalize(cues: &[SrtCue], max_words: usize) -> Vec<SrtCue> {
    let max_words = max_words.max(1);
    let mut out = Vec::new();

    for cue in cues {
        let words = cue.words();
        if words.len() <= max_words {
            out.push(cue.clone());
            continue;
        }

        let groups = words.len().div_ceil(max_words);
        let span = cue.end - cue.start;
        let per_word = span / words.len() as f64;

        let base = words.len() / groups;
        let extra = words.len() % groups;
        let mut offset = 0usize;
        for g in 0..groups {
            let len = base + usize::from(g < extra);
            let slice = &words[offset..offset + len];
            let start = cue.start + offset as f64 * per_word;
            let end = cue.start + (offset + len) as f64 * per_word;
            out.push(SrtCue {
                start,
                end,
                text: slice.join(" "),
            });
            offset += len;
        }
    }
    out
}

/// Rewrites an SRT file in place with equalized cues.
pub fn equalize_file(path: &Path, max_words: usize) -> anyhow::Result<()> {
    let content = fs::read_to_string(path)?;
    let cues = equalize(&parse_srt(&content), max_words);
    write_srt(path, &cues)
}

const POLL_DELAY: Duration = Duration::from_secs(3);
const MAX_POLLS: usize = 100;

#[derive(Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Deserialize)]
struct TranscriptResponse {
    id: String,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// Transcription collaborator: uploads the narration audio, submits a
/// transcript job and polls until the service exports SRT subtitles.
pub struct Transcriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Transcriber {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let base_url = config
            .transcribe_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("AUTOSHORTS_TRANSCRIBE_URL is not configured"))?;
        let api_key = config
            .transcribe_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("AUTOSHORTS_TRANSCRIBE_API_KEY is not configured"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Transcribes `audio_path` and writes the SRT export into `work_dir`,
    /// returning the subtitle file path.
    pub async fn transcribe(&self, audio_path: &Path, work_dir: &Path) -> anyhow::Result<PathBuf> {
        info!("Uploading narration {} for transcription", audio_path.display());
        let bytes = fs::read(audio_path)?;
        let upload: UploadResponse = self
            .client
            .post(format!("{}/v2/upload", self.base_url))
            .header("authorization", &self.api_key)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let submitted: TranscriptResponse = self
            .client
            .post(format!("{}/v2/transcript", self.base_url))
            .header("authorization", &self.api_key)
            .json(&serde_json::json!({ "audio_url": upload.upload_url }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let transcript_id = submitted.id.clone();
        let mut transcript = submitted;
        let mut polls = 0;
        loop {
            match transcript.status.as_str() {
                "completed" => break,
                "error" => anyhow::bail!(
                    "Transcription failed: {}",
                    transcript.error.unwrap_or_else(|| "unknown error".into())
                ),
                other => {
                    if polls >= MAX_POLLS {
                        anyhow::bail!("Transcription did not complete (last status: {})", other);
                    }
                    tracing::debug!("Transcript {} still {}", transcript_id, other);
                    tokio::time::sleep(POLL_DELAY).await;
                }
            }
            polls += 1;
            transcript = self
                .client
                .get(format!("{}/v2/transcript/{}", self.base_url, transcript_id))
                .header("authorization", &self.api_key)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
        }

        let srt = self
            .client
            .get(format!("{}/v2/transcript/{}/srt", self.base_url, transcript_id))
            .header("authorization", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let srt_path = work_dir.join(format!("{}.srt", Uuid::new_v4()));
        fs::write(&srt_path, srt)?;
        info!("Wrote subtitles to {}", srt_path.display());
        Ok(srt_path)
    }
}

/// Fallback cue timing when no transcription service is configured: words
/// get a length-weighted share of the narration duration.
pub fn estimate_cues(script: &str, audio_duration: f64) -> Vec<SrtCue> {
    let word_re = Regex::new(r"\w[\w'-]*").unwrap();
    let words: Vec<&str> = word_re.find_iter(script).map(|m| m.as_str()).collect();
    if words.is_empty() {
        warn!("Script has no words, producing no subtitle cues");
        return Vec::new();
    }

    let alpha = 0.5;
    let total_weight: f64 = words
        .iter()
        .map(|w| (w.chars().count() as f64).powf(alpha))
        .sum();

    let mut cues = Vec::new();
    let mut cursor = 0.0;
    for word in words {
        let weight = (word.chars().count() as f64).powf(alpha);
        let duration = audio_duration * weight / total_weight;
        cues.push(SrtCue {
            start: cursor,
            end: cursor + duration,
            text: word.to_string(),
        });
        cursor += duration;
    }
    cues
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:00,000 --> 00:00:02,500\nHello there friend\n\n2\n00:00:02,500 --> 00:00:05,000\nGeneral Kenobi\n";

    #[test]
    fn parses_srt_blocks() {
        let cues = parse_srt(SAMPLE);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].text, "Hello there friend");
        assert!((cues[0].start - 0.0).abs() < 1e-9);
        assert!((cues[0].end - 2.5).abs() < 1e-9);
        assert!((cues[1].start - 2.5).abs() < 1e-9);
    }

    #[test]
    fn srt_time_formatting() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(3661.25), "01:01:01,250");
    }

    #[test]
    fn equalize_leaves_short_cues_alone() {
        let cues = vec![SrtCue {
            start: 0.0,
            end: 2.0,
            text: "only four words here".into(),
        }];
        assert_eq!(equalize(&cues, 10), cues);
    }

    #[test]
    fn equalize_splits_long_cues_evenly() {
        let text = (1..=11).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let cues = vec![SrtCue {
            start: 0.0,
            end: 11.0,
            text,
        }];
        let out = equalize(&cues, 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].words().len(), 6);
        assert_eq!(out[1].words().len(), 5);
        // Contiguous timing, one second per word.
        assert!((out[0].start - 0.0).abs() < 1e-9);
        assert!((out[0].end - 6.0).abs() < 1e-9);
        assert!((out[1].start - 6.0).abs() < 1e-9);
        assert!((out[1].end - 11.0).abs() < 1e-9);
    }

    #[test]
    fn equalize_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("autoshorts-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("subs.srt");
        fs::write(&path, SAMPLE).unwrap();
        equalize_file(&path, 2).unwrap();
        let cues = parse_srt(&fs::read_to_string(&path).unwrap());
        assert_eq!(cues.len(), 3);
        assert!(cues.iter().all(|c| c.words().len() <= 2));
    }

    #[test]
    fn estimated_cues_cover_the_audio() {
        let cues = estimate_cues("One two three.", 6.0);
        assert_eq!(cues.len(), 3);
        assert!((cues.last().unwrap().end - 6.0).abs() < 1e-9);
        for pair in cues.windows(2) {
            assert!((pair[0].end - pair[1].start).abs() < 1e-9);
        }
    }
}
