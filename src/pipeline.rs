use crate::assemble::{self, AssembleInput};
use crate::config::{Config, ImageBackendKind};
use crate::image_gen::{AcquireImage, ImageGenerator};
use crate::llm::{GenerateText, TextGenerator};
use crate::state::{Run, RunStatus, RunStore};
use crate::tts;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const STAGE_TOPIC: &str = "topic";
pub const STAGE_SCRIPT: &str = "script";
pub const STAGE_METADATA: &str = "metadata";
pub const STAGE_IMAGE_PROMPTS: &str = "image_prompts";
pub const STAGE_IMAGES: &str = "images";
pub const STAGE_TTS: &str = "tts";

const MAX_STAGE_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

const MAX_SCRIPT_CHARS: usize = 5000;
const MAX_TITLE_CHARS: usize = 100;
const CONSTRAINED_PROMPT_TARGET_CAP: usize = 10;
const CONSTRAINED_PROMPT_LIMIT: usize = 25;

/// How a stage attempt went wrong. `Rejected` means the collaborator
/// answered but the output failed the stage's acceptance rule, so the fix is
/// a fresh generation. `Transient` means the call itself failed and is worth
/// retrying after a delay. Store I/O errors are not stage errors; they
/// propagate as fatal through `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("output rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicPayload {
    pub subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImagePromptsPayload {
    pub prompts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImagesPayload {
    pub paths: Vec<String>,
    pub prompt_digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TtsPayload {
    pub path: String,
}

fn adopt<T: DeserializeOwned>(run: &Run, stage: &str) -> Option<T> {
    run.stage_payload(stage)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Per-run working state threaded through the stages; populated up front
/// from existing checkpoints so resumed runs skip finished work.
#[derive(Debug, Default)]
pub struct RunContext {
    pub run_id: String,
    pub niche: String,
    pub language: String,
    pub subject: Option<String>,
    pub script: Option<String>,
    pub metadata: Option<MetadataPayload>,
    pub image_prompts: Option<Vec<String>>,
    pub tts_path: Option<PathBuf>,
}

impl RunContext {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            niche: run.niche.clone(),
            language: run.language.clone(),
            subject: adopt::<TopicPayload>(run, STAGE_TOPIC).map(|p| p.subject),
            script: adopt::<ScriptPayload>(run, STAGE_SCRIPT).map(|p| p.content),
            metadata: adopt(run, STAGE_METADATA),
            image_prompts: adopt::<ImagePromptsPayload>(run, STAGE_IMAGE_PROMPTS)
                .map(|p| p.prompts),
            tts_path: adopt::<TtsPayload>(run, STAGE_TTS).map(|p| PathBuf::from(p.path)),
        }
    }
}

/// Strips markdown emphasis markers the model tends to sprinkle in.
pub fn clean_script(raw: &str) -> String {
    raw.replace('*', "")
}

pub fn validate_script(raw: &str) -> Result<String, String> {
    let cleaned = clean_script(raw);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err("generated script is empty".into());
    }
    if cleaned.chars().count() > MAX_SCRIPT_CHARS {
        return Err(format!(
            "generated script is too long ({} chars)",
            cleaned.chars().count()
        ));
    }
    Ok(cleaned)
}

pub fn validate_title(title: &str) -> Result<String, String> {
    let title = title.trim();
    if title.is_empty() {
        return Err("generated title is empty".into());
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(format!(
            "generated title is too long ({} chars)",
            title.chars().count()
        ));
    }
    Ok(title.to_string())
}

/// Number of image prompts to ask for: one per three script characters,
/// capped when the constrained broker backend is in use.
pub fn prompt_target(script_chars: usize, constrained: bool) -> usize {
    let base = script_chars / 3;
    if constrained {
        base.min(CONSTRAINED_PROMPT_TARGET_CAP)
    } else {
        base
    }
}

/// Parses the model's prompt-list answer. Code fences are dropped, then the
/// text is tried as an object carrying `image_prompts`, as a bare JSON
/// array, and finally by reparsing the first `[...]` substring. None means
/// the whole stage should regenerate.
pub fn parse_image_prompts(raw: &str) -> Option<Vec<String>> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();

    let string_items = |value: serde_json::Value| -> Option<Vec<String>> {
        let items = value
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect::<Vec<_>>();
        (!items.is_empty()).then_some(items)
    };

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(cleaned) {
        if let Some(prompts) = value.get("image_prompts").cloned().and_then(string_items) {
            return Some(prompts);
        }
        if let Some(prompts) = string_items(value) {
            return Some(prompts);
        }
    }

    let bracket = Regex::new(r"(?s)\[.*\]").unwrap();
    let candidate = bracket.find(cleaned)?.as_str();
    serde_json::from_str::<serde_json::Value>(candidate)
        .ok()
        .and_then(string_items)
}

pub fn truncate_prompts(mut prompts: Vec<String>, constrained: bool, target: usize) -> Vec<String> {
    let limit = if constrained {
        CONSTRAINED_PROMPT_LIMIT
    } else {
        target.max(1)
    };
    prompts.truncate(limit);
    prompts
}

/// Narration input: everything but word characters, whitespace and sentence
/// punctuation confuses the synthesizer and is dropped.
pub fn clean_for_tts(script: &str) -> String {
    let re = Regex::new(r"[^\w\s.?!]").unwrap();
    re.replace_all(script, "").into_owned()
}

pub fn prompt_digest(prompts: &[String]) -> String {
    let mut hasher = Sha256::new();
    for prompt in prompts {
        hasher.update(prompt.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// The images checkpoint only satisfies a resume when it covers the current
/// prompt list exactly: same count and same digest. Regenerated prompts
/// therefore invalidate stale images even at equal length.
pub fn images_checkpoint_satisfies(payload: &ImagesPayload, prompts: &[String]) -> bool {
    payload.paths.len() == prompts.len() && payload.prompt_digest == prompt_digest(prompts)
}

fn topic_prompt(niche: &str) -> String {
    format!(
        "Please generate a specific video idea that takes about the following topic: {}. \
         Make it exactly one sentence. Only return the topic, nothing else.",
        niche
    )
}

fn script_prompt(sentences: usize, subject: &str, language: &str) -> String {
    format!(
        "Generate a script for a video in {sentences} sentences, depending on the subject of the video.\n\
         \n\
         Get straight to the point, don't start with unnecessary things like \"welcome to this video\".\n\
         \n\
         YOU MUST NOT EXCEED THE {sentences} SENTENCES LIMIT. MAKE SURE THE {sentences} SENTENCES ARE SHORT.\n\
         YOU MUST NOT INCLUDE ANY TYPE OF MARKDOWN OR FORMATTING IN THE SCRIPT, NEVER USE A TITLE.\n\
         YOU MUST WRITE THE SCRIPT IN THE LANGUAGE SPECIFIED IN [LANGUAGE].\n\
         ONLY RETURN THE RAW CONTENT OF THE SCRIPT, WITHOUT SPEAKER INDICATORS OR ANY MENTION OF THIS PROMPT.\n\
         \n\
         Subject: {subject}\n\
         Language: {language}"
    )
}

fn title_prompt(subject: &str) -> String {
    format!(
        "Please generate a Video Title for the following subject, including hashtags: {}. \
         Only return the title, nothing else. Limit the title under 100 characters.",
        subject
    )
}

fn description_prompt(script: &str) -> String {
    format!(
        "Please generate a Video Description for the following script: {}. \
         Only return the description, nothing else.",
        script
    )
}

fn image_prompts_prompt(n_prompts: usize, subject: &str, script: &str) -> String {
    format!(
        "Generate {n_prompts} Image Prompts for AI Image Generation, depending on the subject of a video.\n\
         Subject: {subject}\n\
         \n\
         The image prompts are to be returned as a JSON-Array of strings.\n\
         Each prompt should be a full sentence, always including the main subject of the video.\n\
         Be emotional and use interesting adjectives to make the Image Prompt as detailed as possible.\n\
         \n\
         YOU MUST ONLY RETURN THE JSON-ARRAY OF STRINGS. YOU MUST NOT RETURN ANYTHING ELSE.\n\
         Here is an example of a JSON-Array of strings:\n\
         [\"image prompt 1\", \"image prompt 2\", \"image prompt 3\"]\n\
         \n\
         For context, here is the full text:\n\
         {script}"
    )
}

/// Bounded controller-level retry loop, shared by every collaborator-backed
/// stage. Rejections regenerate immediately; transient failures wait out the
/// retry delay first.
async fn with_retries<T>(
    stage: &str,
    mut attempt: impl AsyncFnMut() -> Result<T, StageError>,
) -> anyhow::Result<T> {
    for round in 1..=MAX_STAGE_ATTEMPTS {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(StageError::Rejected(reason)) => {
                warn!(
                    "Stage {} rejected its output (attempt {}/{}): {}",
                    stage, round, MAX_STAGE_ATTEMPTS, reason
                );
            }
            Err(StageError::Transient(e)) => {
                warn!(
                    "Stage {} hit a transient failure (attempt {}/{}): {:#}",
                    stage, round, MAX_STAGE_ATTEMPTS, e
                );
                if round < MAX_STAGE_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    anyhow::bail!("Stage {} failed after {} attempts", stage, MAX_STAGE_ATTEMPTS)
}

/// Drives one run through the fixed stage order, checkpointing each accepted
/// result and skipping stages whose checkpoint already exists.
pub struct Pipeline<'a, T = TextGenerator, I = ImageGenerator> {
    config: &'a Config,
    store: &'a mut RunStore,
    llm: T,
    images: I,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, store: &'a mut RunStore) -> Self {
        let llm = TextGenerator::from_config(config);
        let images = ImageGenerator::from_config(config);
        Self::with_collaborators(config, store, llm, images)
    }
}

impl<'a, T: GenerateText, I: AcquireImage> Pipeline<'a, T, I> {
    pub fn with_collaborators(
        config: &'a Config,
        store: &'a mut RunStore,
        llm: T,
        images: I,
    ) -> Self {
        Self {
            config,
            store,
            llm,
            images,
        }
    }

    fn fail<T2>(&mut self, run_id: &str, e: anyhow::Error) -> anyhow::Result<T2> {
        self.store.mark_failed(run_id, &format!("{:#}", e))?;
        Err(e)
    }

    /// Runs (or resumes) the full pipeline for `run_id` and returns the
    /// durable path of the finished video.
    pub async fn run(&mut self, run_id: &str) -> anyhow::Result<PathBuf> {
        let run = self
            .store
            .get(run_id)
            .ok_or_else(|| anyhow::anyhow!("Run {} not found", run_id))?
            .clone();
        match run.status {
            RunStatus::Completed => anyhow::bail!("Run {} is already completed", run_id),
            RunStatus::Failed => {
                info!("Resuming failed run {}", run_id);
                self.store.reopen(run_id)?;
            }
            _ => {}
        }

        let mut ctx = RunContext::from_run(&run);
        let constrained = self.config.image_backend == ImageBackendKind::Broker;

        // topic
        let subject = match ctx.subject.take() {
            Some(subject) => {
                info!("Adopting topic checkpoint");
                subject
            }
            None => {
                let prompt = topic_prompt(&ctx.niche);
                let result = with_retries(STAGE_TOPIC, async || {
                    let text = self.llm.generate(&prompt, &self.config.model).await?;
                    let subject = text.trim().to_string();
                    if subject.is_empty() {
                        return Err(StageError::Rejected("generated topic is empty".into()));
                    }
                    Ok(subject)
                })
                .await;
                let subject = match result {
                    Ok(subject) => subject,
                    Err(e) => return self.fail(run_id, e),
                };
                self.store.save_step(
                    run_id,
                    STAGE_TOPIC,
                    serde_json::to_value(TopicPayload {
                        subject: subject.clone(),
                    })?,
                )?;
                subject
            }
        };
        info!("Topic: {}", subject);

        // script
        let script = match ctx.script.take() {
            Some(script) => {
                info!("Adopting script checkpoint");
                script
            }
            None => {
                let prompt =
                    script_prompt(self.config.script_sentences, &subject, &ctx.language);
                let result = with_retries(STAGE_SCRIPT, async || {
                    let text = self.llm.generate(&prompt, &self.config.model).await?;
                    validate_script(&text).map_err(StageError::Rejected)
                })
                .await;
                let script = match result {
                    Ok(script) => script,
                    Err(e) => return self.fail(run_id, e),
                };
                self.store.save_step(
                    run_id,
                    STAGE_SCRIPT,
                    serde_json::to_value(ScriptPayload {
                        content: script.clone(),
                    })?,
                )?;
                script
            }
        };

        // metadata
        if ctx.metadata.take().is_some() {
            info!("Adopting metadata checkpoint");
        } else {
            let result = with_retries(STAGE_METADATA, async || {
                let title = self
                    .llm
                    .generate(&title_prompt(&subject), &self.config.model)
                    .await?;
                let title = validate_title(&title).map_err(StageError::Rejected)?;
                let description = self
                    .llm
                    .generate(&description_prompt(&script), &self.config.model)
                    .await?;
                Ok(MetadataPayload {
                    title,
                    description: description.trim().to_string(),
                })
            })
            .await;
            let metadata = match result {
                Ok(metadata) => metadata,
                Err(e) => return self.fail(run_id, e),
            };
            info!("Title: {}", metadata.title);
            self.store
                .save_step(run_id, STAGE_METADATA, serde_json::to_value(metadata)?)?;
        }

        // image prompts
        let prompts = match ctx.image_prompts.take() {
            Some(prompts) => {
                info!("Adopting {} image prompt(s) from checkpoint", prompts.len());
                prompts
            }
            None => {
                let target = prompt_target(script.chars().count(), constrained).max(1);
                let prompt = image_prompts_prompt(target, &subject, &script);
                let result = with_retries(STAGE_IMAGE_PROMPTS, async || {
                    let text = self
                        .llm
                        .generate(&prompt, &self.config.image_prompt_model)
                        .await?;
                    parse_image_prompts(&text).ok_or_else(|| {
                        StageError::Rejected("no parsable prompt list in response".into())
                    })
                })
                .await;
                let prompts = match result {
                    Ok(parsed) => truncate_prompts(parsed, constrained, target),
                    Err(e) => return self.fail(run_id, e),
                };
                info!("Generated {} image prompt(s)", prompts.len());
                self.store.save_step(
                    run_id,
                    STAGE_IMAGE_PROMPTS,
                    serde_json::to_value(ImagePromptsPayload {
                        prompts: prompts.clone(),
                    })?,
                )?;
                prompts
            }
        };

        // images: all-or-nothing per prompt list, keyed by digest
        let digest = prompt_digest(&prompts);
        let existing = self
            .store
            .get(run_id)
            .and_then(|run| adopt::<ImagesPayload>(run, STAGE_IMAGES));
        let image_paths: Vec<PathBuf> = match existing {
            Some(payload) if images_checkpoint_satisfies(&payload, &prompts) => {
                info!("Adopting {} image(s) from checkpoint", payload.paths.len());
                payload.paths.into_iter().map(PathBuf::from).collect()
            }
            _ => {
                let mut paths = Vec::new();
                for prompt in &prompts {
                    match self.images.generate_image(prompt).await {
                        Ok(path) => paths.push(path),
                        Err(e) => {
                            warn!("Skipping image prompt {:.60}: {:#}", prompt, e);
                        }
                    }
                }
                if paths.is_empty() {
                    return self.fail(
                        run_id,
                        anyhow::anyhow!("No images could be generated for any prompt"),
                    );
                }
                self.store.save_step(
                    run_id,
                    STAGE_IMAGES,
                    serde_json::to_value(ImagesPayload {
                        paths: paths
                            .iter()
                            .map(|p| p.to_string_lossy().into_owned())
                            .collect(),
                        prompt_digest: digest,
                    })?,
                )?;
                paths
            }
        };

        // tts: always keyed to the cleaned script; checkpointed audio is
        // reused verbatim
        let narration_script = clean_for_tts(&script);
        let tts_path = match ctx.tts_path.take() {
            Some(path) => {
                info!("Adopting narration checkpoint: {}", path.display());
                path
            }
            None => {
                let path = match tts::synthesize(
                    &self.config.piper_model,
                    &narration_script,
                    &self.config.work_dir,
                ) {
                    Ok(path) => path,
                    Err(e) => return self.fail(run_id, e),
                };
                self.store.save_step(
                    run_id,
                    STAGE_TTS,
                    serde_json::to_value(TtsPayload {
                        path: path.to_string_lossy().into_owned(),
                    })?,
                )?;
                path
            }
        };

        // assemble
        let input = AssembleInput {
            image_paths,
            tts_path,
            script: narration_script,
        };
        let video_path = match assemble::assemble(self.config, &input).await {
            Ok(path) => path,
            Err(e) => return self.fail(run_id, e),
        };
        self.store
            .mark_completed(run_id, &video_path.to_string_lossy())?;
        info!("Run {} completed: {}", run_id, video_path.display());
        Ok(video_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[test]
    fn clean_script_strips_emphasis_markers() {
        assert_eq!(clean_script("**Bold** and *italic*"), "Bold and italic");
    }

    #[test]
    fn script_acceptance_bounds() {
        assert!(validate_script("").is_err());
        assert!(validate_script("   ").is_err());
        let ok = "a".repeat(MAX_SCRIPT_CHARS);
        assert_eq!(validate_script(&ok).unwrap().chars().count(), MAX_SCRIPT_CHARS);
        let long = "a".repeat(MAX_SCRIPT_CHARS + 1);
        assert!(validate_script(&long).is_err());
        // Stripping can bring an oversized draft back under the limit.
        let starry = format!("{}{}", "*".repeat(10), "a".repeat(MAX_SCRIPT_CHARS));
        assert!(validate_script(&starry).is_ok());
    }

    #[test]
    fn title_acceptance_bounds() {
        assert!(validate_title("").is_err());
        assert!(validate_title(&"t".repeat(100)).is_ok());
        assert!(validate_title(&"t".repeat(101)).is_err());
    }

    #[test]
    fn prompt_parsing_object_form() {
        assert_eq!(
            parse_image_prompts(r#"{"image_prompts": ["a", "b"]}"#).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn prompt_parsing_bare_array() {
        assert_eq!(
            parse_image_prompts(r#"["x", "y", "z"]"#).unwrap(),
            vec!["x", "y", "z"]
        );
    }

    #[test]
    fn prompt_parsing_bracket_fallback() {
        assert_eq!(
            parse_image_prompts(r#"Here you go: ["a","b","c"]"#).unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn prompt_parsing_strips_code_fences() {
        let raw = "```json\n[\"one\", \"two\"]\n```";
        assert_eq!(parse_image_prompts(raw).unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn prompt_parsing_rejects_unusable_responses() {
        assert!(parse_image_prompts("no list here at all").is_none());
        assert!(parse_image_prompts("[]").is_none());
        assert!(parse_image_prompts(r#"{"other": 1}"#).is_none());
    }

    #[test]
    fn prompt_target_caps_constrained_backend() {
        assert_eq!(prompt_target(5000, true), 10);
        assert_eq!(prompt_target(5000, false), 1666);
        assert_eq!(prompt_target(9, true), 3);
    }

    #[test]
    fn prompt_truncation_limits() {
        let many: Vec<String> = (0..40).map(|i| format!("p{}", i)).collect();
        assert_eq!(truncate_prompts(many.clone(), true, 10).len(), 25);
        assert_eq!(truncate_prompts(many, false, 12).len(), 12);
    }

    #[test]
    fn tts_cleaning_keeps_words_and_sentence_punctuation() {
        assert_eq!(
            clean_for_tts("Hello, \"world\"! Is *this* ok?"),
            "Hello world! Is this ok?"
        );
    }

    #[test]
    fn digest_tracks_prompt_list_content() {
        let a = vec!["one".to_string(), "two".to_string()];
        let b = vec!["one".to_string(), "three".to_string()];
        assert_eq!(prompt_digest(&a), prompt_digest(&a));
        assert_ne!(prompt_digest(&a), prompt_digest(&b));
        // Same joined text, different boundaries.
        let c = vec!["onetwo".to_string()];
        assert_ne!(prompt_digest(&a), prompt_digest(&c));
    }

    #[test]
    fn images_checkpoint_requires_matching_count_and_digest() {
        let prompts = vec!["a".to_string(), "b".to_string()];
        let good = ImagesPayload {
            paths: vec!["1.png".into(), "2.png".into()],
            prompt_digest: prompt_digest(&prompts),
        };
        assert!(images_checkpoint_satisfies(&good, &prompts));

        let short = ImagesPayload {
            paths: vec!["1.png".into()],
            prompt_digest: prompt_digest(&prompts),
        };
        assert!(!images_checkpoint_satisfies(&short, &prompts));

        let stale = ImagesPayload {
            paths: vec!["1.png".into(), "2.png".into()],
            prompt_digest: prompt_digest(&["a".to_string(), "c".to_string()]),
        };
        assert!(!images_checkpoint_satisfies(&stale, &prompts));
    }

    fn run_with_checkpoints() -> Run {
        let mut data = BTreeMap::new();
        data.insert(
            STAGE_TOPIC.to_string(),
            serde_json::json!({"subject": "volcano facts"}),
        );
        data.insert(
            STAGE_SCRIPT.to_string(),
            serde_json::json!({"content": "Lava is hot."}),
        );
        data.insert(
            STAGE_TTS.to_string(),
            serde_json::json!({"path": "/tmp/narration.wav"}),
        );
        Run {
            id: "run-1".into(),
            niche: "Science".into(),
            language: "English".into(),
            status: RunStatus::InProgress,
            steps_completed: vec![
                STAGE_TOPIC.into(),
                STAGE_SCRIPT.into(),
                STAGE_TTS.into(),
            ],
            data,
            created_at: Utc::now(),
            last_updated: Some(Utc::now()),
            completed_at: None,
            video_path: None,
            failed_at: None,
            error: None,
        }
    }

    #[test]
    fn context_adopts_existing_checkpoints() {
        let ctx = RunContext::from_run(&run_with_checkpoints());
        assert_eq!(ctx.subject.as_deref(), Some("volcano facts"));
        assert_eq!(ctx.script.as_deref(), Some("Lava is hot."));
        assert_eq!(ctx.tts_path, Some(PathBuf::from("/tmp/narration.wav")));
        assert!(ctx.metadata.is_none());
        assert!(ctx.image_prompts.is_none());
    }

    struct ScriptedText {
        calls: Arc<AtomicUsize>,
        reply: &'static str,
    }

    impl GenerateText for ScriptedText {
        async fn generate(&self, _prompt: &str, _model: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
    }

    struct ScriptedImages {
        calls: Arc<AtomicUsize>,
    }

    impl AcquireImage for ScriptedImages {
        async fn generate_image(&self, _prompt: &str) -> anyhow::Result<PathBuf> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from(format!("/nonexistent/{}.png", n)))
        }
    }

    fn store_in_temp() -> (Config, RunStore) {
        let dir = std::env::temp_dir().join(format!("autoshorts-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
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
            image_backend: ImageBackendKind::Broker,
            worker_url: None,
            piper_model: "model.onnx".into(),
            transcribe_url: None,
            transcribe_api_key: None,
            openrouter_api_key: None,
            groq_api_key: None,
        };
        let store = RunStore::open(&config.state_file).unwrap();
        (config, store)
    }

    #[tokio::test]
    async fn resume_invokes_no_collaborators_for_checkpointed_stages() {
        let (config, mut store) = store_in_temp();
        let run_id = store.create("Science", "English").unwrap();
        let prompts = vec!["a molten crater".to_string(), "ash clouds".to_string()];
        store
            .save_step(
                &run_id,
                STAGE_TOPIC,
                serde_json::json!({"subject": "volcano facts"}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_SCRIPT,
                serde_json::json!({"content": "Lava is hot."}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_METADATA,
                serde_json::json!({"title": "Volcanoes", "description": "Hot rocks."}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_IMAGE_PROMPTS,
                serde_json::json!({"prompts": prompts.clone()}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_IMAGES,
                serde_json::to_value(ImagesPayload {
                    paths: vec!["/nonexistent/0.png".into(), "/nonexistent/1.png".into()],
                    prompt_digest: prompt_digest(&prompts),
                })
                .unwrap(),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_TTS,
                serde_json::json!({"path": "/nonexistent/narration.wav"}),
            )
            .unwrap();

        let text_calls = Arc::new(AtomicUsize::new(0));
        let image_calls = Arc::new(AtomicUsize::new(0));
        let result = Pipeline::with_collaborators(
            &config,
            &mut store,
            ScriptedText {
                calls: text_calls.clone(),
                reply: "",
            },
            ScriptedImages {
                calls: image_calls.clone(),
            },
        )
        .run(&run_id)
        .await;

        // Every generation stage is adopted from its checkpoint; the only
        // failure left is assembly's, with no loadable images on disk.
        assert!(result.is_err());
        assert_eq!(text_calls.load(Ordering::SeqCst), 0);
        assert_eq!(image_calls.load(Ordering::SeqCst), 0);
        let run = store.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.video_path.is_none());
    }

    #[tokio::test]
    async fn resume_regenerates_only_missing_stages() {
        let (config, mut store) = store_in_temp();
        let run_id = store.create("Science", "English").unwrap();
        store
            .save_step(
                &run_id,
                STAGE_TOPIC,
                serde_json::json!({"subject": "volcano facts"}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_SCRIPT,
                serde_json::json!({"content": "Lava is hot."}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_METADATA,
                serde_json::json!({"title": "Volcanoes", "description": "Hot rocks."}),
            )
            .unwrap();
        store
            .save_step(
                &run_id,
                STAGE_TTS,
                serde_json::json!({"path": "/nonexistent/narration.wav"}),
            )
            .unwrap();

        let text_calls = Arc::new(AtomicUsize::new(0));
        let image_calls = Arc::new(AtomicUsize::new(0));
        let result = Pipeline::with_collaborators(
            &config,
            &mut store,
            ScriptedText {
                calls: text_calls.clone(),
                reply: r#"["a molten crater", "ash clouds"]"#,
            },
            ScriptedImages {
                calls: image_calls.clone(),
            },
        )
        .run(&run_id)
        .await;

        // Only the two missing stages hit their collaborators: one text call
        // for the prompt list, one image call per parsed prompt.
        assert!(result.is_err());
        assert_eq!(text_calls.load(Ordering::SeqCst), 1);
        assert_eq!(image_calls.load(Ordering::SeqCst), 2);
        let run = store.get(&run_id).unwrap();
        assert!(run.stage_payload(STAGE_IMAGE_PROMPTS).is_some());
        assert!(run.stage_payload(STAGE_IMAGES).is_some());
        assert_eq!(run.status, RunStatus::Failed);
    }
}
