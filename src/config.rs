use std::env;
use std::fs;
use std::path::PathBuf;

/// Which image acquisition backend a run uses. The broker is a public
/// multi-provider endpoint with tighter prompt limits; the worker is a
/// self-hosted endpoint configured per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBackendKind {
    Broker,
    Worker,
}

/// Runtime configuration, read once from the environment in `main` and
/// threaded by reference through the pipeline. No module reads env vars
/// on its own.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_file: PathBuf,
    pub work_dir: PathBuf,
    pub images_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub songs_dir: PathBuf,

    pub niche: String,
    pub language: String,

    pub model: String,
    pub image_prompt_model: String,
    pub script_sentences: usize,

    pub image_backend: ImageBackendKind,
    pub worker_url: Option<String>,

    pub piper_model: String,

    pub transcribe_url: Option<String>,
    pub transcribe_api_key: Option<String>,

    pub openrouter_api_key: Option<String>,
    pub groq_api_key: Option<String>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let model = var_or("AUTOSHORTS_MODEL", "gpt-4o-mini");
        let image_backend = match var_or("AUTOSHORTS_IMAGE_BACKEND", "broker").as_str() {
            "worker" => ImageBackendKind::Worker,
            "broker" => ImageBackendKind::Broker,
            other => anyhow::bail!("Unknown AUTOSHORTS_IMAGE_BACKEND: {}", other),
        };

        let config = Self {
            state_file: var_or("AUTOSHORTS_STATE_FILE", "./.state/runs.json").into(),
            work_dir: var_or("AUTOSHORTS_WORK_DIR", "./.mp").into(),
            images_dir: var_or("AUTOSHORTS_IMAGES_DIR", "./images").into(),
            videos_dir: var_or("AUTOSHORTS_VIDEOS_DIR", "./videos").into(),
            songs_dir: var_or("AUTOSHORTS_SONGS_DIR", "./songs").into(),
            niche: var_or("AUTOSHORTS_NICHE", "Science"),
            language: var_or("AUTOSHORTS_LANGUAGE", "English"),
            image_prompt_model: var_or("AUTOSHORTS_IMAGE_PROMPT_MODEL", &model),
            model,
            script_sentences: var_or("AUTOSHORTS_SCRIPT_SENTENCES", "12").parse()?,
            image_backend,
            worker_url: var_opt("AUTOSHORTS_WORKER_URL"),
            piper_model: var_or("AUTOSHORTS_PIPER_MODEL", "./tts/en_US-amy-medium.onnx"),
            transcribe_url: var_opt("AUTOSHORTS_TRANSCRIBE_URL"),
            transcribe_api_key: var_opt("AUTOSHORTS_TRANSCRIBE_API_KEY"),
            openrouter_api_key: var_opt("OPENROUTER_API_KEY"),
            groq_api_key: var_opt("GROQ_API_KEY"),
        };

        if config.image_backend == ImageBackendKind::Worker && config.worker_url.is_none() {
            anyhow::bail!("AUTOSHORTS_IMAGE_BACKEND=worker requires AUTOSHORTS_WORKER_URL");
        }

        Ok(config)
    }

    /// Creates the working and durable directories if they are missing.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.work_dir, &self.images_dir, &self.videos_dir] {
            fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
