use crate::config::{Config, ImageBackendKind};
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Image acquisition backend. Both variants answer a GET with a PNG body;
/// the broker is a public endpoint shared with other users, the worker is a
/// deployment-owned endpoint reached through its configured URL.
#[derive(Debug, Clone)]
pub enum ImageBackend {
    Broker,
    Worker { url: String },
}

impl ImageBackend {
    fn request_url(&self, prompt: &str) -> anyhow::Result<Url> {
        match self {
            ImageBackend::Broker => {
                let mut url = Url::parse("https://image.pollinations.ai/prompt/")?;
                url.path_segments_mut()
                    .map_err(|_| anyhow::anyhow!("Broker URL cannot carry a prompt segment"))?
                    .pop_if_empty()
                    .push(prompt);
                Ok(url)
            }
            ImageBackend::Worker { url } => {
                let mut url = Url::parse(url)?;
                url.query_pairs_mut()
                    .append_pair("prompt", prompt)
                    .append_pair("model", "sdxl");
                Ok(url)
            }
        }
    }
}

/// Image acquisition seam used by the pipeline; the production
/// implementation is [`ImageGenerator`].
#[allow(async_fn_in_trait)]
pub trait AcquireImage {
    async fn generate_image(&self, prompt: &str) -> anyhow::Result<PathBuf>;
}

/// Image acquisition collaborator. Each generated image is stored twice: a
/// working copy consumed by assembly and a durable copy kept for reuse.
pub struct ImageGenerator {
    client: reqwest::Client,
    backend: ImageBackend,
    work_dir: PathBuf,
    images_dir: PathBuf,
}

impl ImageGenerator {
    pub fn from_config(config: &Config) -> Self {
        let backend = match config.image_backend {
            ImageBackendKind::Broker => ImageBackend::Broker,
            ImageBackendKind::Worker => ImageBackend::Worker {
                // Presence is validated by Config::from_env.
                url: config.worker_url.clone().unwrap_or_default(),
            },
        };
        Self {
            client: reqwest::Client::new(),
            backend,
            work_dir: config.work_dir.clone(),
            images_dir: config.images_dir.clone(),
        }
    }

    async fn fetch(&self, prompt: &str) -> anyhow::Result<PathBuf> {
        let url = self.backend.request_url(prompt)?;
        let response = self
            .client
            .get(url)
            .timeout(CALL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("image/") {
            anyhow::bail!("Response was not an image (content-type: {})", content_type);
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            anyhow::bail!("Response body was empty");
        }

        let filename = format!("{}.png", Uuid::new_v4());
        let work_path = self.work_dir.join(&filename);
        let durable_path = self.images_dir.join(&filename);
        std::fs::write(&work_path, &bytes)?;
        std::fs::write(&durable_path, &bytes)?;
        info!(
            "Saved image for prompt {:.60} to {} (durable copy in {})",
            prompt,
            work_path.display(),
            self.images_dir.display()
        );
        Ok(work_path)
    }
}

impl AcquireImage for ImageGenerator {
    /// Fetches one image for `prompt`, retrying a bounded number of times
    /// with a fixed delay. Returns the working-copy path.
    async fn generate_image(&self, prompt: &str) -> anyhow::Result<PathBuf> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch(prompt).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!(
                        "Image generation attempt {}/{} failed for prompt {:.60}: {}",
                        attempt, MAX_ATTEMPTS, prompt, e
                    );
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        anyhow::bail!("Image generation exhausted {} attempts", MAX_ATTEMPTS)
    }
}
