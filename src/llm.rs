use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_ROUNDS: usize = 3;
const ROUND_DELAY: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The closed set of chat-completion backends. All speak the OpenAI chat
/// format; they differ only in endpoint and credentials.
#[derive(Debug, Clone)]
pub enum TextProvider {
    OpenRouter { api_key: String },
    Groq { api_key: String },
    Pollinations,
}

impl TextProvider {
    fn name(&self) -> &'static str {
        match self {
            TextProvider::OpenRouter { .. } => "openrouter",
            TextProvider::Groq { .. } => "groq",
            TextProvider::Pollinations => "pollinations",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            TextProvider::OpenRouter { .. } => "https://openrouter.ai/api/v1/chat/completions",
            TextProvider::Groq { .. } => "https://api.groq.com/openai/v1/chat/completions",
            TextProvider::Pollinations => "https://text.pollinations.ai/openai",
        }
    }

    fn api_key(&self) -> Option<&str> {
        match self {
            TextProvider::OpenRouter { api_key } | TextProvider::Groq { api_key } => Some(api_key),
            TextProvider::Pollinations => None,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Text generation seam used by the pipeline; the production implementation
/// is [`TextGenerator`].
#[allow(async_fn_in_trait)]
pub trait GenerateText {
    async fn generate(&self, prompt: &str, model: &str) -> anyhow::Result<String>;
}

/// Text-generation collaborator. Providers are tried in a fixed priority
/// order; a full round over all of them is followed by a fixed delay before
/// the next round, up to a bounded number of rounds.
pub struct TextGenerator {
    client: reqwest::Client,
    providers: Vec<TextProvider>,
}

impl TextGenerator {
    pub fn from_config(config: &Config) -> Self {
        let mut providers = Vec::new();
        if let Some(key) = &config.openrouter_api_key {
            providers.push(TextProvider::OpenRouter {
                api_key: key.clone(),
            });
        }
        if let Some(key) = &config.groq_api_key {
            providers.push(TextProvider::Groq {
                api_key: key.clone(),
            });
        }
        providers.push(TextProvider::Pollinations);
        Self {
            client: reqwest::Client::new(),
            providers,
        }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(TextProvider::name).collect()
    }

    async fn call(
        &self,
        provider: &TextProvider,
        prompt: &str,
        model: &str,
    ) -> anyhow::Result<String> {
        let body = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = self
            .client
            .post(provider.endpoint())
            .timeout(CALL_TIMEOUT)
            .json(&body);
        if let Some(key) = provider.api_key() {
            request = request.bearer_auth(key);
        }

        let response: ChatResponse = request.send().await?.error_for_status()?.json().await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Response contained no choices"))?;
        Ok(choice.message.content)
    }
}

impl GenerateText for TextGenerator {
    async fn generate(&self, prompt: &str, model: &str) -> anyhow::Result<String> {
        debug!("LLM request ({}): {:.200}", model, prompt.replace('\n', " "));

        for round in 0..MAX_ROUNDS {
            for provider in &self.providers {
                match self.call(provider, prompt, model).await {
                    Ok(text) if !text.trim().is_empty() => {
                        info!("LLM response from {} ({} chars)", provider.name(), text.len());
                        return Ok(text);
                    }
                    Ok(_) => warn!("Provider {} returned an empty response", provider.name()),
                    Err(e) => warn!("Provider {} failed: {}", provider.name(), e),
                }
            }
            if round + 1 < MAX_ROUNDS {
                warn!(
                    "All providers failed on round {}, retrying in {:?}",
                    round + 1,
                    ROUND_DELAY
                );
                tokio::time::sleep(ROUND_DELAY).await;
            }
        }
        anyhow::bail!("All text providers failed after {} rounds", MAX_ROUNDS)
    }
}
