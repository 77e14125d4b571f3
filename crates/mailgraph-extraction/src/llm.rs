use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mailgraph_core::config::AppConfig;
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::llm::LanguageModelClient;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// Completions through the Anthropic Messages API and embeddings through an
/// OpenAI-compatible `/embeddings` endpoint.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    embedding_url: String,
    embedding_key: String,
    embedding_model: String,
    embedding_dimension: usize,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [UserTurn<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UserTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl AnthropicClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key: config.anthropic_api_key.clone(),
            model: config.extraction_model.clone(),
            embedding_url: config.embedding_api_url.clone(),
            embedding_key: config.embedding_api_key.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dimension: config.embedding_dimension,
        })
    }
}

#[async_trait]
impl LanguageModelClient for AnthropicClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: [UserTurn {
                role: "user",
                content: prompt,
            }],
        };

        tracing::debug!(model = %self.model, prompt_len = prompt.len(), "Requesting completion");

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| MailgraphError::LanguageModel(format!("completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailgraphError::LanguageModel(format!(
                "completion API returned {status}: {body}"
            )));
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            MailgraphError::LanguageModel(format!("unreadable completion response: {e}"))
        })?;
        let stop_reason = parsed.stop_reason;

        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .ok_or_else(|| MailgraphError::LanguageModel("completion had no text block".into()))?;

        tracing::debug!(stop_reason = ?stop_reason, response_len = text.len(), "Completion received");
        Ok(text)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.embedding_url)
            .bearer_auth(&self.embedding_key)
            .json(&EmbeddingRequest {
                model: &self.embedding_model,
                input: text,
            })
            .send()
            .await
            .map_err(|e| MailgraphError::LanguageModel(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailgraphError::LanguageModel(format!(
                "embedding API returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            MailgraphError::LanguageModel(format!("unreadable embedding response: {e}"))
        })?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MailgraphError::LanguageModel("embedding response had no data".into()))?;

        if embedding.len() != self.embedding_dimension {
            return Err(MailgraphError::LanguageModel(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.embedding_dimension
            )));
        }

        Ok(embedding)
    }

    fn embedding_dimension(&self) -> usize {
        self.embedding_dimension
    }
}
