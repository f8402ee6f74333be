use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, Request, Response,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    time::Duration,
};
use url::Url;

use crate::{Error, Result};

pub const DEFAULT_API_VERSION: &str = "2023-03-15-preview";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Prompt {
    Text { prompt: String },
    Chat { messages: Vec<ChatMessage> },
}

impl Prompt {
    #[must_use]
    pub const fn is_chat(&self) -> bool {
        matches!(self, Self::Chat { .. })
    }
}

impl From<&str> for Prompt {
    fn from(prompt: &str) -> Self {
        Self::Text {
            prompt: prompt.to_string(),
        }
    }
}

impl From<String> for Prompt {
    fn from(prompt: String) -> Self {
        Self::Text { prompt }
    }
}

impl From<Vec<ChatMessage>> for Prompt {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self::Chat { messages }
    }
}

/// Fully resolved parameters of one completion call, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionBody {
    #[serde(skip)]
    pub deployment: String,
    #[serde(flatten)]
    pub prompt: Prompt,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u16>,
    pub n: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingBody {
    #[serde(skip)]
    pub deployment: String,
    pub input: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChoice {
    pub text: String,
    #[serde(default)]
    pub index: u32,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<TextChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub index: u32,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

/// Raw result of a completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Completion {
    Text(TextCompletion),
    Chat(ChatCompletion),
}

impl Completion {
    #[must_use]
    pub fn usage(&self) -> Option<&Usage> {
        match self {
            Self::Text(completion) => completion.usage.as_ref(),
            Self::Chat(completion) => completion.usage.as_ref(),
        }
    }

    /// Text of the first candidate, if any.
    #[must_use]
    pub fn first_text(&self) -> Option<&str> {
        match self {
            Self::Text(completion) => completion.choices.first().map(|c| c.text.as_str()),
            Self::Chat(completion) => completion
                .choices
                .first()
                .map(|c| c.message.content.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    #[serde(default)]
    pub index: u32,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default)]
    pub model: String,
    pub data: Vec<Embedding>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: Option<String>,
    message: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Bearer(String),
}

impl Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
            Self::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// Where a single call goes and how it authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub base_url: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Completions,
    ChatCompletions,
    Embeddings,
}

impl Operation {
    const fn path(self) -> &'static str {
        match self {
            Self::Completions => "completions",
            Self::ChatCompletions => "chat/completions",
            Self::Embeddings => "embeddings",
        }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Runs a text or chat completion against `target`.
    async fn create(&self, target: &Target, body: &CompletionBody) -> Result<Completion>;

    async fn embed(&self, target: &Target, body: &EmbeddingBody) -> Result<EmbeddingResponse>;
}

/// Azure OpenAI REST binding.
#[derive(Debug, Clone)]
pub struct AzureOpenAI {
    client: Client,
    api_version: String,
}

impl AzureOpenAI {
    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be built.
    pub fn new(api_version: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(
            Client::builder().timeout(timeout).build()?,
            api_version,
        ))
    }

    pub fn with_client(client: Client, api_version: impl Into<String>) -> Self {
        Self {
            client,
            api_version: api_version.into(),
        }
    }

    fn url(&self, target: &Target, deployment: &str, operation: Operation) -> Result<Url> {
        let mut url = Url::parse(&target.base_url)?;

        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["openai", "deployments", deployment])
            .extend(operation.path().split('/'));

        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);

        Ok(url)
    }

    fn headers(credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        match credential {
            Credential::ApiKey(key) => {
                headers.insert("api-key", HeaderValue::from_str(key)?);
            }
            Credential::Bearer(token) => {
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
            }
        }

        Ok(headers)
    }

    fn build<B: Serialize + Sync>(
        &self,
        target: &Target,
        deployment: &str,
        operation: Operation,
        body: &B,
    ) -> Result<Request> {
        Ok(self
            .client
            .post(self.url(target, deployment, operation)?)
            .headers(Self::headers(&target.credential)?)
            .json(body)
            .build()?)
    }

    pub(crate) fn completion_request(&self, target: &Target, body: &CompletionBody) -> Result<Request> {
        let operation = if body.prompt.is_chat() {
            Operation::ChatCompletions
        } else {
            Operation::Completions
        };

        self.build(target, &body.deployment, operation, body)
    }

    pub(crate) fn embedding_request(&self, target: &Target, body: &EmbeddingBody) -> Result<Request> {
        self.build(target, &body.deployment, Operation::Embeddings, body)
    }

    async fn send<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let response = self.client.execute(request).await?;

        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(service_error(status.as_u16(), &body));
    }

    Ok(serde_json::from_str(&body)?)
}

pub(crate) fn service_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(ApiErrorResponse { error }) => Error::Service {
            status,
            code: error.code,
            message: error.message,
        },
        Err(_) => Error::Service {
            status,
            code: None,
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl CompletionService for AzureOpenAI {
    async fn create(&self, target: &Target, body: &CompletionBody) -> Result<Completion> {
        let request = self.completion_request(target, body)?;

        if body.prompt.is_chat() {
            self.send(request).await.map(Completion::Chat)
        } else {
            self.send(request).await.map(Completion::Text)
        }
    }

    async fn embed(&self, target: &Target, body: &EmbeddingBody) -> Result<EmbeddingResponse> {
        let request = self.embedding_request(target, body)?;

        self.send(request).await
    }
}
