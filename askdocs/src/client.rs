use std::sync::Arc;
use tracing::info;

use crate::{
    config::{Config, Deployments, ServiceMode},
    credential::TokenCache,
    endpoint::EndpointPool,
    identity::DefaultCredential,
    openai::{
        AzureOpenAI, ChatMessage, Completion, CompletionBody, CompletionService, Credential,
        EmbeddingBody, EmbeddingResponse, Prompt, Target,
    },
    Result,
};

/// Parameters of one generation call. Unset fields are filled from the client's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: Prompt,
    pub deployment: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u16>,
    pub n: u8,
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            deployment: None,
            temperature: None,
            max_tokens: None,
            n: 1,
            stop: None,
        }
    }

    #[must_use]
    pub fn deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u16) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub const fn n(mut self, n: u8) -> Self {
        self.n = n;
        self
    }

    #[must_use]
    pub fn stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingRequest {
    pub input: Vec<String>,
    pub deployment: Option<String>,
}

impl EmbeddingRequest {
    #[must_use]
    pub const fn new(input: Vec<String>) -> Self {
        Self {
            input,
            deployment: None,
        }
    }

    #[must_use]
    pub fn deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }
}

/// How calls are routed and authenticated. Fixed for the lifetime of the client.
#[derive(Debug)]
pub enum Mode {
    Pooled(EndpointPool),
    SingleTenant { base_url: String, tokens: TokenCache },
}

/// Completion, chat and embedding calls against Azure OpenAI, spread over one or more endpoints.
pub struct LlmClient {
    mode: Mode,
    service: Arc<dyn CompletionService>,
    deployments: Deployments,
    default_temperature: f32,
}

impl LlmClient {
    pub fn new(
        mode: Mode,
        service: Arc<dyn CompletionService>,
        deployments: Deployments,
        default_temperature: f32,
    ) -> Self {
        Self {
            mode,
            service,
            deployments,
            default_temperature,
        }
    }

    /// Builds a client against the real service, authenticating single-tenant calls with the
    /// credential found in the environment.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client can't be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let service = AzureOpenAI::new(&config.api_version, config.timeout)?;

        let mode = match config.mode {
            ServiceMode::Pooled => Mode::Pooled(EndpointPool::new(
                config.pool.clone(),
                config.strategy.selector(),
            )),
            ServiceMode::SingleTenant => Mode::SingleTenant {
                base_url: config.service_url(),
                tokens: TokenCache::new(Arc::new(DefaultCredential::from_env())),
            },
        };

        Ok(Self::new(
            mode,
            Arc::new(service),
            config.deployments.clone(),
            config.temperature(),
        ))
    }

    #[must_use]
    pub const fn mode(&self) -> &Mode {
        &self.mode
    }

    #[must_use]
    pub const fn deployments(&self) -> &Deployments {
        &self.deployments
    }

    /// Picks the endpoint for this call and the credential to present to it.
    async fn resolve(&self) -> Result<Target> {
        match &self.mode {
            Mode::Pooled(pool) => {
                let endpoint = pool.select()?;

                Ok(Target {
                    base_url: endpoint.base_url.clone(),
                    credential: Credential::ApiKey(endpoint.key().to_string()),
                })
            }
            Mode::SingleTenant { base_url, tokens } => {
                let token = tokens.get_valid_token().await?;

                Ok(Target {
                    base_url: base_url.clone(),
                    credential: Credential::Bearer(token.token),
                })
            }
        }
    }

    fn prepare(&self, request: CompletionRequest) -> CompletionBody {
        let deployment = request.deployment.unwrap_or_else(|| {
            if request.prompt.is_chat() {
                self.deployments.chat.clone()
            } else {
                self.deployments.completion.clone()
            }
        });

        let n = match self.mode {
            Mode::Pooled(_) => request.n,
            Mode::SingleTenant { .. } => 1,
        };

        CompletionBody {
            n,
            deployment,
            prompt: request.prompt,
            stop: request.stop,
            max_tokens: request.max_tokens,
            temperature: request.temperature.unwrap_or(self.default_temperature),
        }
    }

    /// Sends a completion or chat request to the endpoint chosen for this call.
    ///
    /// The service's response comes back untouched, and so does its error: there is no retry
    /// and no failover to another endpoint.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::EmptyPool`] if pooled mode has no endpoints.
    /// - [`crate::Error::Identity`] if a token refresh fails.
    /// - Whatever the completion service returns.
    pub async fn dispatch(&self, request: CompletionRequest) -> Result<Completion> {
        let target = self.resolve().await?;
        let body = self.prepare(request);

        info!(endpoint = %target.base_url, deployment = %body.deployment, "Using Azure OpenAI endpoint");

        self.service.create(&target, &body).await
    }

    /// Runs a plain text completion with the default parameters.
    ///
    /// # Errors
    ///
    /// See [`LlmClient::dispatch`].
    pub async fn complete(&self, prompt: &str) -> Result<Completion> {
        self.dispatch(CompletionRequest::new(prompt)).await
    }

    /// Runs a chat completion with the default parameters.
    ///
    /// # Errors
    ///
    /// See [`LlmClient::dispatch`].
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<Completion> {
        self.dispatch(CompletionRequest::new(messages)).await
    }

    /// Embeds the input through the endpoint chosen for this call.
    ///
    /// # Errors
    ///
    /// See [`LlmClient::dispatch`].
    pub async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let target = self.resolve().await?;
        let body = EmbeddingBody {
            input: request.input,
            deployment: request
                .deployment
                .unwrap_or_else(|| self.deployments.embedding.clone()),
        };

        info!(endpoint = %target.base_url, deployment = %body.deployment, "Using Azure OpenAI endpoint");

        self.service.embed(&target, &body).await
    }
}
