#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

mod client;
pub mod config;
pub mod credential;
pub mod endpoint;
mod error;
pub mod identity;
pub mod openai;

pub use client::{CompletionRequest, EmbeddingRequest, LlmClient, Mode};
pub use config::{Config, Deployments, ServiceMode};
pub use credential::{AccessToken, TokenCache, TokenProvider};
pub use endpoint::{Endpoint, EndpointPool, Strategy};
pub use error::{Error, Result};
pub use identity::DefaultCredential;
pub use openai::{AzureOpenAI, ChatMessage, Completion, CompletionService};
