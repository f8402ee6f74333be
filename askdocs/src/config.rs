use std::{env, str::FromStr, time::Duration};

use crate::{
    endpoint::{service_url, Endpoint, Strategy},
    openai::DEFAULT_API_VERSION,
    Error, Result,
};

pub const DEFAULT_SERVICE: &str = "myopenai";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const POOLED_TEMPERATURE: f32 = 0.1;
const SINGLE_TENANT_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// Several endpoints with static keys, one picked per call.
    Pooled,
    /// One endpoint authenticated with a rotating bearer token.
    SingleTenant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployments {
    pub completion: String,
    pub chat: String,
    pub gpt4: String,
    pub embedding: String,
}

impl Default for Deployments {
    fn default() -> Self {
        Self {
            completion: "davinci".to_string(),
            chat: "chat".to_string(),
            gpt4: "gpt4".to_string(),
            embedding: "embedding".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ServiceMode,
    pub pool: Vec<Endpoint>,
    pub gpt4_pool: Vec<Endpoint>,
    /// Service name used in single-tenant mode.
    pub service: String,
    pub deployments: Deployments,
    pub default_temperature: Option<f32>,
    pub api_version: String,
    pub strategy: Strategy,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ServiceMode::SingleTenant,
            pool: vec![],
            gpt4_pool: vec![],
            service: DEFAULT_SERVICE.to_string(),
            deployments: Deployments::default(),
            default_temperature: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            strategy: Strategy::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Fails when a numeric or enumerated variable holds a value that can't be parsed.
    /// Missing variables fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Fails when a numeric or enumerated variable holds a value that can't be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();
        let deployments = Deployments::default();

        let mode = match var("USE_AZURE_OPENAI") {
            Some(flag) if parse_flag(&flag) => ServiceMode::Pooled,
            _ => ServiceMode::SingleTenant,
        };

        Ok(Self {
            mode,
            pool: scan_pool(&var, "AZURE_OPENAI_SERVICE"),
            gpt4_pool: scan_pool(&var, "AZURE_OPENAI_GPT4_SERVICE"),
            service: var("AZURE_OPENAI_SERVICE").unwrap_or(defaults.service),
            deployments: Deployments {
                completion: var("AZURE_OPENAI_GPT_DEPLOYMENT").unwrap_or(deployments.completion),
                chat: var("AZURE_OPENAI_CHATGPT_DEPLOYMENT").unwrap_or(deployments.chat),
                gpt4: var("AZURE_OPENAI_GPT4_DEPLOYMENT").unwrap_or(deployments.gpt4),
                embedding: var("AZURE_OPENAI_EMB_DEPLOYMENT").unwrap_or(deployments.embedding),
            },
            default_temperature: var("AZURE_OPENAI_DEFAULT_TEMP")
                .map(|value| {
                    parse_temperature(&value)
                        .map_err(|message| Error::config("AZURE_OPENAI_DEFAULT_TEMP", message))
                })
                .transpose()?,
            api_version: var("AZURE_OPENAI_API_VERSION").unwrap_or(defaults.api_version),
            strategy: parse_var(&var, "AZURE_OPENAI_ROUTING")?.unwrap_or_default(),
            timeout: parse_var(&var, "AZURE_OPENAI_TIMEOUT_SECS")?
                .map_or(defaults.timeout, Duration::from_secs),
        })
    }

    /// The temperature used when a request doesn't set one.
    #[must_use]
    pub fn temperature(&self) -> f32 {
        self.default_temperature.unwrap_or(match self.mode {
            ServiceMode::Pooled => POOLED_TEMPERATURE,
            ServiceMode::SingleTenant => SINGLE_TENANT_TEMPERATURE,
        })
    }

    /// Address of the single-tenant endpoint.
    #[must_use]
    pub fn service_url(&self) -> String {
        service_url(&self.service)
    }

    /// The same configuration, routed to the GPT-4 pool and deployment.
    #[must_use]
    pub fn gpt4(&self) -> Self {
        let mut config = self.clone();
        config.pool = self.gpt4_pool.clone();
        config.deployments.completion = self.deployments.gpt4.clone();
        config.deployments.chat = self.deployments.gpt4.clone();

        config
    }
}

/// Parses a sampling temperature, accepting only finite values in `0.0..=2.0`.
///
/// # Errors
///
/// Returns a description of the problem when the value is not a number or is out of range.
pub fn parse_temperature(value: &str) -> std::result::Result<f32, String> {
    let temperature = value
        .trim()
        .parse::<f32>()
        .map_err(|e| format!("`{value}` is not a number: {e}"))?;

    if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
        return Err(format!("`{value}` is outside 0.0..=2.0"));
    }

    Ok(temperature)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_var<T, F>(var: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: ToString,
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|value| value.trim().parse().map_err(|e: T::Err| Error::config(key, e.to_string())))
        .transpose()
}

/// Collects `{prefix}_1`, `{prefix}_2`, ... and their `_KEY` companions until the first gap.
fn scan_pool<F>(var: &F, prefix: &str) -> Vec<Endpoint>
where
    F: Fn(&str) -> Option<String>,
{
    (1..)
        .map_while(|i| {
            let service = var(&format!("{prefix}_{i}"))?;
            let key = var(&format!("{prefix}_{i}_KEY")).unwrap_or_default();

            Some(Endpoint::from_service(&service, key))
        })
        .collect()
}
