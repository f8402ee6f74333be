use async_trait::async_trait;
use reqwest::{Client, Request};
use serde::{Deserialize, Deserializer};
use std::{
    env,
    fmt::{self, Debug},
};
use tracing::debug;

use crate::{
    credential::{AccessToken, Clock, SystemClock, TokenProvider},
    Error, Result,
};

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    expires_in: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    expires_on: Option<i64>,
}

impl TokenResponse {
    fn into_token(self, now: i64) -> Result<AccessToken> {
        let expires_on = match (self.expires_on, self.expires_in) {
            (Some(expires_on), _) => expires_on,
            (None, Some(expires_in)) => now + expires_in,
            (None, None) => {
                return Err(Error::identity("token response carries no expiry"))
            }
        };

        Ok(AccessToken::new(self.access_token, expires_on))
    }
}

/// Azure sends expiry fields either as numbers or as numeric strings.
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

async fn fetch_token(client: &Client, request: Request, now: i64) -> Result<AccessToken> {
    let response = client
        .execute(request)
        .await
        .map_err(|e| Error::identity_from("token request failed", e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::identity_from("failed to read token response", e))?;

    parse_token_response(status.as_u16(), &body, now)
}

fn parse_token_response(status: u16, body: &str, now: i64) -> Result<AccessToken> {
    if !(200..300).contains(&status) {
        return Err(Error::identity(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    serde_json::from_str::<TokenResponse>(body)
        .map_err(|e| Error::identity_from("invalid token response", e))?
        .into_token(now)
}

/// OAuth2 client-credentials grant against Azure AD.
#[derive(Clone)]
pub struct ClientSecretCredential {
    client: Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority_host: String,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
        }
    }

    #[must_use]
    pub fn authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    fn request(&self, scope: &str) -> Result<Request> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        );

        self.client
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .build()
            .map_err(|e| Error::identity_from("invalid token request", e))
    }
}

impl Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("authority_host", &self.authority_host)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        debug!(tenant = %self.tenant_id, "Requesting token with client secret");

        fetch_token(&self.client, self.request(scope)?, SystemClock.now()).await
    }
}

#[derive(Clone, PartialEq, Eq)]
enum IdentitySource {
    /// Azure Instance Metadata Service.
    Imds { endpoint: String },
    /// App Service / Functions identity endpoint.
    AppService { endpoint: String, secret: String },
}

impl Debug for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Imds { endpoint } => write!(f, "Imds({endpoint})"),
            Self::AppService { endpoint, .. } => write!(f, "AppService({endpoint})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    client: Client,
    source: IdentitySource,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    #[must_use]
    pub fn imds(client_id: Option<String>) -> Self {
        Self {
            client_id,
            client: Client::new(),
            source: IdentitySource::Imds {
                endpoint: IMDS_ENDPOINT.to_string(),
            },
        }
    }

    pub fn app_service(
        endpoint: impl Into<String>,
        secret: impl Into<String>,
        client_id: Option<String>,
    ) -> Self {
        Self {
            client_id,
            client: Client::new(),
            source: IdentitySource::AppService {
                endpoint: endpoint.into(),
                secret: secret.into(),
            },
        }
    }

    /// Uses the App Service endpoint when `IDENTITY_ENDPOINT` and `IDENTITY_HEADER` are set, IMDS otherwise.
    #[must_use]
    pub fn from_env() -> Self {
        let client_id = non_empty_var("AZURE_CLIENT_ID");

        match (
            non_empty_var("IDENTITY_ENDPOINT"),
            non_empty_var("IDENTITY_HEADER"),
        ) {
            (Some(endpoint), Some(secret)) => Self::app_service(endpoint, secret, client_id),
            _ => Self::imds(client_id),
        }
    }

    fn request(&self, scope: &str) -> Result<Request> {
        // The v1 identity endpoints take a resource, not a scope.
        let resource = scope.strip_suffix("/.default").unwrap_or(scope);

        let builder = match &self.source {
            IdentitySource::Imds { endpoint } => self
                .client
                .get(endpoint)
                .header("Metadata", "true")
                .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)]),
            IdentitySource::AppService { endpoint, secret } => self
                .client
                .get(endpoint)
                .header("X-IDENTITY-HEADER", secret)
                .query(&[
                    ("api-version", APP_SERVICE_API_VERSION),
                    ("resource", resource),
                ]),
        };

        let builder = match &self.client_id {
            Some(client_id) => builder.query(&[("client_id", client_id)]),
            None => builder,
        };

        builder
            .build()
            .map_err(|e| Error::identity_from("invalid token request", e))
    }
}

#[async_trait]
impl TokenProvider for ManagedIdentityCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        debug!(client_id = ?self.client_id, "Requesting token from managed identity");

        fetch_token(&self.client, self.request(scope)?, SystemClock.now()).await
    }
}

/// Credential chosen from the environment at startup.
#[derive(Debug, Clone)]
pub enum DefaultCredential {
    ClientSecret(ClientSecretCredential),
    ManagedIdentity(ManagedIdentityCredential),
}

impl DefaultCredential {
    /// Client secret when `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET` are all set,
    /// managed identity otherwise.
    #[must_use]
    pub fn from_env() -> Self {
        match (
            non_empty_var("AZURE_TENANT_ID"),
            non_empty_var("AZURE_CLIENT_ID"),
            non_empty_var("AZURE_CLIENT_SECRET"),
        ) {
            (Some(tenant), Some(client_id), Some(secret)) => {
                let mut credential = ClientSecretCredential::new(tenant, client_id, secret);
                if let Some(host) = non_empty_var("AZURE_AUTHORITY_HOST") {
                    credential = credential.authority_host(host);
                }

                Self::ClientSecret(credential)
            }
            _ => Self::ManagedIdentity(ManagedIdentityCredential::from_env()),
        }
    }
}

#[async_trait]
impl TokenProvider for DefaultCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        match self {
            Self::ClientSecret(credential) => credential.get_token(scope).await,
            Self::ManagedIdentity(credential) => credential.get_token(scope).await,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}
