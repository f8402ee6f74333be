use rand::seq::SliceRandom;
use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{Error, Result};

/// A single Azure OpenAI resource, addressed by its base URL and static key.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: String,
    key: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            key: key.into(),
        }
    }

    /// Builds the conventional `https://{service}.openai.azure.com` address.
    pub fn from_service(service: &str, key: impl Into<String>) -> Self {
        Self::new(service_url(service), key)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.base_url)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[must_use]
pub fn service_url(service: &str) -> String {
    format!("https://{service}.openai.azure.com")
}

/// Picks the endpoint that serves the next call.
pub trait Selector: Send + Sync + Debug {
    fn select<'a>(&self, endpoints: &'a [Endpoint]) -> Option<&'a Endpoint>;
}

/// Uniform draw with replacement on every call.
#[derive(Debug, Default)]
pub struct Random;

impl Selector for Random {
    fn select<'a>(&self, endpoints: &'a [Endpoint]) -> Option<&'a Endpoint> {
        endpoints.choose(&mut rand::thread_rng())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl Selector for RoundRobin {
    fn select<'a>(&self, endpoints: &'a [Endpoint]) -> Option<&'a Endpoint> {
        if endpoints.is_empty() {
            return None;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        endpoints.get(index)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    Random,
    RoundRobin,
}

impl Strategy {
    #[must_use]
    pub fn selector(self) -> Box<dyn Selector> {
        match self {
            Self::Random => Box::new(Random),
            Self::RoundRobin => Box::<RoundRobin>::default(),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "round_robin" | "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            other => Err(format!("unknown strategy `{other}`")),
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// The configured endpoints and the policy used to pick between them.
///
/// Read-only after construction; an empty pool only fails once a call asks it for an endpoint.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    selector: Box<dyn Selector>,
}

impl EndpointPool {
    #[must_use]
    pub fn new(endpoints: Vec<Endpoint>, selector: Box<dyn Selector>) -> Self {
        Self {
            endpoints,
            selector,
        }
    }

    #[must_use]
    pub fn random(endpoints: Vec<Endpoint>) -> Self {
        Self::new(endpoints, Box::new(Random))
    }

    /// Selects the endpoint for one call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyPool`] when no endpoints are configured.
    pub fn select(&self) -> Result<&Endpoint> {
        self.selector
            .select(&self.endpoints)
            .ok_or(Error::EmptyPool)
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
