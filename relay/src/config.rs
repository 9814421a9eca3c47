use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use url::Url;

pub const PORT_VAR: &str = "PORT";
pub const STREAM_API_KEY_VAR: &str = "AMPSERVER_API_KEY_STREAM";
pub const PROFILE_API_KEY_VAR: &str = "AMPSERVER_API_KEY";

const DEFAULT_BASE_URL: &str = "https://stellantis-ee-test.amperity.com";
const DEFAULT_TENANT: &str = "stellantis-ee-test";
const DEFAULT_STREAM_ID: &str = "is-vk4M4QcN";
const DEFAULT_PROFILE_COLLECTION_ID: &str = "apc-i6JnGvMX";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Admin listener conflicts with relay listener on port {0}")]
    PortConflict(u16),

    #[error("Empty value for {0}")]
    EmptyField(&'static str),

    #[error("Invalid upstream base url {0:?}: {1}")]
    InvalidBaseUrl(String, String),

    #[error("Timeouts must be greater than 0")]
    InvalidTimeout,

    #[error("Body limit must be greater than 0")]
    InvalidBodyLimit,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

impl Listener {
    fn admin_default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3001,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Where and how to reach the Amperity tenant.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Scheme and host of the tenant, e.g. "https://acme.amperity.com"
    pub base_url: String,
    /// Sent as `X-Amperity-Tenant` on every request
    pub tenant: String,
    /// Streaming ingest endpoint id, `/stream/v0/data/{stream_id}`
    pub stream_id: String,
    /// Profile API collection id, `/prof/profiles/{profile_collection_id}/...`
    pub profile_collection_id: String,
    /// Total time allowed for one upstream call, body included
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: DEFAULT_BASE_URL.into(),
            tenant: DEFAULT_TENANT.into(),
            stream_id: DEFAULT_STREAM_ID.into(),
            profile_collection_id: DEFAULT_PROFILE_COLLECTION_ID.into(),
            timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ValidationError::InvalidBaseUrl(self.base_url.clone(), e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidBaseUrl(
                self.base_url.clone(),
                "scheme must be http or https".into(),
            ));
        }

        for (name, value) in [
            ("upstream.tenant", &self.tenant),
            ("upstream.stream_id", &self.stream_id),
            ("upstream.profile_collection_id", &self.profile_collection_id),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyField(name));
            }
        }

        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        Ok(())
    }
}

/// Bearer tokens for the upstream. Only ever read from the environment.
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub stream_api_key: Option<String>,
    pub profile_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("stream_api_key", &redact(&self.stream_api_key))
            .field("profile_api_key", &redact(&self.profile_api_key))
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    /// Health and readiness probes
    #[serde(default = "Listener::admin_default")]
    pub admin_listener: Listener,
    /// Largest accepted inbound request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(skip)]
    pub credentials: Credentials,
}

fn default_max_body_bytes() -> usize {
    100 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            admin_listener: Listener::admin_default(),
            max_body_bytes: default_max_body_bytes(),
            upstream: UpstreamConfig::default(),
            credentials: Credentials::default(),
        }
    }
}

impl Config {
    /// Overlays `PORT` and the API keys from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(port) = non_empty(PORT_VAR) {
            self.listener.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: PORT_VAR,
                    value: port.clone(),
                })?;
        }

        self.credentials = Credentials {
            stream_api_key: non_empty(STREAM_API_KEY_VAR),
            profile_api_key: non_empty(PROFILE_API_KEY_VAR),
        };

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.admin_listener.port == self.listener.port {
            return Err(ValidationError::PortConflict(self.listener.port));
        }

        if self.max_body_bytes == 0 {
            return Err(ValidationError::InvalidBodyLimit);
        }

        self.upstream.validate()
    }
}
