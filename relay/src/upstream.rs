//! Client for the Amperity tenant the relay forwards to.
//!
//! Every call carries the tenant header and, when configured, a bearer token.
//! Nothing is retried: the first failure is reported back to the caller.

use crate::config::{Credentials, UpstreamConfig};
use crate::errors::{ForwardError, RelayError};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::RequestBuilder;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const TENANT_HEADER: &str = "X-Amperity-Tenant";

/// Everything `encodeURIComponent` escapes: all but alphanumerics and `-_.!~*'()`.
const PATH_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encodes a caller supplied value so it stays a single path segment.
pub fn encode_path_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_COMPONENT).to_string()
}

/// The two read endpoints of the profile API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileResource {
    Profile,
    Segments,
}

#[derive(Clone)]
pub struct AmperityClient {
    client: reqwest::Client,
    base_url: Url,
    tenant: String,
    stream_id: String,
    profile_collection_id: String,
    credentials: Credentials,
}

impl AmperityClient {
    pub fn new(config: &UpstreamConfig, credentials: Credentials) -> Result<Self, RelayError> {
        let base_url = Url::parse(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(concat!("amprelay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(AmperityClient {
            client,
            base_url,
            tenant: config.tenant.clone(),
            stream_id: config.stream_id.clone(),
            profile_collection_id: config.profile_collection_id.clone(),
            credentials,
        })
    }

    fn base(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn event_url(&self) -> String {
        format!(
            "{}/stream/v0/data/{}",
            self.base(),
            encode_path_segment(&self.stream_id)
        )
    }

    pub fn profile_url(&self, amp_id: &str, resource: ProfileResource) -> String {
        let profile = format!(
            "{}/prof/profiles/{}/{}",
            self.base(),
            encode_path_segment(&self.profile_collection_id),
            encode_path_segment(amp_id)
        );

        match resource {
            ProfileResource::Profile => profile,
            ProfileResource::Segments => format!("{profile}/segments"),
        }
    }

    /// Posts one event to the streaming ingest endpoint.
    ///
    /// The upstream answers 2xx with an empty body on success, so the body is not read.
    pub async fn submit_event(&self, event: &Value) -> Result<(), ForwardError> {
        let body = serde_json::to_vec(event).map_err(|e| ForwardError::Transport(e.to_string()))?;

        let request = self
            .client
            .post(self.event_url())
            .header(CONTENT_TYPE, "application/json")
            .header(TENANT_HEADER, &self.tenant)
            .body(body);

        let response = authorize(request, self.credentials.stream_api_key.as_deref())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await?;
        Err(ForwardError::Upstream { status, body })
    }

    /// Fetches a profile or its segments and returns the upstream JSON untouched.
    pub async fn fetch_profile(
        &self,
        amp_id: &str,
        resource: ProfileResource,
    ) -> Result<Value, ForwardError> {
        let url = self.profile_url(amp_id, resource);
        tracing::debug!(%url, "fetching from profile api");

        let request = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .header(TENANT_HEADER, &self.tenant);

        let response = authorize(request, self.credentials.profile_api_key.as_deref())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(ForwardError::Upstream { status, body });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ForwardError::Transport(format!("Invalid JSON from upstream: {e}")))
    }
}

fn authorize(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}
