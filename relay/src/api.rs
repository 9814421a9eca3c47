use crate::errors::ForwardError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT, UPSTREAM_ERRORS};
use crate::upstream::{AmperityClient, ProfileResource};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State, rejection::BytesRejection},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub const MISSING_EVENT: &str = "Missing event data or amperity_id";
pub const MISSING_AMP_ID: &str = "Missing ampID query parameter";
pub const UNKNOWN_UPSTREAM_ERROR: &str = "Unknown upstream error";

const AMP_ID_PARAM: &str = "ampID";

type Client = Arc<AmperityClient>;

pub fn router(client: AmperityClient, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/event", post(submit_event).fallback(method_not_allowed))
        .route("/profile", get(get_profile).fallback(method_not_allowed))
        .route("/segments", get(get_segments).fallback(method_not_allowed))
        .fallback(not_found)
        .with_state(Arc::new(client))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Event,
    Lookup(ProfileResource),
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Event => "event",
            Endpoint::Lookup(ProfileResource::Profile) => "profile",
            Endpoint::Lookup(ProfileResource::Segments) => "segments",
        }
    }
}

#[derive(Serialize)]
struct EventAccepted {
    success: bool,
}

#[derive(Serialize)]
struct EventErrorResponse {
    success: bool,
    error: String,
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct UpstreamErrorResponse {
    error: &'static str,
    status: u16,
    details: String,
}

/// A failed forward, tagged with the endpoint it happened on.
///
/// `/event` and the lookup endpoints report failures with different bodies.
#[derive(Debug)]
pub struct ApiError {
    pub endpoint: Endpoint,
    pub error: ForwardError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match (self.endpoint, self.error) {
            (_, ForwardError::InvalidRequest(message)) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorResponse {
                    error: message.to_string(),
                }),
            )
                .into_response(),
            (_, ForwardError::Rejected { status, message }) => {
                (status, Json(ApiErrorResponse { error: message })).into_response()
            }
            (Endpoint::Event, ForwardError::Upstream { status, body }) => {
                let error = match body.is_empty() {
                    true => UNKNOWN_UPSTREAM_ERROR.to_string(),
                    false => body,
                };
                (
                    status,
                    Json(EventErrorResponse {
                        success: false,
                        error,
                    }),
                )
                    .into_response()
            }
            (Endpoint::Event, ForwardError::Transport(message)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(EventErrorResponse {
                    success: false,
                    error: message,
                }),
            )
                .into_response(),
            (Endpoint::Lookup(resource), ForwardError::Upstream { status, body }) => {
                let error = match resource {
                    ProfileResource::Profile => "Upstream Profile API error",
                    ProfileResource::Segments => "Upstream Segments API error",
                };
                (
                    status,
                    Json(UpstreamErrorResponse {
                        error,
                        status: status.as_u16(),
                        details: body,
                    }),
                )
                    .into_response()
            }
            (Endpoint::Lookup(_), ForwardError::Transport(message)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorResponse { error: message }),
            )
                .into_response(),
        }
    }
}

async fn not_found() -> Response {
    status_response(StatusCode::NOT_FOUND)
}

async fn method_not_allowed() -> Response {
    status_response(StatusCode::METHOD_NOT_ALLOWED)
}

fn status_response(status: StatusCode) -> Response {
    let error = status.canonical_reason().unwrap_or("Unknown error").to_string();
    (status, Json(ApiErrorResponse { error })).into_response()
}

async fn submit_event(
    State(client): State<Client>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<EventAccepted>, ApiError> {
    let _inflight = InFlight::start();
    let started = Instant::now();
    let result = match read_event(&headers, body) {
        Ok(event) => client.submit_event(&event).await,
        Err(e) => Err(e),
    };
    observe(Endpoint::Event, started, &result);

    result
        .map(|()| Json(EventAccepted { success: true }))
        .map_err(|error| ApiError {
            endpoint: Endpoint::Event,
            error,
        })
}

async fn get_profile(
    State(client): State<Client>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    lookup(&client, &params, ProfileResource::Profile).await
}

async fn get_segments(
    State(client): State<Client>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, ApiError> {
    lookup(&client, &params, ProfileResource::Segments).await
}

async fn lookup(
    client: &AmperityClient,
    params: &[(String, String)],
    resource: ProfileResource,
) -> Result<Json<Value>, ApiError> {
    let _inflight = InFlight::start();
    let started = Instant::now();
    let endpoint = Endpoint::Lookup(resource);
    let result = match amp_id(params) {
        Some(amp_id) => client.fetch_profile(&amp_id, resource).await,
        None => Err(ForwardError::InvalidRequest(MISSING_AMP_ID)),
    };
    observe(endpoint, started, &result);

    result
        .map(Json)
        .map_err(|error| ApiError { endpoint, error })
}

/// Only `application/json` bodies are read; anything else counts as no event at all.
fn read_event(
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Value, ForwardError> {
    if !is_json(headers) {
        return Err(ForwardError::InvalidRequest(MISSING_EVENT));
    }

    let body = body.map_err(|rejection| ForwardError::Rejected {
        status: rejection.status(),
        message: rejection.body_text(),
    })?;
    parse_event(&body)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

/// Accepts any JSON object whose `amperity_id` is truthy.
fn parse_event(body: &[u8]) -> Result<Value, ForwardError> {
    let event: Value =
        serde_json::from_slice(body).map_err(|_| ForwardError::InvalidRequest(MISSING_EVENT))?;

    match event.get("amperity_id").is_some_and(is_truthy) {
        true => Ok(event),
        false => Err(ForwardError::InvalidRequest(MISSING_EVENT)),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// The `ampID` query value. Repeated keys are joined with `,`; a lone empty value counts as missing.
fn amp_id(params: &[(String, String)]) -> Option<String> {
    let values: Vec<&str> = params
        .iter()
        .filter(|(key, _)| key == AMP_ID_PARAM)
        .map(|(_, value)| value.as_str())
        .collect();

    match values.as_slice() {
        [] | [""] => None,
        values => Some(values.join(",")),
    }
}

/// Tracks a request in the in-flight gauge until dropped, including when the caller hangs up.
struct InFlight;

impl InFlight {
    fn start() -> Self {
        shared::gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        shared::gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

fn observe<T>(endpoint: Endpoint, started: Instant, result: &Result<T, ForwardError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    shared::histogram!(REQUEST_DURATION, "endpoint" => endpoint.as_str(), "outcome" => outcome)
        .record(started.elapsed().as_secs_f64());

    match result {
        Err(ForwardError::Upstream { status, .. }) => {
            shared::counter!(UPSTREAM_ERRORS, "endpoint" => endpoint.as_str(), "kind" => "upstream")
                .increment(1);
            tracing::warn!(
                endpoint = endpoint.as_str(),
                status = status.as_u16(),
                "upstream returned an error"
            );
        }
        Err(ForwardError::Transport(message)) => {
            shared::counter!(UPSTREAM_ERRORS, "endpoint" => endpoint.as_str(), "kind" => "transport")
                .increment(1);
            tracing::error!(endpoint = endpoint.as_str(), error = %message, "upstream call failed");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, UpstreamConfig};
    use crate::testutils::StubUpstream;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::json;
    use tower::ServiceExt;

    const LIMIT: usize = 100 * 1024;

    fn app_for(config: &UpstreamConfig) -> Router {
        let credentials = Credentials {
            stream_api_key: Some("stream-key".into()),
            profile_api_key: Some("profile-key".into()),
        };
        router(AmperityClient::new(config, credentials).unwrap(), LIMIT)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_event(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/event")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_event_success() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;
        let (status, body) = send(
            app_for(&stub.config()),
            post_event(r#"{"amperity_id":"abc123","foo":"bar"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].body.as_ref(),
            br#"{"amperity_id":"abc123","foo":"bar"}"#
        );
    }

    #[tokio::test]
    async fn test_event_success_ignores_upstream_body() {
        let stub = StubUpstream::spawn(StatusCode::ACCEPTED, r#"{"queued":3}"#).await;
        let (status, body) = send(
            app_for(&stub.config()),
            post_event(r#"{"amperity_id":"abc123"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));
    }

    #[tokio::test]
    async fn test_event_missing_amperity_id() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;

        for payload in [
            r#"{"foo":"bar"}"#,
            r#"{"amperity_id":""}"#,
            r#"{"amperity_id":null}"#,
            r#"{"amperity_id":0}"#,
            r#"{"amperity_id":false}"#,
            r#"[{"amperity_id":"abc"}]"#,
            "null",
            "not json",
            "",
        ] {
            let (status, body) = send(app_for(&stub.config()), post_event(payload)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "payload: {payload}");
            assert_eq!(body, json!({"error": MISSING_EVENT}), "payload: {payload}");
        }

        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_event_upstream_error() {
        let stub = StubUpstream::spawn(StatusCode::FORBIDDEN, "tenant mismatch").await;
        let (status, body) = send(
            app_for(&stub.config()),
            post_event(r#"{"amperity_id":"abc123"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({"success": false, "error": "tenant mismatch"}));
    }

    #[tokio::test]
    async fn test_event_upstream_error_without_body() {
        let stub = StubUpstream::spawn(StatusCode::BAD_GATEWAY, "").await;
        let (status, body) = send(
            app_for(&stub.config()),
            post_event(r#"{"amperity_id":"abc123"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            body,
            json!({"success": false, "error": UNKNOWN_UPSTREAM_ERROR})
        );
    }

    #[tokio::test]
    async fn test_event_transport_error() {
        let config = UpstreamConfig {
            base_url: StubUpstream::unused_url().await,
            ..UpstreamConfig::default()
        };
        let (status, body) = send(app_for(&config), post_event(r#"{"amperity_id":"abc"}"#)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn test_event_body_limit() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;
        let padding = "x".repeat(LIMIT);
        let payload = format!(r#"{{"amperity_id":"abc","padding":"{padding}"}}"#);

        let response = app_for(&stub.config())
            .oneshot(post_event(payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_event_requires_json_content_type() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;

        for content_type in [Some("text/plain"), Some("application/x-www-form-urlencoded"), None] {
            let mut request = Request::builder().method(Method::POST).uri("/event");
            if let Some(content_type) = content_type {
                request = request.header("content-type", content_type);
            }
            let request = request
                .body(Body::from(r#"{"amperity_id":"abc"}"#))
                .unwrap();

            let (status, body) = send(app_for(&stub.config()), request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "content type: {content_type:?}");
            assert_eq!(body, json!({"error": MISSING_EVENT}));
        }

        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_event_accepts_json_content_type_with_charset() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/event")
            .header("content-type", "Application/JSON; charset=utf-8")
            .body(Body::from(r#"{"amperity_id":"abc"}"#))
            .unwrap();

        let (status, body) = send(app_for(&stub.config()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));
        assert_eq!(stub.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_requests_answer_json() {
        let stub = StubUpstream::spawn(StatusCode::OK, "{}").await;

        let (status, body) = send(app_for(&stub.config()), get("/event")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, json!({"error": "Method Not Allowed"}));

        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/profile?ampID=abc")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app_for(&stub.config()), request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, json!({"error": "Method Not Allowed"}));

        let (status, body) = send(app_for(&stub.config()), get("/nowhere")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Not Found"}));

        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_profile_success() {
        let stub = StubUpstream::spawn(StatusCode::OK, r#"{"amperity_id":"abc123","email":"a@b.c"}"#).await;
        let (status, body) = send(app_for(&stub.config()), get("/profile?ampID=abc123")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"amperity_id": "abc123", "email": "a@b.c"}));
        assert_eq!(
            stub.requests()[0].path,
            "/prof/profiles/apc-i6JnGvMX/abc123"
        );
    }

    #[tokio::test]
    async fn test_profile_upstream_not_found() {
        let stub = StubUpstream::spawn(StatusCode::NOT_FOUND, "not found").await;
        let (status, body) = send(app_for(&stub.config()), get("/profile?ampID=abc123")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({"error": "Upstream Profile API error", "status": 404, "details": "not found"})
        );
    }

    #[tokio::test]
    async fn test_segments_upstream_error_status_is_relayed() {
        for code in [StatusCode::UNAUTHORIZED, StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            let stub = StubUpstream::spawn(code, "upstream says no").await;
            let (status, body) = send(app_for(&stub.config()), get("/segments?ampID=abc")).await;

            assert_eq!(status, code);
            assert_eq!(body["error"], json!("Upstream Segments API error"));
            assert_eq!(body["status"], json!(code.as_u16()));
            assert_eq!(body["details"], json!("upstream says no"));
        }
    }

    #[tokio::test]
    async fn test_segments_success_encodes_amp_id() {
        let stub = StubUpstream::spawn(StatusCode::OK, r#"[{"segment":"vip"}]"#).await;
        let (status, body) = send(
            app_for(&stub.config()),
            get("/segments?ampID=a%2Fb%3Fc%23d"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"segment": "vip"}]));
        assert_eq!(
            stub.requests()[0].path,
            "/prof/profiles/apc-i6JnGvMX/a%2Fb%3Fc%23d/segments"
        );
    }

    #[tokio::test]
    async fn test_repeated_amp_id_is_joined() {
        let stub = StubUpstream::spawn(StatusCode::OK, "{}").await;
        let (status, _) = send(app_for(&stub.config()), get("/profile?ampID=a&ampID=b")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(stub.requests()[0].path, "/prof/profiles/apc-i6JnGvMX/a%2Cb");
    }

    #[tokio::test]
    async fn test_missing_amp_id() {
        let stub = StubUpstream::spawn(StatusCode::OK, "{}").await;

        for uri in ["/segments", "/profile", "/profile?ampID=", "/segments?ampid=abc"] {
            let (status, body) = send(app_for(&stub.config()), get(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "uri: {uri}");
            assert_eq!(body, json!({"error": MISSING_AMP_ID}), "uri: {uri}");
        }

        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn test_profile_invalid_upstream_json() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;
        let (status, body) = send(app_for(&stub.config()), get("/profile?ampID=abc")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("Invalid JSON")));
        assert!(body.get("success").is_none());
    }

    #[tokio::test]
    async fn test_profile_transport_error() {
        let config = UpstreamConfig {
            base_url: StubUpstream::unused_url().await,
            ..UpstreamConfig::default()
        };
        let (status, body) = send(app_for(&config), get("/profile?ampID=abc")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let stub = StubUpstream::spawn(StatusCode::OK, "").await;
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/event")
            .header("origin", "https://shop.example.com")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = app_for(&stub.config()).oneshot(request).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!("abc")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(-0.5)));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_amp_id_values() {
        let param = |key: &str, value: &str| (key.to_string(), value.to_string());

        let params = vec![param("other", "x"), param("ampID", "first"), param("ampID", "second")];
        assert_eq!(amp_id(&params).as_deref(), Some("first,second"));
        assert_eq!(amp_id(&[param("ampID", "abc")]).as_deref(), Some("abc"));
        assert_eq!(amp_id(&[param("ampID", "a"), param("ampID", "")]).as_deref(), Some("a,"));
        assert_eq!(amp_id(&[param("ampID", "")]), None);
        assert_eq!(amp_id(&[]), None);
    }
}
