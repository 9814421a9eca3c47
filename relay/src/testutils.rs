use crate::config::UpstreamConfig;
use axum::Router;
use axum::body::Bytes;
use axum::extract::Request;
use http::{HeaderMap, Method, StatusCode};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request as the stub upstream received it.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    /// Raw path, still percent-encoded
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// In-process upstream that records every request and answers with a fixed status and body.
pub struct StubUpstream {
    url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl StubUpstream {
    pub async fn spawn(status: StatusCode, body: &'static str) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        let app = Router::new().fallback(move |req: Request| {
            let recorded = recorded.clone();
            async move {
                let (parts, body_stream) = req.into_parts();
                let bytes = axum::body::to_bytes(body_stream, usize::MAX)
                    .await
                    .unwrap_or_default();

                recorded.lock().unwrap().push(RecordedRequest {
                    method: parts.method,
                    path: parts.uri.path().to_string(),
                    query: parts.uri.query().map(String::from),
                    headers: parts.headers,
                    body: bytes,
                });

                (status, body)
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub upstream");
        let addr = listener.local_addr().expect("stub upstream address");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve stub upstream");
        });

        StubUpstream {
            url: format!("http://{addr}"),
            requests,
            handle,
        }
    }

    /// A base url nothing is listening on.
    pub async fn unused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind unused listener");
        let addr = listener.local_addr().expect("unused address");
        drop(listener);
        format!("http://{addr}")
    }

    pub fn config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.url.clone(),
            ..UpstreamConfig::default()
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
