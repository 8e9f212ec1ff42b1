//! Network request interception
//!
//! Routes pause matching requests before the browser acts on them and let
//! a handler continue, abort or fulfill each one. Resolution is
//! exactly-once per request: a second attempt on the same request is a
//! state error, not a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::cdp::client::POLL_INTERVAL;
use crate::cdp::types::{
    ErrorReason, FetchContinueRequest, FetchFulfillRequest, FetchRequestPausedEvent, HeaderEntry,
    NetworkRequest,
};
use crate::cdp::{PageEvent, ProtocolClient, ProtocolClientExt};
use crate::error::{Error, Result};

/// Handler invoked for the first route matching a paused request
pub type RouteHandler =
    Arc<dyn Fn(InterceptedRequest) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Route {
    pattern: Regex,
    handler: RouteHandler,
}

/// Stored state of one paused request, alive until resolved
struct PendingRequest {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body: Option<String>,
}

type PendingTable = Arc<RwLock<HashMap<String, PendingRequest>>>;

/// A request observed going out, kept for `wait_for_request`
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub post_data: Option<String>,
}

/// A response observed coming back, kept for `wait_for_response`
#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub request_id: String,
    pub url: String,
    pub status: i32,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub mime_type: Option<String>,
}

/// Overrides applied when continuing a paused request; unset fields keep
/// the stored request's values
#[derive(Debug, Clone, Default)]
pub struct ContinueOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Vec<u8>>,
}

/// Synthetic response answering a paused request
#[derive(Debug, Clone)]
pub struct FulfillResponse {
    pub status: i64,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Default for FulfillResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            content_type: None,
            body: Vec::new(),
        }
    }
}

/// One paused request, handed to route handlers
#[derive(Clone)]
pub struct InterceptedRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub post_data: Option<String>,

    client: Arc<dyn ProtocolClient>,
    pending: PendingTable,
}

impl InterceptedRequest {
    /// Take the pending entry for this request, enforcing exactly-once
    /// resolution
    async fn take_pending(&self) -> Result<PendingRequest> {
        self.pending
            .write()
            .await
            .remove(&self.id)
            .ok_or_else(|| Error::NotIntercepted(self.id.clone()))
    }

    /// Restore the pending entry after a failed command so the caller can
    /// still resolve the request
    async fn restore_pending(&self, entry: PendingRequest) {
        self.pending.write().await.insert(self.id.clone(), entry);
    }

    /// Re-issue the request, with any overrides applied over the stored
    /// request
    pub async fn continue_request(&self, overrides: ContinueOverrides) -> Result<()> {
        let entry = self.take_pending().await?;

        let body = overrides
            .body
            .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
            .or_else(|| {
                entry
                    .body
                    .as_ref()
                    .map(|b| base64::engine::general_purpose::STANDARD.encode(b.as_bytes()))
            });
        let headers = overrides.headers.as_ref().unwrap_or(&entry.headers);

        let params = FetchContinueRequest {
            request_id: self.id.clone(),
            url: overrides.url.clone(),
            method: Some(overrides.method.clone().unwrap_or_else(|| entry.method.clone())),
            post_data: body,
            headers: Some(header_entries(headers)),
        };

        if let Err(e) = self.client.continue_request(&params).await {
            self.restore_pending(entry).await;
            return Err(e);
        }
        tracing::debug!("Continued request {} ({})", self.id, self.url);
        Ok(())
    }

    /// Fail the request. `reason` is one of `failed`, `aborted`,
    /// `timedout`, `accessdenied`, `connectionrefused`, `connectionreset`,
    /// `internetdisconnected`, `blockedbyclient`; anything else aborts.
    pub async fn abort(&self, reason: &str) -> Result<()> {
        let entry = self.take_pending().await?;

        if let Err(e) = self.client.fail_request(&self.id, abort_reason(reason)).await {
            self.restore_pending(entry).await;
            return Err(e);
        }
        tracing::debug!("Aborted request {} ({}): {}", self.id, self.url, reason);
        Ok(())
    }

    /// Short-circuit the request with a synthetic response
    pub async fn fulfill(&self, response: FulfillResponse) -> Result<()> {
        let entry = self.take_pending().await?;

        let mut headers = response.headers;
        if let Some(content_type) = response.content_type {
            headers.insert("Content-Type".into(), content_type);
        }

        let params = FetchFulfillRequest {
            request_id: self.id.clone(),
            response_code: response.status,
            response_headers: Some(header_entries(&headers)),
            body: Some(base64::engine::general_purpose::STANDARD.encode(&response.body)),
        };

        if let Err(e) = self.client.fulfill_request(&params).await {
            self.restore_pending(entry).await;
            return Err(e);
        }
        tracing::debug!("Fulfilled request {} ({})", self.id, self.url);
        Ok(())
    }
}

/// Observes and rewrites network traffic for one page session
pub struct Interceptor {
    client: Arc<dyn ProtocolClient>,
    routes: RwLock<Vec<Route>>,
    pending: PendingTable,
    requests: RwLock<HashMap<String, RequestRecord>>,
    responses: RwLock<HashMap<String, ResponseRecord>>,
    enabled: Mutex<bool>,
}

impl Interceptor {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            client,
            routes: RwLock::new(Vec::new()),
            pending: Arc::new(RwLock::new(HashMap::new())),
            requests: RwLock::new(HashMap::new()),
            responses: RwLock::new(HashMap::new()),
            enabled: Mutex::new(false),
        }
    }

    /// Append a route. `pattern` is a regex matched against request URLs;
    /// routes are scanned in insertion order and the first match wins.
    /// Interception is enabled on the first route.
    pub async fn add_route<F, Fut>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(InterceptedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let pattern = Regex::new(pattern).map_err(|e| Error::pattern(pattern, e))?;
        let handler: RouteHandler = Arc::new(move |req| Box::pin(handler(req)));

        self.routes.write().await.push(Route { pattern, handler });
        self.ensure_enabled().await
    }

    /// Enable the network and fetch domains once
    pub(crate) async fn ensure_enabled(&self) -> Result<()> {
        let mut enabled = self.enabled.lock().await;
        if *enabled {
            return Ok(());
        }
        self.client.enable_network().await?;
        self.client.enable_fetch().await?;
        *enabled = true;
        Ok(())
    }

    /// Ingest one protocol event. Non-network events are ignored.
    pub(crate) async fn handle_event(&self, event: &PageEvent) {
        match event {
            PageEvent::RequestPaused(e) => self.on_request_paused(e).await,
            PageEvent::RequestWillBeSent(e) => {
                let record = RequestRecord {
                    id: e.request_id.clone(),
                    url: e.request.url.clone(),
                    method: e.request.method.clone(),
                    headers: e.request.headers.clone(),
                    post_data: e.request.post_data.clone(),
                };
                self.requests.write().await.insert(e.request_id.clone(), record);
            }
            PageEvent::ResponseReceived(e) => {
                let record = ResponseRecord {
                    request_id: e.request_id.clone(),
                    url: e.response.url.clone(),
                    status: e.response.status,
                    status_text: e.response.status_text.clone(),
                    headers: e.response.headers.clone(),
                    mime_type: e.response.mime_type.clone(),
                };
                self.responses
                    .write()
                    .await
                    .insert(e.request_id.clone(), record);
            }
            _ => {}
        }
    }

    async fn on_request_paused(&self, event: &FetchRequestPausedEvent) {
        let request = InterceptedRequest {
            id: event.request_id.clone(),
            url: event.request.url.clone(),
            method: event.request.method.clone(),
            headers: event.request.headers.clone(),
            post_data: assemble_post_data(&event.request),
            client: Arc::clone(&self.client),
            pending: Arc::clone(&self.pending),
        };

        self.pending.write().await.insert(
            event.request_id.clone(),
            PendingRequest {
                url: request.url.clone(),
                method: request.method.clone(),
                headers: request.headers.clone(),
                body: request.post_data.clone(),
            },
        );

        let handler = {
            let routes = self.routes.read().await;
            routes
                .iter()
                .find(|route| route.pattern.is_match(&request.url))
                .map(|route| Arc::clone(&route.handler))
        };

        let Some(handler) = handler else {
            // No route matched: continue unmodified
            if let Err(e) = request.continue_request(ContinueOverrides::default()).await {
                tracing::warn!("Failed to continue unrouted request {}: {}", request.id, e);
            }
            return;
        };

        if let Err(e) = handler(request.clone()).await {
            tracing::warn!("Route handler failed for {} ({}): {}", request.id, request.url, e);
            // A handler that errored without resolving leaves a dangling
            // request; fail it so the page sees the breakage
            if self.pending.read().await.contains_key(&request.id) {
                if let Err(e) = request.abort("failed").await {
                    tracing::warn!("Failed to abort request {}: {}", request.id, e);
                }
            }
        }
    }

    /// Snapshot of every request observed so far
    pub async fn requests(&self) -> Vec<RequestRecord> {
        self.requests.read().await.values().cloned().collect()
    }

    /// Snapshot of every response observed so far
    pub async fn responses(&self) -> Vec<ResponseRecord> {
        self.responses.read().await.values().cloned().collect()
    }

    /// Number of requests currently paused and unresolved
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Poll the request table until a URL matches `pattern`
    pub async fn wait_for_request(&self, pattern: &str, timeout: Duration) -> Result<RequestRecord> {
        let pattern = Regex::new(pattern).map_err(|e| Error::pattern(pattern, e))?;
        let start = tokio::time::Instant::now();

        loop {
            {
                let requests = self.requests.read().await;
                if let Some(record) = requests.values().find(|r| pattern.is_match(&r.url)) {
                    return Ok(record.clone());
                }
            }
            if start.elapsed() >= timeout {
                return Err(Error::timeout(format!(
                    "no request matching {} within {:?}",
                    pattern, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll the response table until a URL matches `pattern`
    pub async fn wait_for_response(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<ResponseRecord> {
        let pattern = Regex::new(pattern).map_err(|e| Error::pattern(pattern, e))?;
        let start = tokio::time::Instant::now();

        loop {
            {
                let responses = self.responses.read().await;
                if let Some(record) = responses.values().find(|r| pattern.is_match(&r.url)) {
                    return Ok(record.clone());
                }
            }
            if start.elapsed() >= timeout {
                return Err(Error::timeout(format!(
                    "no response matching {} within {:?}",
                    pattern, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn header_entries(headers: &HashMap<String, String>) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| HeaderEntry {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Reassemble a possibly-chunked POST body. Entries are base64 on the
/// wire; chunks that fail to decode are taken verbatim.
fn assemble_post_data(request: &NetworkRequest) -> Option<String> {
    if let Some(entries) = &request.post_data_entries {
        if !entries.is_empty() {
            let mut body = Vec::new();
            for entry in entries {
                let Some(bytes) = &entry.bytes else { continue };
                match base64::engine::general_purpose::STANDARD.decode(bytes) {
                    Ok(decoded) => body.extend_from_slice(&decoded),
                    Err(_) => body.extend_from_slice(bytes.as_bytes()),
                }
            }
            if !body.is_empty() {
                return Some(String::from_utf8_lossy(&body).into_owned());
            }
        }
    }
    request.post_data.clone()
}

fn abort_reason(reason: &str) -> ErrorReason {
    match reason {
        "failed" => ErrorReason::Failed,
        "timedout" => ErrorReason::TimedOut,
        "accessdenied" => ErrorReason::AccessDenied,
        "connectionrefused" => ErrorReason::ConnectionRefused,
        "connectionreset" => ErrorReason::ConnectionReset,
        "internetdisconnected" => ErrorReason::InternetDisconnected,
        "blockedbyclient" => ErrorReason::BlockedByClient,
        _ => ErrorReason::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockClient {
        calls: std::sync::Mutex<Vec<(String, Value)>>,
    }

    impl MockClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn methods(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }

        fn params_of(&self, method: &str) -> Option<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(m, _)| m == method)
                .map(|(_, p)| p.clone())
        }
    }

    #[async_trait]
    impl ProtocolClient for MockClient {
        async fn execute(&self, method: &str, params: Value) -> Result<Value> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            Ok(json!({}))
        }
    }

    fn paused(id: &str, url: &str) -> FetchRequestPausedEvent {
        serde_json::from_value(json!({
            "requestId": id,
            "request": {"url": url, "method": "GET", "headers": {}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_route_pattern_is_error() {
        let interceptor = Interceptor::new(MockClient::new());
        let err = interceptor
            .add_route("[unclosed", |_req| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pattern { .. }));
    }

    #[tokio::test]
    async fn test_first_route_registration_enables_interception() {
        let client = MockClient::new();
        let interceptor = Interceptor::new(client.clone());
        interceptor.add_route(".*", |_req| async { Ok(()) }).await.unwrap();
        interceptor.add_route(".*", |_req| async { Ok(()) }).await.unwrap();

        let methods = client.methods();
        assert_eq!(
            methods.iter().filter(|m| *m == "Fetch.enable").count(),
            1,
            "fetch should be enabled exactly once"
        );
        assert!(methods.contains(&"Network.enable".to_string()));
    }

    #[tokio::test]
    async fn test_first_matching_route_wins() {
        let client = MockClient::new();
        let interceptor = Interceptor::new(client.clone());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let hits = Arc::clone(&first);
        interceptor
            .add_route(r".*\.png", move |req| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    req.continue_request(ContinueOverrides::default()).await
                }
            })
            .await
            .unwrap();

        let hits = Arc::clone(&second);
        interceptor
            .add_route(".*", move |req| {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    req.continue_request(ContinueOverrides::default()).await
                }
            })
            .await
            .unwrap();

        interceptor
            .handle_event(&PageEvent::RequestPaused(paused("1", "https://a.example/logo.png")))
            .await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrouted_request_continues_unmodified() {
        let client = MockClient::new();
        let interceptor = Interceptor::new(client.clone());
        interceptor
            .add_route(r".*\.png", |req| async move { req.abort("failed").await })
            .await
            .unwrap();

        interceptor
            .handle_event(&PageEvent::RequestPaused(paused("1", "https://a.example/api")))
            .await;

        let params = client.params_of("Fetch.continueRequest").unwrap();
        assert_eq!(params["requestId"], "1");
        assert_eq!(interceptor.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_exactly_once_resolution() {
        let client = MockClient::new();
        let interceptor = Interceptor::new(client.clone());

        let captured: Arc<std::sync::Mutex<Option<InterceptedRequest>>> =
            Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&captured);
        interceptor
            .add_route(".*", move |req| {
                let slot = Arc::clone(&slot);
                async move {
                    *slot.lock().unwrap() = Some(req.clone());
                    req.continue_request(ContinueOverrides::default()).await
                }
            })
            .await
            .unwrap();

        interceptor
            .handle_event(&PageEvent::RequestPaused(paused("7", "https://a.example/x")))
            .await;

        let request = captured.lock().unwrap().take().unwrap();
        let err = request.abort("failed").await.unwrap_err();
        assert!(matches!(err, Error::NotIntercepted(ref id) if id.as_str() == "7"));

        let err = request.fulfill(FulfillResponse::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotIntercepted(_)));
    }

    #[tokio::test]
    async fn test_handler_error_aborts_request() {
        let client = MockClient::new();
        let interceptor = Interceptor::new(client.clone());
        interceptor
            .add_route(".*", |_req| async { Err(Error::Evaluation("handler bug".into())) })
            .await
            .unwrap();

        interceptor
            .handle_event(&PageEvent::RequestPaused(paused("3", "https://a.example/x")))
            .await;

        let params = client.params_of("Fetch.failRequest").unwrap();
        assert_eq!(params["requestId"], "3");
        assert_eq!(params["errorReason"], "Failed");
        assert_eq!(interceptor.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_abort_reason_mapping() {
        assert_eq!(abort_reason("failed"), ErrorReason::Failed);
        assert_eq!(abort_reason("timedout"), ErrorReason::TimedOut);
        assert_eq!(abort_reason("accessdenied"), ErrorReason::AccessDenied);
        assert_eq!(abort_reason("blockedbyclient"), ErrorReason::BlockedByClient);
        assert_eq!(abort_reason("anything-else"), ErrorReason::Aborted);
    }

    #[tokio::test]
    async fn test_chunked_post_data_reassembly() {
        let request: NetworkRequest = serde_json::from_value(json!({
            "url": "https://a.example/submit",
            "method": "POST",
            "headers": {},
            "hasPostData": true,
            "postDataEntries": [
                {"bytes": base64::engine::general_purpose::STANDARD.encode("hello ")},
                {"bytes": base64::engine::general_purpose::STANDARD.encode("world")}
            ]
        }))
        .unwrap();

        assert_eq!(assemble_post_data(&request).as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn test_fulfill_encodes_body_and_content_type() {
        let client = MockClient::new();
        let interceptor = Interceptor::new(client.clone());
        interceptor
            .add_route(".*", |req| async move {
                req.fulfill(FulfillResponse {
                    status: 203,
                    content_type: Some("text/plain".into()),
                    body: b"stubbed".to_vec(),
                    ..Default::default()
                })
                .await
            })
            .await
            .unwrap();

        interceptor
            .handle_event(&PageEvent::RequestPaused(paused("9", "https://a.example/x")))
            .await;

        let params = client.params_of("Fetch.fulfillRequest").unwrap();
        assert_eq!(params["responseCode"], 203);
        assert_eq!(
            params["body"],
            base64::engine::general_purpose::STANDARD.encode("stubbed")
        );
        let headers = params["responseHeaders"].as_array().unwrap();
        assert!(headers
            .iter()
            .any(|h| h["name"] == "Content-Type" && h["value"] == "text/plain"));
    }
}
