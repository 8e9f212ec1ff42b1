//! Page Abstraction
//!
//! Ties the stability detector, interceptor and socket monitor to one
//! protocol session and exposes the public wait/route surface.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cdp::{PageEvent, ProtocolClient, ProtocolClientExt};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::intercept::{InterceptedRequest, Interceptor, RequestRecord, ResponseRecord};
use crate::socket::wait::{SocketCondition, SocketSequence, SocketWaitOptions};
use crate::socket::{SocketConnection, SocketFrame, SocketMonitor, SocketStats, SOCKET_HOOK_SCRIPT};
use crate::stability::{StabilityConfig, StabilityDetector};

/// Escape a string for safe use in JavaScript string literals
fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('`', "\\`")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace("${", "\\${")
}

/// One observed browser page: stability waits, request routing and socket
/// monitoring over a caller-supplied protocol session
pub struct Page {
    client: Arc<dyn ProtocolClient>,
    stability: Arc<StabilityDetector>,
    interceptor: Arc<Interceptor>,
    sockets: Arc<SocketMonitor>,
    _dispatcher: Dispatcher,
}

impl Page {
    /// Attach to a protocol session: `client` issues commands, `events`
    /// delivers the session's protocol events in arrival order.
    ///
    /// Dispatch tasks are spawned immediately and aborted when the `Page`
    /// is dropped.
    pub fn attach(client: Arc<dyn ProtocolClient>, events: mpsc::Receiver<PageEvent>) -> Self {
        let stability = Arc::new(StabilityDetector::new(Arc::clone(&client)));
        let interceptor = Arc::new(Interceptor::new(Arc::clone(&client)));
        let sockets = Arc::new(SocketMonitor::new());

        let dispatcher = Dispatcher::spawn(
            events,
            Arc::clone(&stability),
            Arc::clone(&interceptor),
            Arc::clone(&sockets),
        );

        Self {
            client,
            stability,
            interceptor,
            sockets,
            _dispatcher: dispatcher,
        }
    }

    /// The underlying protocol client
    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    /// The stability detector
    pub fn stability(&self) -> &StabilityDetector {
        &self.stability
    }

    /// The network interceptor
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// The socket monitor
    pub fn sockets(&self) -> &SocketMonitor {
        &self.sockets
    }

    // =========================================================================
    // Stability
    // =========================================================================

    /// Wait for the page to settle with default thresholds
    pub async fn wait_for_stability(&self) -> Result<()> {
        self.stability
            .wait_for_stability(&StabilityConfig::default())
            .await
    }

    /// Wait for the page to settle with explicit configuration
    pub async fn wait_for_stability_with(&self, config: &StabilityConfig) -> Result<()> {
        self.stability.wait_for_stability(config).await
    }

    // =========================================================================
    // Network interception
    // =========================================================================

    /// Intercept requests whose URL matches `pattern` (a regex). The first
    /// matching route wins; unrouted requests continue unmodified.
    pub async fn route<F, Fut>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(InterceptedRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.interceptor.add_route(pattern, handler).await
    }

    /// Wait until a request matching `pattern` has been observed
    pub async fn wait_for_request(&self, pattern: &str, timeout: Duration) -> Result<RequestRecord> {
        self.interceptor.ensure_enabled().await?;
        self.interceptor.wait_for_request(pattern, timeout).await
    }

    /// Wait until a response matching `pattern` has been observed
    pub async fn wait_for_response(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<ResponseRecord> {
        self.interceptor.ensure_enabled().await?;
        self.interceptor.wait_for_response(pattern, timeout).await
    }

    // =========================================================================
    // Sockets
    // =========================================================================

    /// Snapshot of all live socket connections, keyed by connection ID
    pub async fn socket_connections(&self) -> HashMap<String, SocketConnection> {
        self.sockets.connections().await
    }

    /// Aggregate traffic counters over the live socket connections
    pub async fn socket_stats(&self) -> SocketStats {
        self.sockets.stats().await
    }

    /// Wait until a socket connection satisfies `condition`
    pub async fn wait_for_socket(
        &self,
        condition: SocketCondition,
        opts: &SocketWaitOptions,
    ) -> Result<SocketConnection> {
        self.sockets.wait_for(condition, opts).await
    }

    /// Wait for `count` socket messages matching the filters
    pub async fn wait_for_socket_messages(
        &self,
        count: usize,
        opts: &SocketWaitOptions,
    ) -> Result<Vec<SocketFrame>> {
        self.sockets.wait_for_messages(count, opts).await
    }

    /// Wait until matching socket traffic has been quiet for `idle`
    pub async fn wait_for_socket_idle(&self, idle: Duration, opts: &SocketWaitOptions) -> Result<()> {
        self.sockets.wait_for_idle(idle, opts).await
    }

    /// Start a sequential socket wait; each step is waited for in order
    pub fn socket_sequence(&self) -> SocketSequence<'_> {
        SocketSequence::new(&self.sockets)
    }

    /// Install the page-side socket hook so `send_socket_message` can
    /// reach page-created sockets. A no-op when already installed.
    pub async fn install_socket_hook(&self) -> Result<()> {
        self.execute(SOCKET_HOOK_SCRIPT).await
    }

    /// Send `text` on the first open page-side socket whose URL equals
    /// `url_pattern` (`*` matches any). Requires the socket hook; installs
    /// it for sockets opened later if missing.
    pub async fn send_socket_message(&self, url_pattern: &str, text: &str) -> Result<()> {
        self.install_socket_hook().await?;

        let script = format!(
            r#"
            (() => {{
                const sockets = window.__pagewatchSockets;
                if (!sockets) return false;
                const pattern = '{pattern}';
                for (const ws of sockets) {{
                    if ((pattern === '*' || ws.url === pattern) && ws.readyState === WebSocket.OPEN) {{
                        ws.send('{text}');
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            pattern = escape_js_string(url_pattern),
            text = escape_js_string(text),
        );

        let sent: bool = self.evaluate(&script).await?;
        if !sent {
            return Err(Error::ConnectionNotFound(url_pattern.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // JavaScript Evaluation
    // =========================================================================

    /// Evaluate JavaScript and return the result
    pub async fn evaluate<T: serde::de::DeserializeOwned>(&self, expression: &str) -> Result<T> {
        match self.client.evaluate_value(expression).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(Error::Evaluation("no value returned".into())),
        }
    }

    /// Execute JavaScript without expecting a return value
    pub async fn execute(&self, expression: &str) -> Result<()> {
        self.client.evaluate_value(expression).await?;
        Ok(())
    }

    /// Poll an expression until it returns `true` or `timeout` elapses
    pub async fn wait_for_function(&self, expression: &str, timeout: Duration) -> Result<()> {
        self.client.wait_for_function(expression, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_js_string() {
        assert_eq!(escape_js_string("plain"), "plain");
        assert_eq!(escape_js_string("a'b"), "a\\'b");
        assert_eq!(escape_js_string("line\nbreak"), "line\\nbreak");
        assert_eq!(escape_js_string("${x}"), "\\${x}");
    }
}
