//! Typed protocol events
//!
//! Every event the components consume is a distinct variant, so dispatch
//! is an exhaustive match instead of a string-keyed payload grab. Event
//! sources that hold raw protocol JSON convert with [`PageEvent::from_cdp`].

use serde_json::Value;

use super::types::*;

/// One protocol event relevant to stability, interception or sockets
#[derive(Debug, Clone)]
pub enum PageEvent {
    RequestWillBeSent(NetworkRequestWillBeSentEvent),
    ResponseReceived(NetworkResponseReceivedEvent),
    LoadingFinished(NetworkLoadingFinishedEvent),
    LoadingFailed(NetworkLoadingFailedEvent),
    RequestPaused(FetchRequestPausedEvent),
    /// String arguments of a page-side `console.log` call, used to smuggle
    /// injected-script markers out of the page
    ConsoleSignal { texts: Vec<String> },
    SocketCreated(NetworkWebSocketCreatedEvent),
    SocketFrameSent(NetworkWebSocketFrameEvent),
    SocketFrameReceived(NetworkWebSocketFrameEvent),
    SocketClosed(NetworkWebSocketClosedEvent),
    SocketFrameError(NetworkWebSocketFrameErrorEvent),
}

impl PageEvent {
    /// Parse a raw `(method, params)` protocol event.
    ///
    /// Returns `None` for methods this crate does not consume and for
    /// payloads that fail to parse.
    pub fn from_cdp(method: &str, params: Value) -> Option<PageEvent> {
        match method {
            "Network.requestWillBeSent" => {
                Some(PageEvent::RequestWillBeSent(from_value(params)?))
            }
            "Network.responseReceived" => Some(PageEvent::ResponseReceived(from_value(params)?)),
            "Network.loadingFinished" => Some(PageEvent::LoadingFinished(from_value(params)?)),
            "Network.loadingFailed" => Some(PageEvent::LoadingFailed(from_value(params)?)),
            "Fetch.requestPaused" => Some(PageEvent::RequestPaused(from_value(params)?)),
            "Runtime.consoleAPICalled" => {
                let event: RuntimeConsoleApiCalledEvent = from_value(params)?;
                if event.r#type != "log" {
                    return None;
                }
                let texts: Vec<String> = event
                    .args
                    .into_iter()
                    .filter_map(|arg| arg.value.and_then(|v| v.as_str().map(String::from)))
                    .collect();
                if texts.is_empty() {
                    return None;
                }
                Some(PageEvent::ConsoleSignal { texts })
            }
            "Network.webSocketCreated" => Some(PageEvent::SocketCreated(from_value(params)?)),
            "Network.webSocketFrameSent" => Some(PageEvent::SocketFrameSent(from_value(params)?)),
            "Network.webSocketFrameReceived" => {
                Some(PageEvent::SocketFrameReceived(from_value(params)?))
            }
            "Network.webSocketClosed" => Some(PageEvent::SocketClosed(from_value(params)?)),
            "Network.webSocketFrameError" => {
                Some(PageEvent::SocketFrameError(from_value(params)?))
            }
            _ => None,
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(params: Value) -> Option<T> {
    match serde_json::from_value(params) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("Failed to parse protocol event payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_paused() {
        let event = PageEvent::from_cdp(
            "Fetch.requestPaused",
            json!({
                "requestId": "interception-1",
                "request": {
                    "url": "https://example.com/app.js",
                    "method": "GET",
                    "headers": {"Accept": "*/*"}
                },
                "networkId": "1000.2"
            }),
        )
        .expect("paused event should parse");

        match event {
            PageEvent::RequestPaused(paused) => {
                assert_eq!(paused.request_id, "interception-1");
                assert_eq!(paused.request.url, "https://example.com/app.js");
                assert_eq!(paused.network_id.as_deref(), Some("1000.2"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_console_signal_keeps_string_args_only() {
        let event = PageEvent::from_cdp(
            "Runtime.consoleAPICalled",
            json!({
                "type": "log",
                "args": [
                    {"type": "string", "value": "__pagewatch_mutation__"},
                    {"type": "number", "value": 3}
                ]
            }),
        )
        .expect("console event should parse");

        match event {
            PageEvent::ConsoleSignal { texts } => {
                assert_eq!(texts, vec!["__pagewatch_mutation__".to_string()]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_non_log_console_calls_ignored() {
        assert!(PageEvent::from_cdp(
            "Runtime.consoleAPICalled",
            json!({"type": "error", "args": [{"type": "string", "value": "boom"}]}),
        )
        .is_none());
    }

    #[test]
    fn test_unknown_method_ignored() {
        assert!(PageEvent::from_cdp("Page.frameNavigated", json!({})).is_none());
    }
}
