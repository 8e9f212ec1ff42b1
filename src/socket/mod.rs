//! WebSocket connection and frame monitoring
//!
//! Keeps a live view of every socket the page opens: per-connection state,
//! ordered frame history and traffic counters, fed by protocol events.
//! Condition-based waits over this view live in [`wait`].

pub mod wait;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use base64::Engine;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::cdp::types::{
    NetworkWebSocketClosedEvent, NetworkWebSocketCreatedEvent, NetworkWebSocketFrameErrorEvent,
    NetworkWebSocketFrameEvent,
};
use crate::cdp::PageEvent;

/// Lifecycle state of a socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketState::Connecting => "connecting",
            SocketState::Open => "open",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Frame type decoded from the protocol opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Unknown,
}

impl FrameType {
    /// Decode a wire opcode (`0x1` text, `0x2` binary, `0x8` close,
    /// `0x9` ping, `0xA` pong)
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode {
            0x1 => FrameType::Text,
            0x2 => FrameType::Binary,
            0x8 => FrameType::Close,
            0x9 => FrameType::Ping,
            0xA => FrameType::Pong,
            _ => FrameType::Unknown,
        }
    }
}

/// Direction of a frame relative to the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDirection {
    Sent,
    Received,
}

/// One message unit on a socket connection. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct SocketFrame {
    pub r#type: FrameType,
    pub direction: FrameDirection,
    /// Payload as delivered by the protocol: plain text for text frames,
    /// base64 for binary and control frames
    pub payload: String,
    pub size: u64,
    pub timestamp: SystemTime,
    pub opcode: u8,
}

/// One logical socket connection and its traffic history
#[derive(Debug, Clone, Serialize)]
pub struct SocketConnection {
    pub id: String,
    pub url: String,
    pub state: SocketState,
    pub protocol: Option<String>,
    pub extensions: Vec<String>,
    pub connected_at: SystemTime,
    pub disconnected_at: Option<SystemTime>,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
    /// Frames in receipt order; authoritative for first/last queries
    pub frames: Vec<SocketFrame>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl SocketConnection {
    fn new(id: String, url: String) -> Self {
        Self {
            id,
            url,
            state: SocketState::Connecting,
            protocol: None,
            extensions: Vec::new(),
            connected_at: SystemTime::now(),
            disconnected_at: None,
            close_code: None,
            close_reason: None,
            frames: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
        }
    }
}

/// Aggregate traffic counters over the live connections
#[derive(Debug, Clone, Default, Serialize)]
pub struct SocketStats {
    pub active_connections: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
}

type ConnectionHandle = Arc<RwLock<SocketConnection>>;

struct MonitorState {
    /// Connections that have not yet closed, keyed by connection ID
    live: HashMap<String, ConnectionHandle>,
    /// Closed connections, kept so closed-state and last-message waits
    /// stay evaluable after removal from the live index
    closed: Vec<ConnectionHandle>,
}

/// Tracks socket connections and frame traffic for one page session
pub struct SocketMonitor {
    state: RwLock<MonitorState>,
    /// Wakes waiters after every state mutation; waits also poll as a
    /// fallback for predicates that depend on wall-clock time
    activity: Notify,
}

impl SocketMonitor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MonitorState {
                live: HashMap::new(),
                closed: Vec::new(),
            }),
            activity: Notify::new(),
        }
    }

    /// Ingest one protocol event. Non-socket events are ignored.
    pub(crate) async fn handle_event(&self, event: &PageEvent) {
        match event {
            PageEvent::SocketCreated(e) => self.on_created(e).await,
            PageEvent::SocketFrameSent(e) => self.on_frame(e, FrameDirection::Sent).await,
            PageEvent::SocketFrameReceived(e) => self.on_frame(e, FrameDirection::Received).await,
            PageEvent::SocketClosed(e) => self.on_closed(e).await,
            PageEvent::SocketFrameError(e) => self.on_frame_error(e).await,
            _ => return,
        }
        self.activity.notify_waiters();
    }

    async fn on_created(&self, event: &NetworkWebSocketCreatedEvent) {
        let connection = SocketConnection::new(event.request_id.clone(), event.url.clone());
        tracing::debug!("Socket created: {} -> {}", connection.id, connection.url);

        let mut state = self.state.write().await;
        state.live.insert(
            event.request_id.clone(),
            Arc::new(RwLock::new(connection)),
        );
    }

    async fn on_frame(&self, event: &NetworkWebSocketFrameEvent, direction: FrameDirection) {
        let handle = {
            let state = self.state.read().await;
            match state.live.get(&event.request_id) {
                Some(handle) => Arc::clone(handle),
                None => return,
            }
        };

        let opcode = event.response.opcode as u8;
        let frame_type = FrameType::from_opcode(opcode);
        let frame = SocketFrame {
            r#type: frame_type,
            direction,
            payload: event.response.payload_data.clone(),
            size: event.response.payload_data.len() as u64,
            timestamp: SystemTime::now(),
            opcode,
        };

        let mut conn = handle.write().await;

        // First frame traffic implies the handshake completed
        if conn.state == SocketState::Connecting {
            conn.state = SocketState::Open;
        }

        if frame_type == FrameType::Close {
            if let Some((code, reason)) = decode_close_payload(&frame.payload) {
                conn.close_code = Some(code);
                if !reason.is_empty() {
                    conn.close_reason = Some(reason);
                }
            }
            if conn.state == SocketState::Open {
                conn.state = SocketState::Closing;
            }
        }

        match direction {
            FrameDirection::Sent => {
                conn.bytes_sent += frame.size;
                conn.messages_sent += 1;
            }
            FrameDirection::Received => {
                conn.bytes_received += frame.size;
                conn.messages_received += 1;
            }
        }
        conn.frames.push(frame);
    }

    async fn on_closed(&self, event: &NetworkWebSocketClosedEvent) {
        let handle = {
            let mut state = self.state.write().await;
            match state.live.remove(&event.request_id) {
                Some(handle) => {
                    state.closed.push(Arc::clone(&handle));
                    handle
                }
                None => return,
            }
        };

        let mut conn = handle.write().await;
        conn.state = SocketState::Closed;
        conn.disconnected_at = Some(SystemTime::now());
        // The protocol close event wins over what the close frame carried
        if event.code.is_some() {
            conn.close_code = event.code;
        }
        if event.reason.is_some() {
            conn.close_reason = event.reason.clone();
        }
        tracing::debug!("Socket closed: {} ({:?})", conn.id, conn.close_code);
    }

    async fn on_frame_error(&self, event: &NetworkWebSocketFrameErrorEvent) {
        tracing::warn!(
            "Socket frame error on {}: {}",
            event.request_id,
            event.error_message
        );
    }

    /// Snapshot of all live connections, keyed by connection ID
    pub async fn connections(&self) -> HashMap<String, SocketConnection> {
        let state = self.state.read().await;
        let mut result = HashMap::with_capacity(state.live.len());
        for (id, handle) in &state.live {
            result.insert(id.clone(), handle.read().await.clone());
        }
        result
    }

    /// Snapshot of one connection by ID, live or closed
    pub async fn connection(&self, id: &str) -> Option<SocketConnection> {
        let state = self.state.read().await;
        if let Some(handle) = state.live.get(id) {
            return Some(handle.read().await.clone());
        }
        for handle in state.closed.iter().rev() {
            let conn = handle.read().await;
            if conn.id == id {
                return Some(conn.clone());
            }
        }
        None
    }

    /// Aggregate counters over the live connections
    pub async fn stats(&self) -> SocketStats {
        let state = self.state.read().await;
        let mut stats = SocketStats {
            active_connections: state.live.len(),
            ..Default::default()
        };
        for handle in state.live.values() {
            let conn = handle.read().await;
            stats.total_bytes_sent += conn.bytes_sent;
            stats.total_bytes_received += conn.bytes_received;
            stats.total_messages_sent += conn.messages_sent;
            stats.total_messages_received += conn.messages_received;
        }
        stats
    }

    /// Handles to every tracked connection, live first, then closed
    pub(crate) async fn all_handles(&self) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        let mut handles: Vec<ConnectionHandle> = state.live.values().cloned().collect();
        handles.extend(state.closed.iter().cloned());
        handles
    }

    pub(crate) fn activity(&self) -> &Notify {
        &self.activity
    }
}

impl Default for SocketMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode an RFC 6455 close payload (base64 on the wire): 2-byte status
/// code followed by a UTF-8 reason
fn decode_close_payload(payload: &str) -> Option<(u16, String)> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()?;
    if bytes.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([bytes[0], bytes[1]]);
    let reason = String::from_utf8_lossy(&bytes[2..]).into_owned();
    Some((code, reason))
}

/// Page-side hook wrapping the WebSocket constructor so the page can be
/// asked to send on a tracked socket. Injection is a no-op when the hook
/// is already installed.
pub(crate) const SOCKET_HOOK_SCRIPT: &str = r#"
(() => {
    if (window.__pagewatchSocketHook) return;
    window.__pagewatchSocketHook = true;

    const sockets = new Set();
    const Original = window.WebSocket;

    window.WebSocket = function(url, protocols) {
        const ws = protocols === undefined ? new Original(url) : new Original(url, protocols);
        sockets.add(ws);
        ws.addEventListener('close', () => { sockets.delete(ws); });
        return ws;
    };

    Object.setPrototypeOf(window.WebSocket, Original);
    window.WebSocket.prototype = Original.prototype;
    window.WebSocket.CONNECTING = Original.CONNECTING;
    window.WebSocket.OPEN = Original.OPEN;
    window.WebSocket.CLOSING = Original.CLOSING;
    window.WebSocket.CLOSED = Original.CLOSED;

    window.__pagewatchSockets = sockets;
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::types::WebSocketFrameData;

    fn created(id: &str, url: &str) -> PageEvent {
        PageEvent::SocketCreated(NetworkWebSocketCreatedEvent {
            request_id: id.into(),
            url: url.into(),
        })
    }

    fn frame(id: &str, opcode: u8, payload: &str, received: bool) -> PageEvent {
        let event = NetworkWebSocketFrameEvent {
            request_id: id.into(),
            timestamp: 0.0,
            response: WebSocketFrameData {
                opcode: opcode as f64,
                mask: false,
                payload_data: payload.into(),
            },
        };
        if received {
            PageEvent::SocketFrameReceived(event)
        } else {
            PageEvent::SocketFrameSent(event)
        }
    }

    fn closed(id: &str) -> PageEvent {
        PageEvent::SocketClosed(NetworkWebSocketClosedEvent {
            request_id: id.into(),
            timestamp: 0.0,
            code: None,
            reason: None,
        })
    }

    #[test]
    fn test_frame_type_from_opcode() {
        assert_eq!(FrameType::from_opcode(0x1), FrameType::Text);
        assert_eq!(FrameType::from_opcode(0x2), FrameType::Binary);
        assert_eq!(FrameType::from_opcode(0x8), FrameType::Close);
        assert_eq!(FrameType::from_opcode(0x9), FrameType::Ping);
        assert_eq!(FrameType::from_opcode(0xA), FrameType::Pong);
        assert_eq!(FrameType::from_opcode(0x7), FrameType::Unknown);
    }

    #[tokio::test]
    async fn test_first_frame_promotes_to_open() {
        let monitor = SocketMonitor::new();
        monitor.handle_event(&created("ws-1", "wss://example.com/feed")).await;

        let conn = monitor.connection("ws-1").await.unwrap();
        assert_eq!(conn.state, SocketState::Connecting);

        monitor.handle_event(&frame("ws-1", 0x1, "hello", true)).await;
        let conn = monitor.connection("ws-1").await.unwrap();
        assert_eq!(conn.state, SocketState::Open);
        assert_eq!(conn.messages_received, 1);
        assert_eq!(conn.bytes_received, 5);
    }

    #[tokio::test]
    async fn test_frame_ordering_and_counters() {
        let monitor = SocketMonitor::new();
        monitor.handle_event(&created("ws-1", "wss://example.com/feed")).await;

        for i in 0..6 {
            monitor
                .handle_event(&frame("ws-1", 0x1, &format!("m{}", i), i % 2 == 0))
                .await;
        }

        let conn = monitor.connection("ws-1").await.unwrap();
        assert_eq!(conn.frames.len(), 6);
        assert_eq!(conn.messages_received, 3);
        assert_eq!(conn.messages_sent, 3);
        for pair in conn.frames.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_close_removes_from_live_but_not_history() {
        let monitor = SocketMonitor::new();
        monitor.handle_event(&created("ws-1", "wss://example.com/feed")).await;
        monitor.handle_event(&frame("ws-1", 0x1, "hi", true)).await;
        monitor.handle_event(&closed("ws-1")).await;

        assert!(monitor.connections().await.is_empty());

        let conn = monitor.connection("ws-1").await.unwrap();
        assert_eq!(conn.state, SocketState::Closed);
        assert!(conn.disconnected_at.is_some());
        assert_eq!(conn.frames.len(), 1);
    }

    #[tokio::test]
    async fn test_close_frame_payload_decoded() {
        let monitor = SocketMonitor::new();
        monitor.handle_event(&created("ws-1", "wss://example.com/feed")).await;

        // 1000 "bye" per RFC 6455: 0x03 0xE8 + reason bytes
        let mut payload = vec![0x03, 0xE8];
        payload.extend_from_slice(b"bye");
        let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);

        monitor.handle_event(&frame("ws-1", 0x8, &encoded, true)).await;
        monitor.handle_event(&closed("ws-1")).await;

        let conn = monitor.connection("ws-1").await.unwrap();
        assert_eq!(conn.close_code, Some(1000));
        assert_eq!(conn.close_reason.as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn test_stats_aggregate_live_connections() {
        let monitor = SocketMonitor::new();
        monitor.handle_event(&created("ws-1", "wss://a.example/ws")).await;
        monitor.handle_event(&created("ws-2", "wss://b.example/ws")).await;
        monitor.handle_event(&frame("ws-1", 0x1, "abcd", false)).await;
        monitor.handle_event(&frame("ws-2", 0x1, "ef", true)).await;

        let stats = monitor.stats().await;
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_bytes_sent, 4);
        assert_eq!(stats.total_bytes_received, 2);
        assert_eq!(stats.total_messages_sent, 1);
        assert_eq!(stats.total_messages_received, 1);
    }

    #[tokio::test]
    async fn test_frames_on_unknown_connection_ignored() {
        let monitor = SocketMonitor::new();
        monitor.handle_event(&frame("ghost", 0x1, "hello", true)).await;
        assert!(monitor.connections().await.is_empty());
        assert!(monitor.connection("ghost").await.is_none());
    }
}
