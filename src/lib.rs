//! # Pagewatch
//!
//! Page stability detection, request interception and WebSocket
//! monitoring for browser sessions driven over the Chrome DevTools
//! Protocol.
//!
//! Pagewatch does not own the browser or its connection. It attaches to a
//! protocol session through two seams: a [`ProtocolClient`] that issues
//! commands, and a channel of typed [`PageEvent`]s fed by the caller's
//! connection. On top of those it answers three questions:
//!
//! - **Has the page settled?** Five concurrent checks (network idle, DOM
//!   quiet, resource loading, script execution, custom expressions) with
//!   retries behind one deadline.
//! - **What happens to this request?** Ordered regex routes over paused
//!   requests, each resolved exactly once by continue, abort or fulfill.
//! - **What is this socket doing?** Per-connection frame history and
//!   counters, with condition-based waits over the traffic.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagewatch::Page;
//! # use pagewatch::{ProtocolClient, Result};
//! # struct Client;
//! # #[async_trait::async_trait]
//! # impl ProtocolClient for Client {
//! #     async fn execute(&self, _m: &str, _p: serde_json::Value) -> Result<serde_json::Value> {
//! #         Ok(serde_json::json!({}))
//! #     }
//! # }
//! # async fn example() -> Result<()> {
//! let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
//! // events_tx is fed by your protocol connection
//! let page = Page::attach(Arc::new(Client), events_rx);
//!
//! // Block image loads
//! page.route(r".*\.png", |req| async move { req.abort("failed").await })
//!     .await?;
//!
//! // Wait for the page to settle
//! page.wait_for_stability().await?;
//! # let _ = events_tx;
//! # Ok(())
//! # }
//! ```
//!
//! ## Socket waits
//!
//! ```rust,no_run
//! use pagewatch::{SocketCondition, SocketWaitOptions};
//! # async fn example(page: pagewatch::Page) -> pagewatch::Result<()> {
//! let opts = SocketWaitOptions {
//!     url_pattern: r"wss://.*\.example\.com/feed".into(),
//!     message_pattern: r#"\{"type":"ready".*"#.into(),
//!     ..Default::default()
//! };
//! let conn = page.wait_for_socket(SocketCondition::FirstMessage, &opts).await?;
//! println!("ready on {}", conn.url);
//! # Ok(())
//! # }
//! ```

pub mod cdp;
mod dispatch;
pub mod error;
pub mod intercept;
pub mod page;
pub mod socket;
pub mod stability;

// Re-exports
pub use cdp::{PageEvent, ProtocolClient, ProtocolClientExt};
pub use error::{Error, Result};
pub use intercept::{
    ContinueOverrides, FulfillResponse, InterceptedRequest, Interceptor, RequestRecord,
    ResponseRecord,
};
pub use page::Page;
pub use socket::wait::{SocketCondition, SocketSequence, SocketWaitOptions};
pub use socket::{
    FrameDirection, FrameType, SocketConnection, SocketFrame, SocketMonitor, SocketState,
    SocketStats,
};
pub use stability::{StabilityCheck, StabilityConfig, StabilityDetector, StabilityMetrics};
