//! Event fan-out
//!
//! One ingestion task receives typed events from the caller's protocol
//! connection and forwards each to the components that consume it over
//! bounded per-component channels. Component handlers run on their own
//! tasks, so a slow consumer buffers instead of stalling ingestion, and
//! per-request/per-connection ordering is preserved within each component.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cdp::PageEvent;
use crate::intercept::Interceptor;
use crate::socket::SocketMonitor;
use crate::stability::StabilityDetector;

const CHANNEL_CAPACITY: usize = 256;

/// Owns the ingestion and consumer tasks for one page session
pub(crate) struct Dispatcher {
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        mut events: mpsc::Receiver<PageEvent>,
        stability: Arc<StabilityDetector>,
        interceptor: Arc<Interceptor>,
        sockets: Arc<SocketMonitor>,
    ) -> Self {
        let (stability_tx, mut stability_rx) = mpsc::channel::<PageEvent>(CHANNEL_CAPACITY);
        let (intercept_tx, mut intercept_rx) = mpsc::channel::<PageEvent>(CHANNEL_CAPACITY);
        let (socket_tx, mut socket_rx) = mpsc::channel::<PageEvent>(CHANNEL_CAPACITY);

        let ingest = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    // Both stability and the interceptor observe request
                    // lifecycle traffic
                    PageEvent::RequestWillBeSent(_) | PageEvent::ResponseReceived(_) => {
                        let _ = stability_tx.send(event.clone()).await;
                        let _ = intercept_tx.send(event).await;
                    }
                    PageEvent::LoadingFinished(_)
                    | PageEvent::LoadingFailed(_)
                    | PageEvent::ConsoleSignal { .. } => {
                        let _ = stability_tx.send(event).await;
                    }
                    PageEvent::RequestPaused(_) => {
                        let _ = intercept_tx.send(event).await;
                    }
                    PageEvent::SocketCreated(_)
                    | PageEvent::SocketFrameSent(_)
                    | PageEvent::SocketFrameReceived(_)
                    | PageEvent::SocketClosed(_)
                    | PageEvent::SocketFrameError(_) => {
                        let _ = socket_tx.send(event).await;
                    }
                }
            }
            tracing::debug!("Event source closed, dispatch ending");
        });

        let stability_task = tokio::spawn(async move {
            while let Some(event) = stability_rx.recv().await {
                stability.handle_event(&event).await;
            }
        });

        let intercept_task = tokio::spawn(async move {
            while let Some(event) = intercept_rx.recv().await {
                interceptor.handle_event(&event).await;
            }
        });

        let socket_task = tokio::spawn(async move {
            while let Some(event) = socket_rx.recv().await {
                sockets.handle_event(&event).await;
            }
        });

        Self {
            tasks: vec![ingest, stability_task, intercept_task, socket_task],
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
