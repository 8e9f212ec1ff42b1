//! Page stability detection
//!
//! Combines five independently-timed checks (network idle, DOM quiet,
//! resource loading, script execution, caller-supplied checks) into one
//! answer to "has the page settled?". Checks run concurrently against a
//! shared deadline; the whole set retries on timeout-class failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{join_all, BoxFuture};
use tokio::sync::{Mutex, RwLock};

use crate::cdp::client::POLL_INTERVAL;
use crate::cdp::{PageEvent, ProtocolClient, ProtocolClientExt};
use crate::error::{Error, Result};

/// Marker the injected observer logs for every mutation batch
const MUTATION_MARKER: &str = "__pagewatch_mutation__";

/// Installs a MutationObserver reporting each batch of DOM changes via a
/// console marker. Repeated injection is a no-op.
const MUTATION_OBSERVER_SCRIPT: &str = r#"
(() => {
    if (window.__pagewatchMutationObserver) return;
    window.__pagewatchMutationCount = 0;
    window.__pagewatchMutationObserver = new MutationObserver((mutations) => {
        window.__pagewatchMutationCount += mutations.length;
        console.log('__pagewatch_mutation__');
    });
    window.__pagewatchMutationObserver.observe(document.documentElement, {
        childList: true,
        subtree: true,
        attributes: true,
        characterData: true
    });
})();
"#;

const ANIMATION_FRAME_SCRIPT: &str =
    "new Promise(resolve => requestAnimationFrame(() => resolve(true)))";

const IDLE_CALLBACK_SCRIPT: &str = r#"
new Promise(resolve => {
    if ('requestIdleCallback' in window) {
        requestIdleCallback(() => resolve(true), { timeout: 1000 });
    } else {
        setTimeout(() => resolve(true), 0);
    }
})
"#;

/// A caller-supplied stability check: an expression polled until it
/// returns `true`
#[derive(Debug, Clone)]
pub struct StabilityCheck {
    pub name: String,
    pub expression: String,
    pub timeout: Duration,
}

/// Configuration for stability detection
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Number of concurrent requests considered idle
    pub network_idle_threshold: usize,
    /// How long the network must stay at the idle threshold
    pub network_idle_timeout: Duration,
    /// Window within which network idle must be reached
    pub network_idle_watch_window: Duration,

    /// Number of DOM mutations considered stable
    pub dom_stable_threshold: u64,
    /// How long the DOM must stay quiet
    pub dom_stable_timeout: Duration,
    /// Window within which DOM quiet must be reached
    pub dom_watch_window: Duration,

    pub wait_for_images: bool,
    pub wait_for_fonts: bool,
    pub wait_for_stylesheets: bool,
    pub wait_for_scripts: bool,
    /// Per-resource-class loading deadline
    pub resource_timeout: Duration,

    pub wait_for_animation_frame: bool,
    pub wait_for_idle_callback: bool,
    pub js_execution_timeout: Duration,

    /// Outer deadline across all attempts; takes precedence over retries
    pub max_stability_wait: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,

    pub custom_checks: Vec<StabilityCheck>,

    /// Log each check's start/pass/fail
    pub verbose: bool,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            network_idle_threshold: 0,
            network_idle_timeout: Duration::from_millis(500),
            network_idle_watch_window: Duration::from_secs(5),

            dom_stable_threshold: 0,
            dom_stable_timeout: Duration::from_millis(500),
            dom_watch_window: Duration::from_secs(3),

            wait_for_images: true,
            wait_for_fonts: true,
            wait_for_stylesheets: true,
            wait_for_scripts: true,
            resource_timeout: Duration::from_secs(10),

            wait_for_animation_frame: true,
            wait_for_idle_callback: true,
            js_execution_timeout: Duration::from_secs(5),

            max_stability_wait: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),

            custom_checks: Vec::new(),

            verbose: false,
        }
    }
}

/// Counters the checks poll, fed by the event stream
#[derive(Debug, Clone, Default)]
pub struct StabilityMetrics {
    /// Total requests seen since the detector started
    pub network_requests: u64,
    /// In-flight requests keyed by request ID, with start times
    pub pending_requests: HashMap<String, Instant>,
    /// Mutation batches reported by the injected observer
    pub dom_mutations: u64,
    pub last_dom_mutation: Option<Instant>,
    /// Results of named custom checks
    pub checks_passed: HashMap<String, bool>,
}

/// Watches page-loading signals and answers stability waits
pub struct StabilityDetector {
    client: Arc<dyn ProtocolClient>,
    metrics: Arc<RwLock<StabilityMetrics>>,
    started: Mutex<bool>,
}

impl StabilityDetector {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            client,
            metrics: Arc::new(RwLock::new(StabilityMetrics::default())),
            started: Mutex::new(false),
        }
    }

    /// Ingest one protocol event. Irrelevant events are ignored.
    pub(crate) async fn handle_event(&self, event: &PageEvent) {
        match event {
            PageEvent::RequestWillBeSent(e) => {
                let mut metrics = self.metrics.write().await;
                metrics.pending_requests.insert(e.request_id.clone(), Instant::now());
                metrics.network_requests += 1;
            }
            PageEvent::ResponseReceived(e) => {
                self.metrics.write().await.pending_requests.remove(&e.request_id);
            }
            PageEvent::LoadingFinished(e) => {
                self.metrics.write().await.pending_requests.remove(&e.request_id);
            }
            PageEvent::LoadingFailed(e) => {
                self.metrics.write().await.pending_requests.remove(&e.request_id);
            }
            PageEvent::ConsoleSignal { texts } => {
                if texts.iter().any(|t| t == MUTATION_MARKER) {
                    let mut metrics = self.metrics.write().await;
                    metrics.dom_mutations += 1;
                    metrics.last_dom_mutation = Some(Instant::now());
                }
            }
            _ => {}
        }
    }

    /// Snapshot of the current metrics
    pub async fn metrics(&self) -> StabilityMetrics {
        self.metrics.read().await.clone()
    }

    /// Enable the protocol domains the detector needs and install the
    /// mutation observer. Runs once per detector.
    async fn ensure_started(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }
        self.client.enable_network().await?;
        for domain in ["Page", "DOM", "Runtime"] {
            self.client.enable_domain(domain).await?;
        }
        self.inject_mutation_observer().await?;
        *started = true;
        Ok(())
    }

    /// Install the page-side mutation observer; a no-op when already
    /// installed
    async fn inject_mutation_observer(&self) -> Result<()> {
        self.client.evaluate_value(MUTATION_OBSERVER_SCRIPT).await?;
        Ok(())
    }

    /// Wait for the page to reach a stable state.
    ///
    /// Runs all five checks concurrently; retries the whole set up to
    /// `retry_attempts` times on timeout-class failures, bounded overall
    /// by `max_stability_wait`.
    pub async fn wait_for_stability(&self, config: &StabilityConfig) -> Result<()> {
        self.ensure_started().await?;

        let deadline = tokio::time::Instant::now() + config.max_stability_wait;
        let mut last_failure = None;

        for attempt in 0..=config.retry_attempts {
            if attempt > 0 {
                if config.verbose {
                    tracing::debug!(
                        "Stability check attempt {}/{}",
                        attempt,
                        config.retry_attempts
                    );
                }
                tokio::time::sleep(config.retry_delay).await;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }

            match tokio::time::timeout(deadline - now, self.run_attempt(config)).await {
                Ok(Ok(())) => {
                    if config.verbose {
                        tracing::debug!("Page reached stable state");
                    }
                    return Ok(());
                }
                Ok(Err(e)) if e.is_timeout() => last_failure = Some(e),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::timeout(format!(
                        "page did not stabilize within {:?}",
                        config.max_stability_wait
                    )))
                }
            }
        }

        Err(last_failure.unwrap_or_else(|| {
            Error::timeout(format!(
                "page did not stabilize within {:?}",
                config.max_stability_wait
            ))
        }))
    }

    /// Run all five checks once, aggregating every failure
    async fn run_attempt(&self, config: &StabilityConfig) -> Result<()> {
        {
            // Attempt-scoped counters; the pending-request set mirrors
            // real in-flight traffic and is left alone
            let mut metrics = self.metrics.write().await;
            metrics.dom_mutations = 0;
            metrics.last_dom_mutation = None;
            metrics.checks_passed.clear();
        }

        let checks: Vec<(&'static str, BoxFuture<'_, Result<()>>)> = vec![
            ("network idle", Box::pin(self.check_network_idle(config))),
            ("DOM stability", Box::pin(self.check_dom_stability(config))),
            ("resource loading", Box::pin(self.check_resources(config))),
            ("script execution", Box::pin(self.check_scripts(config))),
            ("custom checks", Box::pin(self.check_custom(config))),
        ];

        let verbose = config.verbose;
        let results = join_all(checks.into_iter().map(|(name, check)| async move {
            if verbose {
                tracing::debug!("Starting stability check: {}", name);
            }
            let result = check.await;
            match &result {
                Ok(()) if verbose => tracing::debug!("Stability check passed: {}", name),
                Err(e) if verbose => tracing::debug!("Stability check failed: {} - {}", name, e),
                _ => {}
            }
            (name, result)
        }))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| {
                result.err().map(|e| format!("{} check failed: {}", name, e))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Stability { failures })
        }
    }

    /// Wait until the pending-request count stays at or below the
    /// threshold for the configured quiet period
    async fn check_network_idle(&self, config: &StabilityConfig) -> Result<()> {
        let deadline = tokio::time::Instant::now() + config.network_idle_watch_window;
        let mut idle_since: Option<Instant> = None;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout("network idle timed out"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let pending = self.metrics.read().await.pending_requests.len();
            if pending <= config.network_idle_threshold {
                match idle_since {
                    None => {
                        idle_since = Some(Instant::now());
                        if config.verbose {
                            tracing::debug!(
                                "Network idle, waiting {:?} for confirmation",
                                config.network_idle_timeout
                            );
                        }
                    }
                    Some(since) if since.elapsed() >= config.network_idle_timeout => {
                        return Ok(());
                    }
                    Some(_) => {}
                }
            } else {
                idle_since = None;
                if config.verbose {
                    tracing::debug!("Network active: {} pending requests", pending);
                }
            }
        }
    }

    /// Wait until DOM mutations stay at or below the threshold, or the
    /// last mutation is old enough, for the configured quiet period
    async fn check_dom_stability(&self, config: &StabilityConfig) -> Result<()> {
        // Navigation may have cleared the observer; re-assert it
        self.inject_mutation_observer().await?;

        let deadline = tokio::time::Instant::now() + config.dom_watch_window;
        let mut stable_since: Option<Instant> = None;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout("DOM stability timed out"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let (mutations, last) = {
                let metrics = self.metrics.read().await;
                (metrics.dom_mutations, metrics.last_dom_mutation)
            };
            let quiet_for = last.map(|t| t.elapsed()).unwrap_or(Duration::MAX);

            if mutations <= config.dom_stable_threshold || quiet_for >= config.dom_stable_timeout {
                match stable_since {
                    None => stable_since = Some(Instant::now()),
                    Some(since) if since.elapsed() >= config.dom_stable_timeout => {
                        return Ok(());
                    }
                    Some(_) => {}
                }
            } else {
                stable_since = None;
                self.metrics.write().await.dom_mutations = 0;
                if config.verbose {
                    tracing::debug!("DOM active: {} mutations, last {:?} ago", mutations, quiet_for);
                }
            }
        }
    }

    /// Wait for each enabled resource class to finish loading
    async fn check_resources(&self, config: &StabilityConfig) -> Result<()> {
        let classes: [(bool, &str, &str); 4] = [
            (
                config.wait_for_images,
                "images",
                "Array.from(document.images).every(img => img.complete && img.naturalHeight !== 0)",
            ),
            (
                config.wait_for_stylesheets,
                "stylesheets",
                r#"Array.from(document.styleSheets).every(sheet => {
                    try { return sheet.cssRules !== null; } catch (e) { return true; }
                })"#,
            ),
            (
                config.wait_for_fonts,
                "fonts",
                "document.fonts ? document.fonts.ready.then(() => true) : true",
            ),
            (
                config.wait_for_scripts,
                "scripts",
                "Array.from(document.scripts).every(s => !s.src || s.readyState === 'complete' || !s.readyState)",
            ),
        ];

        let waits = classes
            .into_iter()
            .filter(|(enabled, _, _)| *enabled)
            .map(|(_, name, script)| async move {
                self.client
                    .wait_for_function(script, config.resource_timeout)
                    .await
                    .map_err(|_| Error::timeout(format!("{} loading timed out", name)))
            });

        for result in join_all(waits).await {
            result?;
        }
        Ok(())
    }

    /// Wait for an animation frame and, optionally, an idle callback —
    /// a proxy for the main thread not being starved
    async fn check_scripts(&self, config: &StabilityConfig) -> Result<()> {
        if config.wait_for_animation_frame {
            let _ = tokio::time::timeout(
                config.js_execution_timeout,
                self.client.evaluate_value(ANIMATION_FRAME_SCRIPT),
            )
            .await
            .map_err(|_| Error::timeout("animation frame timed out"))??;
        }

        if config.wait_for_idle_callback {
            let _ = tokio::time::timeout(
                config.js_execution_timeout,
                self.client.evaluate_value(IDLE_CALLBACK_SCRIPT),
            )
            .await
            .map_err(|_| Error::timeout("idle callback timed out"))??;
        }

        Ok(())
    }

    /// Poll each caller-supplied expression to completion
    async fn check_custom(&self, config: &StabilityConfig) -> Result<()> {
        let metrics = &self.metrics;
        let waits = config.custom_checks.iter().map(|check| async move {
            self.client
                .wait_for_function(&check.expression, check.timeout)
                .await
                .map_err(|_| Error::timeout(format!("custom check '{}' timed out", check.name)))?;
            metrics
                .write()
                .await
                .checks_passed
                .insert(check.name.clone(), true);
            Ok::<(), Error>(())
        });

        for result in join_all(waits).await {
            result?;
        }
        Ok(())
    }
}
