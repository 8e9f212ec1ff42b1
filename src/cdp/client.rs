//! Protocol command boundary
//!
//! The crate does not own a connection to the browser. Callers hand in
//! anything that can issue a CDP command and return its JSON result;
//! [`ProtocolClientExt`] layers the typed commands the components need on
//! top of that single method.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::types::*;
use crate::error::{Error, Result};

/// How often polling waits re-evaluate their predicate
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A handle capable of issuing protocol commands for one page session.
///
/// Implementations are expected to resolve protocol-level errors into
/// [`Error::Protocol`] and deliver the `result` object on success.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Issue a command and wait for its result
    async fn execute(&self, method: &str, params: Value) -> Result<Value>;
}

/// Typed commands over a [`ProtocolClient`]
#[async_trait]
pub trait ProtocolClientExt: ProtocolClient {
    /// Issue a typed command
    async fn command<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let result = self.execute(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Enable a protocol domain (`Page`, `DOM`, `Runtime`, ...)
    async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.execute(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    /// Enable network events with POST data capture
    async fn enable_network(&self) -> Result<()> {
        self.command::<_, Value>(
            "Network.enable",
            &NetworkEnable {
                max_post_data_size: Some(65536),
            },
        )
        .await?;
        Ok(())
    }

    /// Enable request interception for all URLs
    async fn enable_fetch(&self) -> Result<()> {
        self.command::<_, Value>(
            "Fetch.enable",
            &FetchEnable {
                patterns: Some(vec![RequestPattern {
                    url_pattern: "*".into(),
                }]),
            },
        )
        .await?;
        Ok(())
    }

    /// Re-issue a paused request, with optional overrides
    async fn continue_request(&self, params: &FetchContinueRequest) -> Result<()> {
        self.command::<_, Value>("Fetch.continueRequest", params)
            .await?;
        Ok(())
    }

    /// Fail a paused request with a protocol error reason
    async fn fail_request(&self, request_id: &str, reason: ErrorReason) -> Result<()> {
        self.command::<_, Value>(
            "Fetch.failRequest",
            &FetchFailRequest {
                request_id: request_id.into(),
                error_reason: reason,
            },
        )
        .await?;
        Ok(())
    }

    /// Answer a paused request with a synthetic response
    async fn fulfill_request(&self, params: &FetchFulfillRequest) -> Result<()> {
        self.command::<_, Value>("Fetch.fulfillRequest", params)
            .await?;
        Ok(())
    }

    /// Evaluate a script expression, awaiting promises, and return its value.
    ///
    /// A page-side exception becomes [`Error::Evaluation`].
    async fn evaluate_value(&self, expression: &str) -> Result<Option<Value>> {
        let result: RuntimeEvaluateResult = self
            .command(
                "Runtime.evaluate",
                &RuntimeEvaluate {
                    expression: expression.into(),
                    return_by_value: Some(true),
                    await_promise: Some(true),
                },
            )
            .await?;

        if let Some(exception) = result.exception_details {
            return Err(Error::Evaluation(format!(
                "{} at {}:{}",
                exception.text, exception.line_number, exception.column_number
            )));
        }

        Ok(result.result.value)
    }

    /// Evaluate an expression expected to produce a boolean
    async fn evaluate_bool(&self, expression: &str) -> Result<bool> {
        let value = self.evaluate_value(expression).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Poll an expression until it evaluates to `true` or the timeout elapses.
    ///
    /// Evaluation errors are swallowed while polling (the page may be
    /// mid-navigation); only the deadline fails the wait.
    async fn wait_for_function(&self, expression: &str, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            if let Ok(true) = self.evaluate_bool(expression).await {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Error::timeout("waiting for function"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl<T: ProtocolClient + ?Sized> ProtocolClientExt for T {}
