//! Condition-based waits over socket state
//!
//! Waits poll snapshots of the monitor's state and are additionally woken
//! by its activity notifier, so most conditions resolve on the event that
//! satisfies them rather than on the next poll tick.

use std::fmt;
use std::time::{Duration, SystemTime};

use regex::Regex;

use super::{FrameDirection, FrameType, SocketConnection, SocketFrame, SocketMonitor, SocketState};
use crate::error::{Error, Result};

/// What a socket wait is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCondition {
    /// A connection reached the given lifecycle state
    State(SocketState),
    /// A frame of the given type matching the filters occurred at least
    /// `message_count` times
    Frame(FrameType),
    /// The first received frame matching the filters
    FirstMessage,
    /// The last received frame on a connection that has closed
    LastMessage,
    /// Any frame matching the filters occurred at least `message_count` times
    AnyMessage,
}

impl fmt::Display for SocketCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketCondition::State(state) => write!(f, "state:{}", state),
            SocketCondition::Frame(FrameType::Text) => f.write_str("frame:text"),
            SocketCondition::Frame(FrameType::Binary) => f.write_str("frame:binary"),
            SocketCondition::Frame(FrameType::Close) => f.write_str("frame:close"),
            SocketCondition::Frame(FrameType::Ping) => f.write_str("frame:ping"),
            SocketCondition::Frame(FrameType::Pong) => f.write_str("frame:pong"),
            SocketCondition::Frame(FrameType::Unknown) => f.write_str("frame:unknown"),
            SocketCondition::FirstMessage => f.write_str("first-message"),
            SocketCondition::LastMessage => f.write_str("last-message"),
            SocketCondition::AnyMessage => f.write_str("any-message"),
        }
    }
}

/// Filters and deadlines for socket waits
#[derive(Debug, Clone)]
pub struct SocketWaitOptions {
    /// `*` or empty matches any URL; otherwise exact match, then regex
    pub url_pattern: String,
    /// Empty matches any payload; otherwise exact match, then regex
    /// (an invalid regex matches nothing)
    pub message_pattern: String,
    /// Restrict matching to one direction; `None` matches both
    pub direction: Option<FrameDirection>,
    /// Minimum number of matching frames for count-based conditions
    pub message_count: usize,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub case_sensitive: bool,
}

impl Default for SocketWaitOptions {
    fn default() -> Self {
        Self {
            url_pattern: "*".into(),
            message_pattern: String::new(),
            direction: None,
            message_count: 1,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            case_sensitive: true,
        }
    }
}

/// Precompiled URL matcher: wildcard, exact, or regex
#[derive(Debug)]
pub(crate) enum UrlMatcher {
    Any,
    Pattern { literal: String, regex: Regex },
}

impl UrlMatcher {
    /// Compile a URL pattern. An invalid regex is surfaced here, before
    /// the wait starts.
    pub(crate) fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() || pattern == "*" {
            return Ok(UrlMatcher::Any);
        }
        let regex = Regex::new(pattern).map_err(|e| Error::pattern(pattern, e))?;
        Ok(UrlMatcher::Pattern {
            literal: pattern.to_string(),
            regex,
        })
    }

    pub(crate) fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Any => true,
            UrlMatcher::Pattern { literal, regex } => url == literal || regex.is_match(url),
        }
    }
}

/// Exact match first, then regex; an invalid pattern matches nothing
fn matches_pattern(text: &str, pattern: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        if text == pattern {
            return true;
        }
        return Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false);
    }

    if text.to_lowercase() == pattern.to_lowercase() {
        return true;
    }
    Regex::new(&format!("(?i){}", pattern))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn frame_matches(frame: &SocketFrame, opts: &SocketWaitOptions) -> bool {
    if let Some(direction) = opts.direction {
        if frame.direction != direction {
            return false;
        }
    }
    if opts.message_pattern.is_empty() {
        return true;
    }
    matches_pattern(&frame.payload, &opts.message_pattern, opts.case_sensitive)
}

fn condition_met(
    conn: &SocketConnection,
    condition: SocketCondition,
    opts: &SocketWaitOptions,
) -> bool {
    match condition {
        SocketCondition::State(state) => conn.state == state,
        SocketCondition::Frame(frame_type) => {
            conn.frames
                .iter()
                .filter(|f| f.r#type == frame_type && frame_matches(f, opts))
                .count()
                >= opts.message_count
        }
        SocketCondition::AnyMessage => {
            conn.frames.iter().filter(|f| frame_matches(f, opts)).count() >= opts.message_count
        }
        SocketCondition::FirstMessage => conn
            .frames
            .iter()
            .any(|f| f.direction == FrameDirection::Received && frame_matches(f, opts)),
        SocketCondition::LastMessage => {
            conn.state == SocketState::Closed
                && conn
                    .frames
                    .iter()
                    .rev()
                    .any(|f| f.direction == FrameDirection::Received && frame_matches(f, opts))
        }
    }
}

impl SocketMonitor {
    /// Wait until some connection satisfies `condition`, returning a
    /// snapshot of it
    pub async fn wait_for(
        &self,
        condition: SocketCondition,
        opts: &SocketWaitOptions,
    ) -> Result<SocketConnection> {
        let url = UrlMatcher::new(&opts.url_pattern)?;
        let deadline = tokio::time::Instant::now() + opts.timeout;

        loop {
            for handle in self.all_handles().await {
                let conn = handle.read().await;
                if url.matches(&conn.url) && condition_met(&conn, condition, opts) {
                    return Ok(conn.clone());
                }
            }

            if !self.pause(deadline, opts.poll_interval).await {
                return Err(Error::timeout(format!(
                    "socket condition {} not met within {:?}",
                    condition, opts.timeout
                )));
            }
        }
    }

    /// Wait until `count` frames match the filters, returning the first
    /// `count` of them in receipt order
    pub async fn wait_for_messages(
        &self,
        count: usize,
        opts: &SocketWaitOptions,
    ) -> Result<Vec<SocketFrame>> {
        let url = UrlMatcher::new(&opts.url_pattern)?;
        let deadline = tokio::time::Instant::now() + opts.timeout;

        loop {
            let mut frames = Vec::new();
            for handle in self.all_handles().await {
                let conn = handle.read().await;
                if !url.matches(&conn.url) {
                    continue;
                }
                frames.extend(conn.frames.iter().filter(|f| frame_matches(f, opts)).cloned());
            }
            if frames.len() >= count {
                frames.truncate(count);
                return Ok(frames);
            }

            if !self.pause(deadline, opts.poll_interval).await {
                return Err(Error::timeout(format!(
                    "{} matching socket messages not seen within {:?}",
                    count, opts.timeout
                )));
            }
        }
    }

    /// Wait until no matching frame has arrived for `idle`.
    ///
    /// The idle clock restarts on every new matching frame; with no
    /// matching traffic at all it runs from the start of the wait.
    pub async fn wait_for_idle(&self, idle: Duration, opts: &SocketWaitOptions) -> Result<()> {
        let url = UrlMatcher::new(&opts.url_pattern)?;
        let deadline = tokio::time::Instant::now() + opts.timeout;
        let started = SystemTime::now();

        loop {
            let mut last_activity = started;
            for handle in self.all_handles().await {
                let conn = handle.read().await;
                if !url.matches(&conn.url) {
                    continue;
                }
                for frame in conn.frames.iter().rev() {
                    if frame_matches(frame, opts) {
                        if frame.timestamp > last_activity {
                            last_activity = frame.timestamp;
                        }
                        break;
                    }
                }
            }

            if let Ok(idle_for) = SystemTime::now().duration_since(last_activity) {
                if idle_for >= idle {
                    return Ok(());
                }
            }

            if !self.pause(deadline, opts.poll_interval).await {
                return Err(Error::timeout(format!(
                    "socket traffic did not go idle for {:?} within {:?}",
                    idle, opts.timeout
                )));
            }
        }
    }

    /// Sleep until the next poll tick, a state change, or the deadline.
    /// Returns `false` when the deadline has passed.
    async fn pause(&self, deadline: tokio::time::Instant, poll: Duration) -> bool {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        let sleep_for = poll.min(deadline - now);
        let notified = self.activity().notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
        true
    }
}

/// Waits for a series of socket conditions in order, surfacing which step
/// failed
pub struct SocketSequence<'a> {
    monitor: &'a SocketMonitor,
    steps: Vec<(SocketCondition, SocketWaitOptions)>,
}

impl<'a> SocketSequence<'a> {
    pub fn new(monitor: &'a SocketMonitor) -> Self {
        Self {
            monitor,
            steps: Vec::new(),
        }
    }

    /// Append a step to the sequence
    pub fn then(mut self, condition: SocketCondition, opts: SocketWaitOptions) -> Self {
        self.steps.push((condition, opts));
        self
    }

    /// Wait for every step in order, returning one connection snapshot per
    /// step
    pub async fn run(self) -> Result<Vec<SocketConnection>> {
        let mut results = Vec::with_capacity(self.steps.len());
        for (step, (condition, opts)) in self.steps.into_iter().enumerate() {
            match self.monitor.wait_for(condition, &opts).await {
                Ok(conn) => results.push(conn),
                Err(e) => {
                    return Err(Error::SequenceStep {
                        step,
                        condition: condition.to_string(),
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_frame(direction: FrameDirection, payload: &str) -> SocketFrame {
        SocketFrame {
            r#type: FrameType::Text,
            direction,
            payload: payload.into(),
            size: payload.len() as u64,
            timestamp: SystemTime::now(),
            opcode: 0x1,
        }
    }

    fn connection_with_frames(frames: Vec<SocketFrame>) -> SocketConnection {
        let mut conn = SocketConnection::new("ws-1".into(), "wss://example.com/feed".into());
        conn.state = SocketState::Open;
        conn.frames = frames;
        conn
    }

    #[test]
    fn test_url_matcher_wildcard_and_empty() {
        assert!(UrlMatcher::new("*").unwrap().matches("wss://anything"));
        assert!(UrlMatcher::new("").unwrap().matches("wss://anything"));
    }

    #[test]
    fn test_url_matcher_exact_then_regex() {
        let matcher = UrlMatcher::new("wss://example.com/feed").unwrap();
        assert!(matcher.matches("wss://example.com/feed"));
        assert!(!matcher.matches("wss://other.com/feed"));

        let matcher = UrlMatcher::new(r"wss://.*\.example\.com/.*").unwrap();
        assert!(matcher.matches("wss://api.example.com/socket"));
    }

    #[test]
    fn test_url_matcher_invalid_regex_is_error() {
        let err = UrlMatcher::new("[unclosed").unwrap_err();
        assert!(matches!(err, Error::Pattern { .. }));
    }

    #[test]
    fn test_message_pattern_exact_then_regex() {
        assert!(matches_pattern("ping", "ping", true));
        assert!(matches_pattern("event: 42", r"event: \d+", true));
        assert!(!matches_pattern("event: x", r"event: \d+", true));
        // invalid regex: no match rather than an error
        assert!(!matches_pattern("text", "[unclosed", true));
        // invalid regex that equals the text exactly still matches
        assert!(matches_pattern("[unclosed", "[unclosed", true));
    }

    #[test]
    fn test_message_pattern_case_insensitive() {
        assert!(matches_pattern("HELLO", "hello", false));
        assert!(!matches_pattern("HELLO", "hello", true));
        assert!(matches_pattern("Event: DONE", "event: done", false));
    }

    #[test]
    fn test_direction_filter() {
        let opts = SocketWaitOptions {
            direction: Some(FrameDirection::Received),
            ..Default::default()
        };
        assert!(frame_matches(&text_frame(FrameDirection::Received, "x"), &opts));
        assert!(!frame_matches(&text_frame(FrameDirection::Sent, "x"), &opts));
    }

    #[test]
    fn test_frame_condition_counts_matches() {
        let conn = connection_with_frames(vec![
            text_frame(FrameDirection::Received, "a"),
            text_frame(FrameDirection::Received, "b"),
        ]);
        let mut opts = SocketWaitOptions {
            message_count: 2,
            ..Default::default()
        };
        assert!(condition_met(&conn, SocketCondition::Frame(FrameType::Text), &opts));
        opts.message_count = 3;
        assert!(!condition_met(&conn, SocketCondition::Frame(FrameType::Text), &opts));
    }

    #[test]
    fn test_last_message_requires_closed_state() {
        let mut conn = connection_with_frames(vec![text_frame(FrameDirection::Received, "bye")]);
        let opts = SocketWaitOptions::default();
        assert!(!condition_met(&conn, SocketCondition::LastMessage, &opts));
        conn.state = SocketState::Closed;
        assert!(condition_met(&conn, SocketCondition::LastMessage, &opts));
    }

    #[tokio::test]
    async fn test_wait_for_times_out_with_condition_in_message() {
        let monitor = SocketMonitor::new();
        let opts = SocketWaitOptions {
            timeout: Duration::from_millis(150),
            ..Default::default()
        };
        let err = monitor
            .wait_for(SocketCondition::State(SocketState::Open), &opts)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("state:open"));
    }

    #[tokio::test]
    async fn test_sequence_reports_failing_step() {
        let monitor = SocketMonitor::new();
        let quick = SocketWaitOptions {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let err = SocketSequence::new(&monitor)
            .then(SocketCondition::State(SocketState::Open), quick.clone())
            .then(SocketCondition::FirstMessage, quick)
            .run()
            .await
            .unwrap_err();
        match err {
            Error::SequenceStep { step, condition, .. } => {
                assert_eq!(step, 0);
                assert_eq!(condition, "state:open");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
