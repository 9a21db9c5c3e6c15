//! Prometheus metrics for monitoring.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`install_recorder`] has been called, so library code can record
//! unconditionally.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use crate::error::{Error, Result};

pub const SESSIONS_OPENED: &str = "cloud_run_mcp_sessions_opened_total";
pub const SESSIONS_CLOSED: &str = "cloud_run_mcp_sessions_closed_total";
pub const ACTIVE_SESSIONS: &str = "cloud_run_mcp_active_sessions";
pub const POSTED_MESSAGES: &str = "cloud_run_mcp_posted_messages_total";
pub const STATELESS_REQUESTS: &str = "cloud_run_mcp_stateless_requests_total";
pub const TOOL_CALLS: &str = "cloud_run_mcp_tool_calls_total";
pub const TOOL_CALL_SECONDS: &str = "cloud_run_mcp_tool_call_duration_seconds";

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("cannot install metrics recorder: {}", e)))?;

    ::metrics::describe_counter!(SESSIONS_OPENED, "Streaming sessions opened");
    ::metrics::describe_counter!(SESSIONS_CLOSED, "Streaming sessions closed");
    ::metrics::describe_gauge!(ACTIVE_SESSIONS, "Streaming sessions currently registered");
    ::metrics::describe_counter!(POSTED_MESSAGES, "Messages posted to streaming sessions");
    ::metrics::describe_counter!(STATELESS_REQUESTS, "Requests served on the stateless endpoint");
    ::metrics::describe_counter!(TOOL_CALLS, "Tool invocations");
    ::metrics::describe_histogram!(TOOL_CALL_SECONDS, "Tool invocation latency");

    Ok(handle)
}

pub fn session_opened() {
    ::metrics::counter!(SESSIONS_OPENED).increment(1);
    ::metrics::gauge!(ACTIVE_SESSIONS).increment(1.0);
}

pub fn session_closed() {
    ::metrics::counter!(SESSIONS_CLOSED).increment(1);
    ::metrics::gauge!(ACTIVE_SESSIONS).decrement(1.0);
}

pub fn message_posted() {
    ::metrics::counter!(POSTED_MESSAGES).increment(1);
}

pub fn stateless_request() {
    ::metrics::counter!(STATELESS_REQUESTS).increment(1);
}

/// Count one tool call, labelled by tool and outcome.
pub fn tool_call(tool: &str, is_error: bool, timer: &Timer) {
    let outcome = if is_error { "error" } else { "ok" };
    ::metrics::counter!(TOOL_CALLS, "tool" => tool.to_string(), "outcome" => outcome).increment(1);
    ::metrics::histogram!(TOOL_CALL_SECONDS, "tool" => tool.to_string()).record(timer.elapsed_secs());
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Get elapsed time in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
