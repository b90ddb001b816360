//! Result reporter seam.
//!
//! The correlation engine does not render anything; it hands terminal
//! outcomes and status changes to a `ResultReporter` the caller supplies
//! (a UI, a test collector, or the default log reporter).

use tracing::{info, warn};

use crate::protocol::ResultPayload;
use crate::topic::{Command, RequestId};

/// Connection status surfaced to the caller's UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// A connection attempt is in progress.
    Connecting,
    /// The connection is up.
    Connected,
    /// The connection attempt failed.
    ConnectFailed,
    /// An established connection was lost.
    ConnectionLost,
}

/// How a request's lifecycle ended.
///
/// Every request terminates with exactly one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The worker delivered a terminal result. A worker-reported failure
    /// still arrives here; it is a normal outcome, not an engine error.
    Finished(ResultPayload),
    /// No reply arrived within the configured timeout.
    TimedOut,
    /// The session was disconnected while the request was in flight.
    Abandoned,
}

/// External collaborator notified about request lifecycles.
pub trait ResultReporter: Send + Sync {
    /// Connection status changed.
    fn on_status(&self, status: ConnectionStatus);

    /// A job submission started; the result will arrive later through
    /// `on_outcome`.
    fn on_submitted(&self, request: RequestId, command: Command);

    /// A request terminated.
    fn on_outcome(&self, request: RequestId, outcome: Outcome);
}

/// Reporter that writes structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ResultReporter for LogReporter {
    fn on_status(&self, status: ConnectionStatus) {
        info!(status = ?status, "Connection status changed");
    }

    fn on_submitted(&self, request: RequestId, command: Command) {
        info!(request_id = %request, command = %command, "Job submitted");
    }

    fn on_outcome(&self, request: RequestId, outcome: Outcome) {
        match outcome {
            Outcome::Finished(result) => {
                let detail = result.detail();
                if result.is_success() {
                    info!(
                        request_id = %request,
                        exit_code = ?detail.exit_code,
                        stdout = detail.stdout.as_deref().unwrap_or(""),
                        stderr = detail.stderr.as_deref().unwrap_or(""),
                        "Job finished"
                    );
                } else {
                    warn!(
                        request_id = %request,
                        exit_code = ?detail.exit_code,
                        stderr = detail.stderr.as_deref().unwrap_or(""),
                        diagnostics = detail.errors.len(),
                        "Job failed"
                    );
                }
            }
            Outcome::TimedOut => {
                warn!(request_id = %request, "Request timed out");
            }
            Outcome::Abandoned => {
                warn!(request_id = %request, "Request abandoned by disconnect");
            }
        }
    }
}
