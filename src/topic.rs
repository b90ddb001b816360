//! Topic grammar for the job protocol.
//!
//! Every message in the protocol travels on one of three topic shapes:
//! - `{command}/{requestId}` - job submission, published by the client
//! - `response/{command}/{requestId}` - worker acknowledgment
//! - `result/{jobId}` - terminal job result
//!
//! Inbound topics are classified by an explicit parser before any
//! payload decoding is attempted.

use std::fmt;

use uuid::Uuid;

/// First segment of accept-phase reply topics.
pub const RESPONSE_SEGMENT: &str = "response";
/// First segment of result-phase reply topics.
pub const RESULT_SEGMENT: &str = "result";

/// Operation the remote worker should perform on a submitted sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Compile the sketch without flashing it.
    Verify,
    /// Compile and flash the sketch to the target device.
    Upload,
}

impl Command {
    /// Wire name used as a topic segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Verify => "verify",
            Command::Upload => "upload",
        }
    }

    /// Parse a topic segment into a command.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "verify" => Some(Command::Verify),
            "upload" => Some(Command::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-request token embedded in topic names.
///
/// Generated fresh for every submission; uniqueness is what keeps
/// concurrent requests from colliding on topic strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Topic the client publishes a job submission to.
pub fn command_topic(command: Command, request_id: RequestId) -> String {
    format!("{}/{}", command, request_id)
}

/// Topic the client subscribes to for the worker's acknowledgment.
pub fn response_topic(command: Command, request_id: RequestId) -> String {
    format!("{}/{}/{}", RESPONSE_SEGMENT, command, request_id)
}

/// Topic the client subscribes to for the terminal job result.
pub fn result_topic(job_id: &str) -> String {
    format!("{}/{}", RESULT_SEGMENT, job_id)
}

/// Classification of an inbound topic.
///
/// Identifiers are carried as opaque strings; their format is not part
/// of the topic contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `response/{command}/{requestId}` - accept-phase reply.
    CommandReply {
        /// Command the original submission carried.
        command: Command,
        /// Request id the reply correlates to.
        request_id: String,
    },
    /// `result/{jobId}` - result-phase reply.
    ResultReply {
        /// Downstream job id named by the accept reply.
        job_id: String,
    },
    /// Anything else; logged and ignored by the engine.
    Unknown,
}

impl Topic {
    /// Classify a raw topic string.
    ///
    /// The grammar is strict: reply shapes must have exactly the right
    /// number of non-empty segments, everything else is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        let segments: Vec<&str> = raw.split('/').collect();
        match segments.as_slice() {
            [RESPONSE_SEGMENT, command, request_id] if !request_id.is_empty() => {
                match Command::from_segment(command) {
                    Some(command) => Topic::CommandReply {
                        command,
                        request_id: (*request_id).to_string(),
                    },
                    None => Topic::Unknown,
                }
            }
            [RESULT_SEGMENT, job_id] if !job_id.is_empty() => Topic::ResultReply {
                job_id: (*job_id).to_string(),
            },
            _ => Topic::Unknown,
        }
    }
}
