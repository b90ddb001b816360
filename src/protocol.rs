//! Wire payloads for the job protocol.
//!
//! All payloads are JSON. The result payload is decoded as a closed
//! tagged union on its `type` field rather than probed field-by-field,
//! so a malformed message is an explicit decode error instead of a
//! half-populated value.

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Job submission published to `{command}/{requestId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Target artifact name the worker builds under.
    pub sketch: String,
    /// Source text, base64-encoded for transport.
    pub src: String,
}

impl JobRequest {
    /// Build a job from raw source text, encoding it for transport.
    pub fn new(sketch: impl Into<String>, source: &str) -> Self {
        Self {
            sketch: sketch.into(),
            src: encode_source(source),
        }
    }

    /// Recover the original source text.
    pub fn source(&self) -> Result<String, ProtocolError> {
        decode_source(&self.src)
    }
}

/// Encode source text into its transport representation.
pub fn encode_source(source: &str) -> String {
    BASE64_STANDARD.encode(source.as_bytes())
}

/// Decode the transport representation back into source text.
pub fn decode_source(encoded: &str) -> Result<String, ProtocolError> {
    let bytes = BASE64_STANDARD.decode(encoded)?;
    Ok(String::from_utf8(bytes)?)
}

/// Worker acknowledgment received on `response/{command}/{requestId}`,
/// naming the downstream job to watch for the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResponse {
    /// Downstream job id.
    pub id: String,
}

/// Terminal job result received on `result/{jobId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    /// The worker ran the job to completion.
    Success(ResultDetail),
    /// The worker could not run the job.
    Failure(ResultDetail),
}

impl ResultPayload {
    /// Whether the worker reported success.
    pub fn is_success(&self) -> bool {
        matches!(self, ResultPayload::Success(_))
    }

    /// Detail carried by either variant.
    pub fn detail(&self) -> &ResultDetail {
        match self {
            ResultPayload::Success(detail) | ResultPayload::Failure(detail) => detail,
        }
    }
}

/// Output captured from the worker's run of the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDetail {
    /// Process exit code, when the job ran at all.
    #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured standard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Compiler diagnostics, in the order the worker produced them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Diagnostic>,
}

/// A single structured compiler diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// File the diagnostic points at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// 1-based line number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-based column number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Diagnostic text.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trip() {
        for source in [
            "",
            "int main(){}",
            "line one\nline two\n",
            "h\u{e9}llo \u{4e16}\u{754c}\n",
            "\ttabs\tand  spaces \r\n",
        ] {
            let encoded = encode_source(source);
            assert_eq!(decode_source(&encoded).unwrap(), source);
        }
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        assert!(decode_source("not!base64").is_err());
    }

    #[test]
    fn test_job_request_wire_shape() {
        let job = JobRequest::new("sketch.ino", "int main(){}");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["sketch"], "sketch.ino");
        assert_eq!(json["src"], encode_source("int main(){}"));
    }

    #[test]
    fn test_job_request_source_round_trip() {
        let job = JobRequest::new("sketch.ino", "void loop() {}\n");
        assert_eq!(job.source().unwrap(), "void loop() {}\n");
    }

    #[test]
    fn test_accept_response_decodes() {
        let accept: AcceptResponse = serde_json::from_str(r#"{"id":"job1"}"#).unwrap();
        assert_eq!(accept.id, "job1");
    }

    #[test]
    fn test_result_success_decodes() {
        let raw = r#"{"type":"success","exitCode":0,"stdout":"OK","stderr":""}"#;
        let result: ResultPayload = serde_json::from_str(raw).unwrap();
        assert!(result.is_success());
        assert_eq!(result.detail().exit_code, Some(0));
        assert_eq!(result.detail().stdout.as_deref(), Some("OK"));
        assert!(result.detail().errors.is_empty());
    }

    #[test]
    fn test_result_failure_with_diagnostics_decodes() {
        let raw = r#"{
            "type": "failure",
            "exitCode": 1,
            "stderr": "compilation failed",
            "errors": [
                {"file": "sketch.ino", "line": 3, "column": 7, "message": "expected ';'"},
                {"message": "1 error generated"}
            ]
        }"#;
        let result: ResultPayload = serde_json::from_str(raw).unwrap();
        assert!(!result.is_success());
        let detail = result.detail();
        assert_eq!(detail.exit_code, Some(1));
        assert_eq!(detail.errors.len(), 2);
        assert_eq!(detail.errors[0].line, Some(3));
        assert_eq!(detail.errors[1].message, "1 error generated");
    }

    #[test]
    fn test_result_sparse_fields_default() {
        let result: ResultPayload = serde_json::from_str(r#"{"type":"failure"}"#).unwrap();
        assert_eq!(result.detail().exit_code, None);
        assert!(result.detail().errors.is_empty());
    }

    #[test]
    fn test_result_unknown_tag_is_an_error() {
        assert!(serde_json::from_str::<ResultPayload>(r#"{"type":"partial"}"#).is_err());
    }
}
