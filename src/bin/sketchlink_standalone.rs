//! sketchlink-standalone: in-process protocol demo
//!
//! Wires the in-memory broker, a scripted build worker, and a client
//! session into a single process, then submits one sketch and waits for
//! its result. Useful for exercising the full two-phase protocol
//! without an external broker.
//!
//! ## Usage
//!
//! ```text
//! sketchlink-standalone [path/to/sketch.ino] [--upload]
//! ```
//!
//! Logging is controlled by the SKETCHLINK_LOG environment variable
//! (defaults to "info").

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sketchlink::config::{Config, LOG_ENV_VAR};
use sketchlink::protocol::{AcceptResponse, JobRequest, ResultDetail, ResultPayload};
use sketchlink::report::{ConnectionStatus, LogReporter, Outcome, ResultReporter};
use sketchlink::session::Session;
use sketchlink::topic::{Command, RequestId};
use sketchlink::transport::InMemoryBroker;

/// Sketch submitted when no file is given on the command line.
const SAMPLE_SKETCH: &str = "void setup() {\n}\n\nvoid loop() {\n}\n";

/// Initialize tracing with the SKETCHLINK_LOG environment variable.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Reporter that logs like `LogReporter` and forwards terminal outcomes
/// to the main task.
struct StandaloneReporter {
    log: LogReporter,
    done: mpsc::UnboundedSender<Outcome>,
}

impl ResultReporter for StandaloneReporter {
    fn on_status(&self, status: ConnectionStatus) {
        self.log.on_status(status);
    }

    fn on_submitted(&self, request: RequestId, command: Command) {
        self.log.on_submitted(request, command);
    }

    fn on_outcome(&self, request: RequestId, outcome: Outcome) {
        self.log.on_outcome(request, outcome.clone());
        let _ = self.done.send(outcome);
    }
}

/// Scripted worker: acknowledges every job, then reports a successful
/// build naming the line count it "compiled".
async fn run_worker(broker: InMemoryBroker) {
    let mut frames = broker.tap();
    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        let segments: Vec<&str> = frame.topic.split('/').collect();
        let (command, request_id) = match segments.as_slice() {
            [command @ ("verify" | "upload"), request_id] => (*command, *request_id),
            _ => continue,
        };

        let job: JobRequest = match serde_json::from_slice(&frame.payload) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Worker received malformed job");
                continue;
            }
        };
        let source = match job.source() {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "Worker could not decode source");
                continue;
            }
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        info!(job_id = %job_id, command = command, "Worker accepted job");

        let accept = AcceptResponse { id: job_id.clone() };
        broker.send(
            format!("response/{}/{}", command, request_id),
            serde_json::to_vec(&accept).unwrap_or_default(),
        );

        let action = if command == "upload" {
            "compiled and flashed"
        } else {
            "compiled"
        };
        let detail = ResultDetail {
            exit_code: Some(0),
            stdout: Some(format!(
                "{}: {} {} lines",
                job.sketch,
                action,
                source.lines().count()
            )),
            ..Default::default()
        };
        broker.send(
            format!("result/{}", job_id),
            serde_json::to_vec(&ResultPayload::Success(detail)).unwrap_or_default(),
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting sketchlink-standalone");

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let mut command = Command::Verify;
    let mut source = SAMPLE_SKETCH.to_string();
    for arg in std::env::args().skip(1) {
        if arg == "--upload" {
            command = Command::Upload;
        } else {
            source = std::fs::read_to_string(&arg)?;
        }
    }

    let broker = InMemoryBroker::new();
    tokio::spawn(run_worker(broker.clone()));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let reporter = Arc::new(StandaloneReporter {
        log: LogReporter,
        done: done_tx,
    });
    let session = Session::new(config, Arc::new(broker.transport()), reporter);

    session.connect().await?;
    let request_id = session.submit(command, &source).await?;
    info!(request_id = %request_id, "Waiting for result");

    match tokio::time::timeout(Duration::from_secs(10), done_rx.recv()).await {
        Ok(Some(Outcome::Finished(result))) => {
            let detail = result.detail();
            info!(
                success = result.is_success(),
                exit_code = ?detail.exit_code,
                stdout = detail.stdout.as_deref().unwrap_or(""),
                "Standalone run finished"
            );
        }
        Ok(Some(outcome)) => {
            warn!(outcome = ?outcome, "Request did not finish normally");
        }
        Ok(None) | Err(_) => {
            error!("No outcome received");
        }
    }

    session.disconnect().await?;
    Ok(())
}
