//! Connection session owning the transport and correlation engine.
//!
//! A `Session` is constructed per connection lifetime and handed to
//! collaborators explicitly; there is no ambient shared state. Dropping
//! the connection drops all correlation state with it, so disconnect
//! abandons in-flight requests out loud instead of losing them quietly.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::engine::CorrelationEngine;
use crate::error::Result;
use crate::protocol::JobRequest;
use crate::report::{ConnectionStatus, ResultReporter};
use crate::topic::{command_topic, response_topic, Command, RequestId};
use crate::transport::Transport;

/// One connection's worth of protocol state: the transport, the
/// correlation engine, and the reporter the engine notifies.
pub struct Session {
    config: Config,
    transport: Arc<dyn Transport>,
    engine: CorrelationEngine,
    reporter: Arc<dyn ResultReporter>,
}

impl Session {
    /// Build a session from a configuration, a transport, and the
    /// reporter that will observe request outcomes.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn ResultReporter>,
    ) -> Self {
        let engine = CorrelationEngine::new(
            transport.clone(),
            reporter.clone(),
            config.request.timeout(),
        );
        Self {
            config,
            transport,
            engine,
            reporter,
        }
    }

    /// The session's correlation engine.
    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    /// Open the connection and start routing inbound messages to the
    /// correlation engine.
    pub async fn connect(&self) -> Result<()> {
        self.reporter.on_status(ConnectionStatus::Connecting);
        match self
            .transport
            .connect(Arc::new(self.engine.clone()))
            .await
        {
            Ok(()) => {
                self.reporter.on_status(ConnectionStatus::Connected);
                info!("Session connected");
                Ok(())
            }
            Err(e) => {
                self.reporter.on_status(ConnectionStatus::ConnectFailed);
                Err(e.into())
            }
        }
    }

    /// Close the connection, abandoning every in-flight request with an
    /// explicit outcome first.
    pub async fn disconnect(&self) -> Result<()> {
        self.engine.abandon_all().await;
        self.transport.disconnect().await?;
        info!("Session disconnected");
        Ok(())
    }

    /// Tear the connection down and bring it back up. In-flight
    /// requests are abandoned; they are not re-submitted.
    pub async fn reconnect(&self) -> Result<()> {
        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "Disconnect before reconnect failed");
        }
        self.connect().await
    }

    /// Submit a job: begin a correlated request, then publish the
    /// encoded source under the configured sketch name.
    ///
    /// There is no synchronous completion value; the terminal outcome
    /// arrives later through the session's reporter. If the publish
    /// itself fails, the request is torn down and the error returned.
    pub async fn submit(&self, command: Command, source: &str) -> Result<RequestId> {
        let request_id = self.engine.begin_request(command).await?;
        self.reporter.on_submitted(request_id, command);

        let job = JobRequest::new(&self.config.job.sketch, source);
        let payload = serde_json::to_vec(&job)?;

        let topic = command_topic(command, request_id);
        if let Err(e) = self.transport.publish(&topic, payload).await {
            self.engine
                .discard(&response_topic(command, request_id))
                .await;
            return Err(e.into());
        }

        debug!(
            request_id = %request_id,
            command = %command,
            sketch = %self.config.job.sketch,
            "Job published"
        );
        Ok(request_id)
    }
}
