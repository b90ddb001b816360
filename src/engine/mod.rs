//! Request/response correlation engine.
//!
//! Tracks which topics are subscribed for which in-flight request and
//! routes each inbound message to the correct phase handler. A request
//! passes through two phases: AwaitingAccept on its
//! `response/{command}/{requestId}` topic, then AwaitingResult on the
//! `result/{jobId}` topic named by the worker's acknowledgment. The
//! result phase is terminal.
//!
//! Inbound handling classifies the topic first and decodes the payload
//! second; engine state changes only after both succeed, so malformed
//! messages never disturb in-flight requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::{AcceptResponse, ResultPayload};
use crate::report::{Outcome, ResultReporter};
use crate::topic::{response_topic, result_topic, Command, RequestId, Topic};
use crate::transport::{Frame, InboundHandler, Transport};

/// Reply phase a subscription is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the worker's acknowledgment on a `response/` topic.
    AwaitingAccept,
    /// Waiting for the terminal result on a `result/` topic.
    AwaitingResult,
}

/// One active subscription, keyed by its topic in the table.
struct SubscriptionEntry {
    request_id: RequestId,
    phase: Phase,
    timer: Option<JoinHandle<()>>,
}

impl SubscriptionEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    reporter: Arc<dyn ResultReporter>,
    timeout: Option<Duration>,
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
}

/// Correlation engine owning the subscription table for one session.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<EngineInner>,
}

impl CorrelationEngine {
    /// Create an engine over a transport, reporting outcomes to the
    /// given reporter. `timeout`, when set, bounds each reply phase;
    /// without it a request whose reply never arrives stays subscribed
    /// indefinitely.
    pub fn new(
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn ResultReporter>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transport,
                reporter,
                timeout,
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a request: generate a fresh id, subscribe for the worker's
    /// acknowledgment, and return the id for the caller to publish under.
    pub async fn begin_request(&self, command: Command) -> Result<RequestId> {
        let request_id = RequestId::new();
        let topic = response_topic(command, request_id);

        {
            let mut subs = self.inner.subscriptions.lock().await;
            if subs.contains_key(&topic) {
                return Err(ProtocolError::TopicInUse(topic));
            }
            subs.insert(
                topic.clone(),
                SubscriptionEntry {
                    request_id,
                    phase: Phase::AwaitingAccept,
                    timer: None,
                },
            );
        }

        if let Err(e) = self.inner.transport.subscribe(&topic).await {
            self.inner.subscriptions.lock().await.remove(&topic);
            return Err(e.into());
        }

        self.attach_timer(&topic).await;
        debug!(request_id = %request_id, topic = %topic, "Request started");
        Ok(request_id)
    }

    /// Single inbound dispatch point for every subscribed message.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) {
        match Topic::parse(topic) {
            Topic::CommandReply { .. } => self.handle_accept(topic, payload).await,
            Topic::ResultReply { job_id } => self.handle_result(topic, &job_id, payload).await,
            Topic::Unknown => {
                warn!(topic = %topic, "Message on unrecognized topic, dropping");
            }
        }
    }

    /// Number of active subscriptions. A request briefly holds two
    /// during the accept-to-result handover.
    pub async fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().await.len()
    }

    /// Number of distinct requests currently in flight.
    pub async fn in_flight(&self) -> usize {
        let subs = self.inner.subscriptions.lock().await;
        subs.values()
            .map(|entry| entry.request_id)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Drop a request without reporting an outcome. Used when the job
    /// publish fails right after the subscription was established.
    pub async fn discard(&self, topic: &str) {
        let entry = self.inner.subscriptions.lock().await.remove(topic);
        let Some(mut entry) = entry else { return };
        entry.cancel_timer();
        if let Err(e) = self.inner.transport.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Unsubscribe failed during discard");
        }
        debug!(request_id = %entry.request_id, topic = %topic, "Request discarded");
    }

    /// Terminate every in-flight request with an `Abandoned` outcome.
    ///
    /// Called on disconnect; subscription state does not survive a
    /// connection, so abandonment is made explicit instead of leaving
    /// requests waiting on replies that can no longer arrive.
    pub async fn abandon_all(&self) {
        let drained: Vec<(String, SubscriptionEntry)> = {
            let mut subs = self.inner.subscriptions.lock().await;
            subs.drain().collect()
        };

        let mut reported = HashSet::new();
        for (topic, mut entry) in drained {
            entry.cancel_timer();
            if let Err(e) = self.inner.transport.unsubscribe(&topic).await {
                debug!(topic = %topic, error = %e, "Unsubscribe failed during abandon");
            }
            // Both phase entries can coexist during the accept handover;
            // the request still gets exactly one outcome.
            if reported.insert(entry.request_id) {
                info!(request_id = %entry.request_id, "Request abandoned");
                self.inner
                    .reporter
                    .on_outcome(entry.request_id, Outcome::Abandoned);
            }
        }
    }

    /// Accept phase: the worker acknowledged the job and named the
    /// downstream job id to watch.
    async fn handle_accept(&self, topic: &str, payload: &[u8]) {
        let accept: AcceptResponse = match serde_json::from_slice(payload) {
            Ok(accept) => accept,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Malformed accept payload, dropping");
                return;
            }
        };

        let next_topic = result_topic(&accept.id);

        // Register the result-phase entry and cancel the accept-phase
        // timer in one critical section, so neither a concurrent expiry
        // nor another request can interleave with the handover.
        let request_id = {
            let mut subs = self.inner.subscriptions.lock().await;
            if subs.contains_key(&next_topic) {
                warn!(
                    topic = %next_topic,
                    "Result topic already has an active subscription, dropping accept"
                );
                return;
            }
            let request_id = match subs.get_mut(topic) {
                Some(entry) if entry.phase == Phase::AwaitingAccept => {
                    entry.cancel_timer();
                    entry.request_id
                }
                Some(_) => {
                    warn!(topic = %topic, "Accept on a topic not awaiting accept, dropping");
                    return;
                }
                None => {
                    warn!(topic = %topic, "Accept for unknown request, dropping");
                    return;
                }
            };
            subs.insert(
                next_topic.clone(),
                SubscriptionEntry {
                    request_id,
                    phase: Phase::AwaitingResult,
                    timer: None,
                },
            );
            request_id
        };

        // Subscribe to the result topic before unsubscribing the accept
        // topic, so the request never has zero active subscriptions.
        if let Err(e) = self.inner.transport.subscribe(&next_topic).await {
            warn!(topic = %next_topic, error = %e, "Result subscribe failed, keeping accept phase");
            self.inner.subscriptions.lock().await.remove(&next_topic);
            self.attach_timer(topic).await;
            return;
        }

        if let Err(e) = self.inner.transport.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Unsubscribe of accept topic failed");
        }
        self.inner.subscriptions.lock().await.remove(topic);

        self.attach_timer(&next_topic).await;
        debug!(
            request_id = %request_id,
            job_id = %accept.id,
            "Job accepted, awaiting result"
        );
    }

    /// Result phase: terminal for the request.
    async fn handle_result(&self, topic: &str, job_id: &str, payload: &[u8]) {
        let result: ResultPayload = match serde_json::from_slice(payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Malformed result payload, dropping");
                return;
            }
        };

        let entry = {
            let mut subs = self.inner.subscriptions.lock().await;
            match subs.get(topic) {
                Some(entry) if entry.phase == Phase::AwaitingResult => subs.remove(topic),
                Some(_) => {
                    warn!(topic = %topic, "Result on a topic not awaiting result, dropping");
                    None
                }
                None => {
                    warn!(job_id = %job_id, "Result for unknown job, dropping");
                    None
                }
            }
        };
        let Some(mut entry) = entry else { return };
        entry.cancel_timer();

        if let Err(e) = self.inner.transport.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Unsubscribe of result topic failed");
        }

        info!(
            request_id = %entry.request_id,
            job_id = %job_id,
            success = result.is_success(),
            "Result received"
        );
        self.inner
            .reporter
            .on_outcome(entry.request_id, Outcome::Finished(result));
    }

    /// Arm the phase timer for a topic, when a timeout is configured.
    async fn attach_timer(&self, topic: &str) {
        let Some(timeout) = self.inner.timeout else {
            return;
        };

        let engine = self.clone();
        let expired_topic = topic.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.expire(&expired_topic).await;
        });

        let mut subs = self.inner.subscriptions.lock().await;
        match subs.get_mut(topic) {
            Some(entry) => entry.timer = Some(handle),
            // The entry can already be gone if the reply raced the timer
            // arming; the timer has nothing left to guard.
            None => handle.abort(),
        }
    }

    /// Timer expiry: the phase's reply never arrived.
    async fn expire(&self, topic: &str) {
        let entry = self.inner.subscriptions.lock().await.remove(topic);
        let Some(entry) = entry else { return };

        if let Err(e) = self.inner.transport.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Unsubscribe failed during timeout");
        }

        warn!(request_id = %entry.request_id, topic = %topic, "Request timed out");
        self.inner
            .reporter
            .on_outcome(entry.request_id, Outcome::TimedOut);
    }
}

impl InboundHandler for CorrelationEngine {
    fn on_message(&self, frame: Arc<Frame>) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        Box::pin(async move {
            engine.on_message(&frame.topic, &frame.payload).await;
        })
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!(reason = %reason, "Connection lost, abandoning in-flight requests");
        let engine = self.clone();
        tokio::spawn(async move {
            engine.abandon_all().await;
        });
    }
}

#[cfg(test)]
mod tests;
