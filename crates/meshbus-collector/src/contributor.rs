//! Reply side of scatter-gather.
//!
//! A [`Contributor`] listens on a request topic and hands each request to a
//! [`RequestHandler`] through a [`Responder`], which can acknowledge (to ask
//! the requester for more time or announce more replies) and then sends
//! exactly one payload reply.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;

use meshbus_protocol::{Ack, Envelope};
use meshbus_transport::Transport;

use crate::CollectorError;

/// Hints carried by an ack-only reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHint {
    /// Ask the requester to wait until this many ms after its start.
    pub timeout_ms: Option<u64>,
    /// Replies this responder will still send. Zero declares it done.
    pub responses_remaining: i64,
}

impl Default for AckHint {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            responses_remaining: 1,
        }
    }
}

/// Boxed future returned by [`RequestHandler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handles one incoming request.
///
/// The returned future runs on its own task, so a slow reply never delays
/// the next request.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, responder: Responder) -> HandlerFuture;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, responder: Responder) -> HandlerFuture {
        Box::pin(self(responder))
    }
}

/// Replies to a single request.
pub struct Responder {
    transport: Arc<dyn Transport>,
    request: Envelope,
    responder_id: String,
}

impl Responder {
    pub fn new(transport: Arc<dyn Transport>, request: Envelope) -> Self {
        Self {
            transport,
            request,
            responder_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn request(&self) -> &Envelope {
        &self.request
    }

    pub fn responder_id(&self) -> &str {
        &self.responder_id
    }

    /// Send an ack-only reply carrying `hint`.
    pub async fn ack(&self, hint: AckHint) -> Result<(), CollectorError> {
        let mut ack = Ack::new(&self.responder_id).with_responses_remaining(hint.responses_remaining);
        ack.timeout_ms = hint.timeout_ms;
        self.reply(ack, None).await
    }

    /// Send the payload reply. Counts down one reply this responder declared.
    pub async fn send(self, payload: serde_json::Value) -> Result<(), CollectorError> {
        let ack = Ack::new(&self.responder_id).with_responses_remaining(-1);
        self.reply(ack, Some(payload)).await
    }

    async fn reply(&self, ack: Ack, payload: Option<serde_json::Value>) -> Result<(), CollectorError> {
        let mut envelope = Envelope::response_to(&self.request, self.transport.service())?;
        envelope.ack = Some(ack);
        envelope.payload = payload;
        let topic = envelope.topics.to.clone();
        self.transport.publish(&topic, &envelope).await?;
        Ok(())
    }
}

/// Attaches request handlers to topics.
pub struct Contributor;

impl Contributor {
    /// Listen on `topic` and pass every request to `handler`.
    ///
    /// Each request is answered on its own task. Ending the contributor stops
    /// reading new requests; replies already in progress still complete.
    pub fn attach<H: RequestHandler>(
        transport: Arc<dyn Transport>,
        topic: &str,
        handler: H,
    ) -> Result<ContributorHandle, CollectorError> {
        let mut subscription = transport.subscribe(topic)?;
        let topic = topic.to_string();
        tracing::debug!(topic = %topic, "Contributor attached");

        let task = tokio::spawn(async move {
            while let Some(request) = subscription.recv().await {
                if request.topics.response.is_none() {
                    tracing::debug!(topic = %topic, id = %request.id, "Ignoring request without response topic");
                    continue;
                }
                tokio::spawn(handler.handle(Responder::new(transport.clone(), request)));
            }
        });

        Ok(ContributorHandle { task })
    }
}

/// Running contributor. Ending it detaches from the request topic.
pub struct ContributorHandle {
    task: JoinHandle<()>,
}

impl ContributorHandle {
    /// Stop answering requests. Safe to call repeatedly.
    pub fn end(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ContributorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
