//! Request-reply exchanges of the protocol itself (CreateSequence, CloseSequence,
//!  TerminateSequence). A requestor re-sends its request until a reply arrives, the overall
//!  timeout expires, or the channel faults.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::binder::{CommunicationState, ReceiveResult, ReliableChannelBinder};
use crate::config::REQUESTOR_ITERATION_TIME;
use crate::fault::ReliableSessionError;
use crate::message::Message;
use crate::message_info::WsrmMessageInfo;
use crate::sync::wait_object::InterruptibleWaitObject;
use crate::timeout_helper::TimeoutHelper;
use crate::unique_id::UniqueId;

/// How the reply reaches the requestor
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestorKind {
    /// the binder is request-reply, the reply comes back on the same exchange
    Request,
    /// send one-way, then receive the reply directly from the binder (nothing else reads it yet)
    SendReceive,
    /// send one-way, then wait for the channel's receive loop to hand over the reply
    SendWait,
}

enum AttemptError {
    Transport(anyhow::Error),
    Session(ReliableSessionError),
}

pub struct ReliableRequestor {
    kind: RequestorKind,
    name: &'static str,
    binder: Arc<dyn ReliableChannelBinder>,
    request: Message,
    message_id: Option<UniqueId>,
    is_create_sequence: bool,
    /// broken by fault / abort, which ends the wait between two attempts
    abort_handle: InterruptibleWaitObject,
    reply_event: InterruptibleWaitObject,
    reply: Mutex<Option<Message>>,
}

impl ReliableRequestor {
    /// `expects_reply` gives the request a message id and makes a reply mandatory
    pub fn new(kind: RequestorKind, name: &'static str, binder: Arc<dyn ReliableChannelBinder>, request: Message, expects_reply: bool) -> ReliableRequestor {
        let (request, message_id) = if expects_reply {
            let message_id = UniqueId::new();
            let request = request
                .with_message_id(message_id)
                .with_reply_to(binder.local_address());
            (request, Some(message_id))
        }
        else {
            (request, None)
        };

        ReliableRequestor {
            kind,
            name,
            binder,
            request,
            message_id,
            is_create_sequence: false,
            abort_handle: InterruptibleWaitObject::new(false),
            reply_event: InterruptibleWaitObject::new(false),
            reply: Mutex::new(None),
        }
    }

    /// CreateSequence gives up on the first error it cannot retry
    pub fn for_create_sequence(kind: RequestorKind, binder: Arc<dyn ReliableChannelBinder>, request: Message) -> ReliableRequestor {
        let mut requestor = ReliableRequestor::new(kind, "CreateSequence", binder, request, true);
        requestor.is_create_sequence = true;
        requestor
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message_id(&self) -> Option<UniqueId> {
        self.message_id
    }

    /// Hands over a reply that the channel's receive loop picked up (for [RequestorKind::SendWait])
    pub fn set_info(&self, info: WsrmMessageInfo) {
        *self.reply.lock() = Some(info.into_message());
        self.reply_event.set();
    }

    pub fn fault(&self, error: ReliableSessionError) {
        self.abort_handle.fault(error.clone());
        self.reply_event.fault(error);
    }

    pub fn abort(&self) {
        self.abort_handle.abort();
        self.reply_event.abort();
    }

    /// Runs the exchange. Returns `None` only for requests that do not expect a reply.
    pub async fn request(&self, timeout: Duration) -> Result<Option<Message>, ReliableSessionError> {
        let helper = TimeoutHelper::new(timeout);

        loop {
            let remaining = helper.remaining();
            let last_iteration = remaining <= REQUESTOR_ITERATION_TIME;
            let iteration_timeout = remaining.min(REQUESTOR_ITERATION_TIME);
            let started = Instant::now();

            match self.attempt(iteration_timeout).await {
                Ok(reply) => {
                    if reply.is_some() || self.message_id.is_none() {
                        return Ok(reply);
                    }
                    trace!("no reply to {} within {:?}", self.name, iteration_timeout);
                }
                Err(AttemptError::Session(e)) => return Err(e),
                Err(AttemptError::Transport(e)) => {
                    if !self.is_retryable(&e, last_iteration) {
                        return Err(ReliableSessionError::transport(e));
                    }
                    debug!("{} attempt failed, retrying: {}", self.name, e);
                }
            }

            if last_iteration {
                break;
            }

            let rest_of_iteration = iteration_timeout.saturating_sub(started.elapsed());
            self.abort_handle.wait(rest_of_iteration).await?;
        }

        Err(ReliableSessionError::Timeout(format!("{} did not receive a reply within {:?}", self.name, timeout)))
    }

    fn is_retryable(&self, e: &anyhow::Error, last_iteration: bool) -> bool {
        if !self.binder.is_handleable(e) {
            return false;
        }
        if self.is_create_sequence {
            return !last_iteration && self.binder.state() == CommunicationState::Opened;
        }
        true
    }

    async fn attempt(&self, timeout: Duration) -> Result<Option<Message>, AttemptError> {
        let helper = TimeoutHelper::new(timeout);
        let request = self.request.clone();

        match self.kind {
            RequestorKind::Request => {
                self.binder.request(request, timeout).await
                    .map_err(AttemptError::Transport)
            }
            RequestorKind::SendReceive => {
                self.binder.send(request, timeout).await
                    .map_err(AttemptError::Transport)?;
                loop {
                    match self.binder.try_receive(helper.remaining()).await.map_err(AttemptError::Transport)? {
                        ReceiveResult::Message(reply) => {
                            if self.message_id.is_some() && reply.relates_to.is_some() && reply.relates_to != self.message_id {
                                debug!("{} ignoring unrelated message {}", self.name, reply.action);
                                continue;
                            }
                            return Ok(Some(reply));
                        }
                        ReceiveResult::TimedOut | ReceiveResult::EndOfSession => return Ok(None),
                    }
                }
            }
            RequestorKind::SendWait => {
                self.binder.send(request, timeout).await
                    .map_err(AttemptError::Transport)?;
                match self.reply_event.wait(helper.remaining()).await {
                    Ok(true) => Ok(self.reply.lock().take()),
                    Ok(false) => Ok(None),
                    Err(e) => Err(AttemptError::Session(e)),
                }
            }
        }
    }
}
