use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::debug;

use crate::message::Message;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommunicationState::Closed | CommunicationState::Faulted)
    }
}

/// Which transport errors a send swallows instead of returning. 'Handled' errors are those the
///  binder considers recoverable (see [ReliableChannelBinder::is_handleable]).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MaskingMode {
    None,
    Handled,
    Unhandled,
    All,
}

impl MaskingMode {
    pub fn with_handled(self) -> MaskingMode {
        match self {
            MaskingMode::None | MaskingMode::Handled => MaskingMode::Handled,
            MaskingMode::Unhandled | MaskingMode::All => MaskingMode::All,
        }
    }

    fn masks(&self, handleable: bool) -> bool {
        match self {
            MaskingMode::None => false,
            MaskingMode::Handled => handleable,
            MaskingMode::Unhandled => !handleable,
            MaskingMode::All => true,
        }
    }
}

#[derive(Debug)]
pub enum ReceiveResult {
    Message(Message),
    TimedOut,
    /// the remote side closed its half of the session, no more messages will arrive
    EndOfSession,
}

/// The transport-facing side of a reliable channel: an unreliable request-reply or duplex
///  session to the remote endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReliableChannelBinder: Send + Sync + 'static {
    async fn open(&self, timeout: Duration) -> anyhow::Result<()>;
    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;
    fn abort(&self);

    /// one-way send
    async fn send(&self, message: Message, timeout: Duration) -> anyhow::Result<()>;
    /// request-reply; `None` if the remote side answered without a message
    async fn request(&self, message: Message, timeout: Duration) -> anyhow::Result<Option<Message>>;
    async fn try_receive(&self, timeout: Duration) -> anyhow::Result<ReceiveResult>;

    fn state(&self) -> CommunicationState;
    fn connected(&self) -> bool;
    fn can_send_asynchronously(&self) -> bool;
    fn remote_address(&self) -> String;
    fn local_address(&self) -> String;

    /// true if the error is a recoverable transport failure (a retry may succeed), false if it
    ///  means the binder itself is broken
    fn is_handleable(&self, e: &anyhow::Error) -> bool;
}

/// A received request that expects a reply on the same transport exchange.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestContext: Send + Sync {
    async fn reply(&self, message: Message, timeout: Duration) -> anyhow::Result<()>;
    fn abort(&self);
}

pub async fn send_masked(binder: &dyn ReliableChannelBinder, message: Message, timeout: Duration, masking: MaskingMode) -> anyhow::Result<()> {
    match binder.send(message, timeout).await {
        Ok(()) => Ok(()),
        Err(e) => mask(binder, e, masking).map(|_| ()),
    }
}

pub async fn request_masked(binder: &dyn ReliableChannelBinder, message: Message, timeout: Duration, masking: MaskingMode) -> anyhow::Result<Option<Message>> {
    match binder.request(message, timeout).await {
        Ok(reply) => Ok(reply),
        Err(e) => mask(binder, e, masking).map(|_| None),
    }
}

fn mask(binder: &dyn ReliableChannelBinder, e: anyhow::Error, masking: MaskingMode) -> anyhow::Result<()> {
    if masking.masks(binder.is_handleable(&e)) {
        debug!("masking transport error: {}", e);
        Ok(())
    }
    else {
        Err(e)
    }
}
