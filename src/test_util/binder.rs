use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;
use tracing::trace;

use crate::binder::{CommunicationState, ReceiveResult, ReliableChannelBinder};
use crate::message::Message;

/// A failure the binder considers recoverable
#[derive(Debug, Error)]
#[error("simulated transport failure")]
pub struct SimulatedTransportError;

type DropFilter = Box<dyn FnMut(&Message) -> bool + Send>;

/// One end of an in-memory one-way duplex session. Messages sent on one end arrive at the
///  other; the test can inspect, lose or fail them.
pub struct InMemoryBinder {
    local_address: String,
    remote_address: String,
    state: Mutex<CommunicationState>,
    outbox: mpsc::UnboundedSender<Message>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    sent: Mutex<Vec<Message>>,
    drop_filter: Mutex<Option<DropFilter>>,
    failing: Mutex<bool>,
}

/// Creates two connected binders
pub fn binder_pair(address_a: &str, address_b: &str) -> (Arc<InMemoryBinder>, Arc<InMemoryBinder>) {
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();

    let a = InMemoryBinder::new(address_a, address_b, to_b, from_b);
    let b = InMemoryBinder::new(address_b, address_a, to_a, from_a);
    (Arc::new(a), Arc::new(b))
}

impl InMemoryBinder {
    fn new(local_address: &str, remote_address: &str, outbox: mpsc::UnboundedSender<Message>, inbox: mpsc::UnboundedReceiver<Message>) -> InMemoryBinder {
        InMemoryBinder {
            local_address: local_address.to_string(),
            remote_address: remote_address.to_string(),
            state: Mutex::new(CommunicationState::Created),
            outbox,
            inbox: tokio::sync::Mutex::new(inbox),
            sent: Default::default(),
            drop_filter: Default::default(),
            failing: Default::default(),
        }
    }

    /// returns everything sent so far, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// actions of everything sent so far, without clearing the buffer
    pub fn sent_actions(&self) -> Vec<String> {
        self.sent.lock()
            .iter()
            .map(|m| m.action.clone())
            .collect()
    }

    /// Messages for which the filter returns true are lost after being recorded as sent
    pub fn drop_outgoing_where(&self, filter: impl FnMut(&Message) -> bool + Send + 'static) {
        *self.drop_filter.lock() = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock() = None;
    }

    /// While failing, every send returns a [SimulatedTransportError]
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl ReliableChannelBinder for InMemoryBinder {
    async fn open(&self, _timeout: Duration) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if *state != CommunicationState::Created {
            bail!("cannot open a binder that is {:?}", *state);
        }
        *state = CommunicationState::Opened;
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        *self.state.lock() = CommunicationState::Closed;
        Ok(())
    }

    fn abort(&self) {
        *self.state.lock() = CommunicationState::Closed;
    }

    async fn send(&self, message: Message, _timeout: Duration) -> anyhow::Result<()> {
        let state = self.state();
        if state != CommunicationState::Opened {
            bail!("cannot send on a binder that is {:?}", state);
        }
        if *self.failing.lock() {
            return Err(SimulatedTransportError.into());
        }

        trace!("{} -> {}: {}", self.local_address, self.remote_address, message.action);
        self.sent.lock().push(message.clone());

        let lost = match self.drop_filter.lock().as_mut() {
            Some(filter) => filter(&message),
            None => false,
        };
        if lost {
            trace!("losing {}", message.action);
            return Ok(());
        }

        self.outbox.send(message)
            .map_err(|_| anyhow!("the remote binder is gone"))
    }

    async fn request(&self, _message: Message, _timeout: Duration) -> anyhow::Result<Option<Message>> {
        bail!("request-reply is not supported by a one-way duplex binder")
    }

    async fn try_receive(&self, timeout: Duration) -> anyhow::Result<ReceiveResult> {
        let mut inbox = self.inbox.lock().await;
        match time::timeout(timeout, inbox.recv()).await {
            Ok(Some(message)) => Ok(ReceiveResult::Message(message)),
            Ok(None) => Ok(ReceiveResult::EndOfSession),
            Err(_) => Ok(ReceiveResult::TimedOut),
        }
    }

    fn state(&self) -> CommunicationState {
        *self.state.lock()
    }

    fn connected(&self) -> bool {
        self.state() == CommunicationState::Opened
    }

    fn can_send_asynchronously(&self) -> bool {
        true
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    fn is_handleable(&self, e: &anyhow::Error) -> bool {
        e.downcast_ref::<SimulatedTransportError>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn test_pair_delivers_and_loses() {
        let (a, b) = binder_pair("urn:a", "urn:b");
        a.open(Duration::from_secs(1)).await.unwrap();
        b.open(Duration::from_secs(1)).await.unwrap();

        a.drop_outgoing_where(|m| m.action == "urn:lost");
        a.send(Message::application("urn:lost", Bytes::new()), Duration::from_secs(1)).await.unwrap();
        a.send(Message::application("urn:kept", Bytes::new()), Duration::from_secs(1)).await.unwrap();

        match b.try_receive(Duration::from_secs(1)).await.unwrap() {
            ReceiveResult::Message(m) => assert_eq!(m.action, "urn:kept"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(b.try_receive(Duration::from_secs(1)).await.unwrap(), ReceiveResult::TimedOut));
        assert_eq!(a.sent_actions(), vec!["urn:lost".to_string(), "urn:kept".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_send_is_handleable() {
        let (a, _b) = binder_pair("urn:a", "urn:b");
        a.open(Duration::from_secs(1)).await.unwrap();
        a.set_failing(true);
        let e = a.send(Message::application("urn:x", Bytes::new()), Duration::from_secs(1)).await.unwrap_err();
        assert!(a.is_handleable(&e));

        a.abort();
        a.set_failing(false);
        let e = a.send(Message::application("urn:x", Bytes::new()), Duration::from_secs(1)).await.unwrap_err();
        assert!(!a.is_handleable(&e));
    }
}
