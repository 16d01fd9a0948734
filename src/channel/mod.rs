//! Channels bind a reliable session to a transport binder. The output channel is the sending
//!  client side of a sequence, the input channel the receiving server side.

pub mod input;
pub mod output;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::binder::{CommunicationState, ReceiveResult, ReliableChannelBinder};
use crate::fault::ReliableSessionError;
use crate::message::Message;

struct LifecycleState {
    state: CommunicationState,
    terminal_error: Option<ReliableSessionError>,
}

/// The open / close / fault state of a channel. Only the first fault is recorded.
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            inner: Mutex::new(LifecycleState {
                state: CommunicationState::Created,
                terminal_error: None,
            }),
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.inner.lock().state
    }

    /// Moves from `from` to `to`, fails with the appropriate error otherwise
    pub fn transition(&self, from: CommunicationState, to: CommunicationState) -> Result<(), ReliableSessionError> {
        let mut inner = self.inner.lock();
        if inner.state == from {
            inner.state = to;
            return Ok(());
        }
        Err(Self::error_for(&inner, &format!("cannot move to {:?}", to)))
    }

    /// Fails unless the channel is opened
    pub fn ensure_opened(&self) -> Result<(), ReliableSessionError> {
        let inner = self.inner.lock();
        if inner.state == CommunicationState::Opened {
            return Ok(());
        }
        Err(Self::error_for(&inner, "the channel is not open"))
    }

    fn error_for(inner: &LifecycleState, what: &str) -> ReliableSessionError {
        match (&inner.terminal_error, inner.state) {
            (Some(e), _) => e.clone(),
            (None, CommunicationState::Closed) | (None, CommunicationState::Closing) => ReliableSessionError::Closed,
            (None, state) => ReliableSessionError::InvalidState(format!("{}: the channel is {:?}", what, state)),
        }
    }

    /// Returns true if this call faulted the channel
    pub fn fault(&self, error: ReliableSessionError) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = CommunicationState::Faulted;
        inner.terminal_error = Some(error);
        true
    }

    /// Returns false if the channel was already closed or faulted
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = CommunicationState::Closed;
        true
    }

    pub fn terminal_error(&self) -> Option<ReliableSessionError> {
        self.inner.lock().terminal_error.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().state.is_terminal()
    }
}

/// What a receive loop feeds
#[async_trait]
pub(crate) trait ReceiveTarget: Send + Sync + 'static {
    fn binder(&self) -> &Arc<dyn ReliableChannelBinder>;
    fn poll_interval(&self) -> Duration;
    fn is_receiving(&self) -> bool;
    async fn process_message(&self, message: Message);
    /// the binder failed or the remote side went away while the channel still needed it
    fn on_receive_failed(&self, error: ReliableSessionError);
}

/// Reads from the target's binder until the target stops receiving or the binder fails. The
///  loop only holds the target weakly, so dropping the channel ends it.
pub(crate) fn spawn_receive_loop<T: ReceiveTarget>(target: Weak<T>) -> JoinHandle<()> {
    tokio::spawn(async move {
        trace!("starting receive loop");
        loop {
            let (binder, poll_interval) = match target.upgrade() {
                Some(t) if t.is_receiving() => (t.binder().clone(), t.poll_interval()),
                _ => break,
            };

            let received = binder.try_receive(poll_interval).await;

            let t = match target.upgrade() {
                Some(t) => t,
                None => break,
            };
            match received {
                Ok(ReceiveResult::Message(message)) => {
                    trace!("received {}", message.action);
                    t.process_message(message).await;
                }
                Ok(ReceiveResult::TimedOut) => {}
                Ok(ReceiveResult::EndOfSession) => {
                    if t.is_receiving() {
                        t.on_receive_failed(ReliableSessionError::communication("the remote endpoint closed the session unexpectedly", None));
                    }
                    break;
                }
                Err(e) => {
                    if binder.is_handleable(&e) {
                        debug!("ignoring recoverable receive failure: {}", e);
                        continue;
                    }
                    if t.is_receiving() {
                        warn!("receive failed: {}", e);
                        t.on_receive_failed(ReliableSessionError::transport(e));
                    }
                    break;
                }
            }
        }
        trace!("receive loop ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_first_fault_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(CommunicationState::Created, CommunicationState::Opened).unwrap();
        lifecycle.ensure_opened().unwrap();

        assert!(lifecycle.fault(ReliableSessionError::Protocol("first".to_string())));
        assert!(!lifecycle.fault(ReliableSessionError::Protocol("second".to_string())));
        assert!(!lifecycle.close());
        assert!(lifecycle.is_terminated());

        match lifecycle.ensure_opened() {
            Err(ReliableSessionError::Protocol(reason)) => assert_eq!(reason, "first"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_closed() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(lifecycle.ensure_opened(), Err(ReliableSessionError::InvalidState(_))));
        assert!(lifecycle.close());
        assert!(matches!(lifecycle.ensure_opened(), Err(ReliableSessionError::Closed)));
        assert!(lifecycle.terminal_error().is_none());
    }
}
