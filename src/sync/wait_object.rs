use std::time::Duration;

use tokio::sync::watch;

use crate::fault::ReliableSessionError;

#[derive(Clone, Debug)]
enum WaitState {
    Unset,
    Set,
    Faulted(ReliableSessionError),
}

/// A manual-reset event that can also be broken: after `fault` or `abort`, every current and
///  future waiter returns the error instead of waiting.
pub struct InterruptibleWaitObject {
    state: watch::Sender<WaitState>,
}

impl InterruptibleWaitObject {
    pub fn new(signaled: bool) -> InterruptibleWaitObject {
        let initial = if signaled { WaitState::Set } else { WaitState::Unset };
        let (state, _) = watch::channel(initial);
        InterruptibleWaitObject { state }
    }

    pub fn set(&self) {
        self.state.send_if_modified(|s| match s {
            WaitState::Unset => {
                *s = WaitState::Set;
                true
            }
            _ => false,
        });
    }

    pub fn reset(&self) {
        self.state.send_if_modified(|s| {
            if let WaitState::Set = s {
                *s = WaitState::Unset;
            }
            false
        });
    }

    /// Releases all waiters with the error. The first fault (or abort) sticks.
    pub fn fault(&self, error: ReliableSessionError) {
        self.state.send_if_modified(|s| match s {
            WaitState::Faulted(_) => false,
            _ => {
                *s = WaitState::Faulted(error);
                true
            }
        });
    }

    pub fn abort(&self) {
        self.fault(ReliableSessionError::Aborted);
    }

    pub fn is_set(&self) -> bool {
        matches!(*self.state.borrow(), WaitState::Set)
    }

    /// Waits until the object is set. Returns `Ok(false)` if the timeout expired first.
    pub async fn wait(&self, timeout: Duration) -> Result<bool, ReliableSessionError> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| !matches!(s, WaitState::Unset))).await;

        let state = match waited {
            Err(_) => return Ok(false),
            Ok(Err(_)) => return Err(ReliableSessionError::Aborted),
            Ok(Ok(state)) => state.clone(),
        };
        match state {
            WaitState::Faulted(e) => Err(e),
            _ => Ok(true),
        }
    }
}
