use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::binder::{ReliableChannelBinder, RequestContext};
use crate::fault::ReliableSessionError;
use crate::message::Message;
use crate::timeout_helper::TimeoutHelper;

/// Sends terminating faults on behalf of a session. Sending is best effort: this never blocks the
///  caller and never reports failure back to it.
#[cfg_attr(test, automock)]
pub trait FaultDispatcher: Send + Sync + 'static {
    fn send_fault_async(&self, binder: Arc<dyn ReliableChannelBinder>, context: Option<Box<dyn RequestContext>>, fault: Message);
}

/// Sends the fault (as the reply to `context` if there is one, one-way otherwise) in the
///  background and then closes the binder, since nothing else will be sent on it.
pub struct SendFaultHelper {
    send_timeout: Duration,
    close_timeout: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl SendFaultHelper {
    pub fn new(send_timeout: Duration, close_timeout: Duration) -> SendFaultHelper {
        SendFaultHelper {
            send_timeout,
            close_timeout,
            pending: Default::default(),
        }
    }

    /// Waits for faults that are still being sent. Sends that are unfinished at the deadline are
    ///  abandoned.
    pub async fn close(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        let helper = TimeoutHelper::new(timeout);
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut remaining = pending.into_iter();

        while let Some(handle) = remaining.next() {
            let abort_handle = handle.abort_handle();
            let joined = helper.run("sending fault", async move {
                let _ = handle.await;
                Ok(())
            }).await;

            if let Err(e) = joined {
                abort_handle.abort();
                for h in remaining {
                    h.abort();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn abort(&self) {
        for handle in self.pending.lock().drain(..) {
            handle.abort();
        }
    }

    async fn send_fault(send_timeout: Duration, close_timeout: Duration, binder: Arc<dyn ReliableChannelBinder>, context: Option<Box<dyn RequestContext>>, fault: Message) {
        trace!("sending fault {:?}", fault.body);

        let sent = match &context {
            Some(context) => context.reply(fault, send_timeout).await,
            None => binder.send(fault, send_timeout).await,
        };
        if let Err(e) = sent {
            debug!("failed to send fault, aborting: {}", e);
            if let Some(context) = &context {
                context.abort();
            }
            binder.abort();
            return;
        }

        if let Err(e) = binder.close(close_timeout).await {
            debug!("failed to close binder after sending fault: {}", e);
            binder.abort();
        }
    }
}

impl FaultDispatcher for SendFaultHelper {
    fn send_fault_async(&self, binder: Arc<dyn ReliableChannelBinder>, context: Option<Box<dyn RequestContext>>, fault: Message) {
        let handle = tokio::spawn(Self::send_fault(self.send_timeout, self.close_timeout, binder, context, fault));

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }
}
