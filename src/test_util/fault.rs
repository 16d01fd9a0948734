use std::sync::Arc;

use parking_lot::Mutex;

use crate::binder::{ReliableChannelBinder, RequestContext};
use crate::fault_helper::FaultDispatcher;
use crate::message::Message;

/// Records terminating faults instead of sending them
#[derive(Default)]
pub struct TrackingFaultDispatcher {
    sent: Mutex<Vec<(Message, bool)>>,
}

impl TrackingFaultDispatcher {
    pub fn new() -> Arc<TrackingFaultDispatcher> {
        Default::default()
    }

    /// returns the recorded faults (and whether each was a reply), clearing the internal buffer
    pub fn sent_faults(&self) -> Vec<(Message, bool)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn assert_no_fault_sent(&self) {
        let sent = self.sent.lock();
        assert!(sent.is_empty(), "unexpected faults: {:?}", *sent);
    }
}

impl FaultDispatcher for TrackingFaultDispatcher {
    fn send_fault_async(&self, binder: Arc<dyn ReliableChannelBinder>, context: Option<Box<dyn RequestContext>>, fault: Message) {
        self.sent.lock().push((fault, context.is_some()));
        binder.abort();
    }
}
