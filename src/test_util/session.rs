use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::fault::ReliableSessionError;
use crate::session::{ChannelReliableSession, SessionOwner};

/// Stands in for a channel: records the faults it is told about and, like a real channel, calls
///  back the session's `on_faulted`.
#[derive(Default)]
pub struct TrackingSessionOwner {
    session: Mutex<Weak<ChannelReliableSession>>,
    faults: Mutex<Vec<Option<ReliableSessionError>>>,
    unblock_count: AtomicUsize,
    terminated: AtomicBool,
}

impl TrackingSessionOwner {
    pub fn new() -> Arc<TrackingSessionOwner> {
        Default::default()
    }

    pub fn attach(&self, session: &Arc<ChannelReliableSession>) {
        *self.session.lock() = Arc::downgrade(session);
    }

    pub fn fault_count(&self) -> usize {
        self.faults.lock().len()
    }

    /// the error passed with the most recent fault
    pub fn last_error(&self) -> Option<ReliableSessionError> {
        self.faults.lock()
            .last()
            .cloned()
            .flatten()
    }

    pub fn unblock_count(&self) -> usize {
        self.unblock_count.load(Ordering::SeqCst)
    }

    pub fn set_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

impl SessionOwner for TrackingSessionOwner {
    fn fault(&self, error: Option<ReliableSessionError>) {
        self.faults.lock().push(error);
        self.terminated.store(true, Ordering::SeqCst);

        let session = self.session.lock().upgrade();
        if let Some(session) = session {
            session.on_faulted();
        }
    }

    fn unblock_close(&self) {
        self.unblock_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
