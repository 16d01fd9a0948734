use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::binder::ReliableChannelBinder;
use crate::config::ReliableSessionConfig;
use crate::fault::ReliableSessionError;
use crate::fault_helper::FaultDispatcher;
use crate::session::{ChannelReliableSession, ReliableSession, SessionOwner, SessionRole};
use crate::unique_id::{SequenceIdentity, UniqueId};

/// The accepting side of a session. The sequence was created by the listener before the
///  session exists, so opening only starts the inactivity timer.
pub struct ServerReliableSession {
    core: Arc<ChannelReliableSession>,
}

impl ServerReliableSession {
    /// `output_id` is the identifier of an accepted offer, for duplex sessions
    pub fn new(
        config: Arc<ReliableSessionConfig>,
        binder: Arc<dyn ReliableChannelBinder>,
        fault_dispatcher: Arc<dyn FaultDispatcher>,
        owner: Weak<dyn SessionOwner>,
        input_id: UniqueId,
        output_id: Option<UniqueId>,
    ) -> ServerReliableSession {
        let identity = SequenceIdentity::new(config.reliable_messaging_version, Some(input_id), output_id);
        ServerReliableSession {
            core: ChannelReliableSession::new(SessionRole::Server, config, binder, fault_dispatcher, owner, identity),
        }
    }
}

#[async_trait]
impl ReliableSession for ServerReliableSession {
    fn core(&self) -> &Arc<ChannelReliableSession> {
        &self.core
    }

    async fn open(&self, _timeout: Duration) -> Result<(), ReliableSessionError> {
        self.core.start_inactivity_timer();
        Ok(())
    }

    fn close(&self) {
        self.core.close();
    }

    fn abort(&self) {
        self.core.abort();
    }

    fn on_faulted(&self) {
        self.core.on_faulted();
    }

    fn on_local_activity(&self) {}

    fn on_remote_activity(&self, _fast_polling: bool) {
        self.core.on_remote_activity();
    }
}
