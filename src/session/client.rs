//! The initiating side of a session: negotiates the sequence with CreateSequence and, over
//!  request-reply transports, polls the remote side so it has a way to send back.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::binder::ReliableChannelBinder;
use crate::config::{ReliableSessionConfig, UNKNOWN_INITIATION_TIME};
use crate::fault::{ReliableSessionError, WsrmFault};
use crate::fault_helper::FaultDispatcher;
use crate::message::{self, Message, MessageBody, WsrmHeader};
use crate::message_info::WsrmMessageInfo;
use crate::requestor::{ReliableRequestor, RequestorKind};
use crate::session::{ChannelReliableSession, ReliableSession, SessionFaultState, SessionOwner, SessionRole};
use crate::sync::interruptible_timer::{InterruptibleTimer, TimerCallback, TimerFuture};
use crate::unique_id::{SequenceIdentity, UniqueId};
use crate::version::ReliableMessagingVersion;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollingMode {
    /// nothing is pending, poll just often enough to keep the session alive
    Idle,
    /// the last poll found nothing, the next one is a keep-alive
    KeepAlive,
    /// the remote side has more to send
    FastPolling,
    NotPolling,
}

pub struct ClientReliableSession {
    core: Arc<ChannelReliableSession>,
    create_sequence_requestor: Mutex<Option<ReliableRequestor>>,
    create_sequence_message_id: Option<UniqueId>,
    polling_mode: Mutex<PollingMode>,
    polling_timer: InterruptibleTimer,
    polling_callback: Mutex<Option<TimerCallback>>,
    initiation_time: Mutex<Option<Duration>>,
}

impl ClientReliableSession {
    /// `offer` is the identifier of the input sequence this side offers, for duplex sessions
    pub fn new(
        config: Arc<ReliableSessionConfig>,
        binder: Arc<dyn ReliableChannelBinder>,
        fault_dispatcher: Arc<dyn FaultDispatcher>,
        owner: Weak<dyn SessionOwner>,
        requestor_kind: RequestorKind,
        offer: Option<UniqueId>,
    ) -> Arc<ClientReliableSession> {
        let version = config.reliable_messaging_version;
        let mut request = message::create_sequence(version, binder.local_address(), offer, config.ordered);
        if config.secure_conversation && version == ReliableMessagingVersion::Wsrm11 {
            request = request.with_header(WsrmHeader::UsesSequenceStr);
        }
        let requestor = ReliableRequestor::for_create_sequence(requestor_kind, binder.clone(), request);
        let create_sequence_message_id = requestor.message_id();
        let idle_interval = config.inactivity_timeout / 2;

        let identity = SequenceIdentity::new(version, offer, None);
        let core = ChannelReliableSession::new(SessionRole::Client, config, binder, fault_dispatcher, owner, identity);

        Arc::new_cyclic(|weak_self: &Weak<ClientReliableSession>| {
            let weak_self = weak_self.clone();
            let polling_timer = InterruptibleTimer::new("polling", idle_interval, Arc::new(move || -> TimerFuture {
                let session = weak_self.clone();
                Box::pin(async move {
                    if let Some(session) = session.upgrade() {
                        session.on_polling_timer_elapsed().await;
                    }
                })
            }));

            ClientReliableSession {
                core,
                create_sequence_requestor: Mutex::new(Some(requestor)),
                create_sequence_message_id,
                polling_mode: Mutex::new(PollingMode::Idle),
                polling_timer,
                polling_callback: Mutex::new(None),
                initiation_time: Mutex::new(None),
            }
        })
    }

    /// Enables polling. The callback sends one poll; it must be registered before `open`.
    pub fn set_polling_callback(&self, callback: TimerCallback) {
        *self.polling_callback.lock() = Some(callback);
    }

    fn is_polling_enabled(&self) -> bool {
        self.polling_callback.lock().is_some()
    }

    pub fn polling_mode(&self) -> PollingMode {
        *self.polling_mode.lock()
    }

    /// How long the CreateSequence exchange took, or an estimate before it completed
    pub fn initiation_time(&self) -> Duration {
        self.initiation_time.lock().unwrap_or(UNKNOWN_INITIATION_TIME)
    }

    fn polling_interval(&self, mode: PollingMode) -> Option<Duration> {
        let config = self.core.config();
        match mode {
            PollingMode::Idle => Some(config.inactivity_timeout / 2),
            PollingMode::KeepAlive => Some(config.keep_alive_interval()),
            PollingMode::FastPolling => Some(config.keep_alive_interval().min(config.default_send_timeout / 2)),
            PollingMode::NotPolling => None,
        }
    }

    fn schedule_poll(&self, mode: PollingMode) {
        if !self.is_polling_enabled() {
            return;
        }
        if let Some(interval) = self.polling_interval(mode) {
            self.polling_timer.set_interval(interval);
        }
    }

    /// Suspends polling while a real request occupies the channel
    pub fn stop_polling(&self) {
        *self.polling_mode.lock() = PollingMode::NotPolling;
        self.polling_timer.cancel();
    }

    pub fn resume_polling(&self, fast_polling: bool) -> Result<(), ReliableSessionError> {
        let mode = {
            let mut mode = self.polling_mode.lock();
            if *mode != PollingMode::NotPolling {
                return Err(ReliableSessionError::InvalidState(format!("polling is not suspended but {:?}", *mode)));
            }
            *mode = if fast_polling { PollingMode::FastPolling } else { PollingMode::Idle };
            *mode
        };
        self.schedule_poll(mode);
        Ok(())
    }

    async fn on_polling_timer_elapsed(&self) {
        if self.core.fault_state() != SessionFaultState::NotFaulted {
            return;
        }
        {
            let mut mode = self.polling_mode.lock();
            match *mode {
                PollingMode::NotPolling => return,
                PollingMode::Idle => *mode = PollingMode::KeepAlive,
                _ => {}
            }
        }

        let callback = self.polling_callback.lock().clone();
        if let Some(callback) = callback {
            trace!("polling session {:?}", self.core.sequence_id());
            callback().await;
        }

        let mode = self.polling_mode();
        self.schedule_poll(mode);
    }

    fn process_create_sequence_response(&self, response: Message, started: Instant) -> Result<(), ReliableSessionError> {
        let version = self.core.version();
        if let MessageBody::Fault(body) = &response.body {
            return Err(WsrmFault::from_body(body).to_remote_error());
        }

        let info = WsrmMessageInfo::get(version, response);
        if let Some(parsing_error) = &info.parsing_error {
            return Err(ReliableSessionError::Protocol(format!("the CreateSequence reply could not be parsed: {}", parsing_error)));
        }
        if !self.core.try_process_info(&info, None)? {
            return Err(ReliableSessionError::Protocol(format!("the CreateSequence reply {} was rejected", info.action())));
        }

        let response = match &info.create_sequence_response_info {
            Some(response) => response,
            None => return Err(ReliableSessionError::Protocol(format!("expected CreateSequenceResponse, received {}", info.action()))),
        };

        let offered = self.core.input_id().is_some();
        let reason = if response.relates_to != self.create_sequence_message_id {
            Some("the CreateSequenceResponse does not relate to the CreateSequence request".to_string())
        }
        else if offered && response.accept_acks_to.is_none() {
            Some("the CreateSequenceResponse did not accept the offered sequence".to_string())
        }
        else if !offered && response.accept_acks_to.is_some() {
            Some("the CreateSequenceResponse accepted an offer that was not made".to_string())
        }
        else {
            match &response.accept_acks_to {
                Some(acks_to) if *acks_to != self.core.binder().remote_address() => {
                    Some(format!("the accepted offer's AcksTo {} differs from the remote address {}", acks_to, self.core.binder().remote_address()))
                }
                _ => None,
            }
        };

        if let Some(reason) = reason {
            let fault = WsrmFault::protocol(response.identifier, reason.clone());
            self.core.on_local_fault(None, Some(fault), None);
            return Err(ReliableSessionError::Protocol(reason));
        }

        *self.initiation_time.lock() = Some(started.elapsed());
        self.core.set_output_id(response.identifier)?;
        info!("created sequence {} (offered {:?})", response.identifier, self.core.input_id());

        let mode = self.polling_mode();
        self.schedule_poll(mode);
        self.core.start_inactivity_timer();
        Ok(())
    }
}

#[async_trait]
impl ReliableSession for ClientReliableSession {
    fn core(&self) -> &Arc<ChannelReliableSession> {
        &self.core
    }

    async fn open(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        let requestor = self.create_sequence_requestor.lock()
            .take()
            .ok_or_else(|| ReliableSessionError::InvalidState("the session was already opened".to_string()))?;

        let started = Instant::now();
        let response = requestor.request(timeout).await?
            .ok_or_else(|| ReliableSessionError::Protocol("CreateSequence was answered without a message".to_string()))?;
        self.process_create_sequence_response(response, started)
    }

    fn close(&self) {
        self.polling_timer.abort();
        self.core.close();
    }

    fn abort(&self) {
        self.polling_timer.abort();
        self.core.abort();
    }

    fn on_faulted(&self) {
        self.polling_timer.abort();
        self.core.on_faulted();
    }

    fn on_local_activity(&self) {
        {
            let mut mode = self.polling_mode.lock();
            if *mode != PollingMode::KeepAlive {
                return;
            }
            *mode = PollingMode::Idle;
        }
        self.schedule_poll(PollingMode::Idle);
    }

    fn on_remote_activity(&self, fast_polling: bool) {
        self.core.on_remote_activity();

        let mode = {
            let mut mode = self.polling_mode.lock();
            if *mode == PollingMode::NotPolling {
                return;
            }
            *mode = if fast_polling { PollingMode::FastPolling } else { PollingMode::Idle };
            *mode
        };
        debug!("remote activity on session {:?}, polling {:?}", self.core.sequence_id(), mode);
        self.schedule_poll(mode);
    }
}
