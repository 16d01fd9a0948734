//! The fault state machine shared by both ends of a reliable session.
//!
//! A session is owned by a channel. Faults flow in two directions: the session reports local
//!  and remote faults to its owner ([SessionOwner::fault]), and the owner calls back
//!  [ChannelReliableSession::on_faulted] / [ChannelReliableSession::abort] when the channel itself
//!  terminates. Exactly one transition out of `NotFaulted` ever happens; whoever wins it decides
//!  which terminal error surfaces and whether a fault is owed to the remote side.

pub mod client;
pub mod server;
pub mod verify;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::binder::{CommunicationState, ReliableChannelBinder, RequestContext};
use crate::config::ReliableSessionConfig;
use crate::fault::{ReliableSessionError, TerminationReason, WsrmFault};
use crate::fault_helper::FaultDispatcher;
use crate::message::{AcknowledgementHeader, Message};
use crate::message_info::WsrmMessageInfo;
use crate::sequence_range::SequenceRangeCollection;
use crate::sync::interruptible_timer::{InterruptibleTimer, TimerFuture};
use crate::unique_id::{SequenceIdentity, UniqueId};
use crate::version::{ClosedUnknownSequenceHandling, ReliableMessagingVersion};
use verify::VerifyContext;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionFaultState {
    NotFaulted,
    /// this side detected the fault and may owe the remote side a fault message
    LocallyFaulted,
    /// the remote side sent a fault, nothing is owed
    RemotelyFaulted,
    CleanedUp,
}

/// Who made the single transition out of `NotFaulted`
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOrigin {
    Local,
    Remote,
    /// the owning channel faulted or was aborted without going through the session
    Channel,
}

/// Client sessions send on the output sequence, server sessions receive on the input sequence.
///  The role decides which sequence identifies the session and how one-way traffic is verified.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionRole {
    Client,
    Server,
}

/// The channel a session belongs to
#[cfg_attr(test, automock)]
pub trait SessionOwner: Send + Sync + 'static {
    /// Transitions the channel to Faulted. The channel is expected to call
    ///  [ChannelReliableSession::on_faulted] in turn.
    fn fault(&self, error: Option<ReliableSessionError>);
    /// releases operations blocked in the channel's close
    fn unblock_close(&self);
    /// true once the channel is closed or faulted
    fn is_terminated(&self) -> bool;
}

/// What every session variant offers its channel
#[async_trait]
pub trait ReliableSession: Send + Sync {
    fn core(&self) -> &Arc<ChannelReliableSession>;

    async fn open(&self, timeout: Duration) -> Result<(), ReliableSessionError>;
    /// stops the session's timers, the handshake is the channel's business
    fn close(&self);
    fn abort(&self);
    fn on_faulted(&self);

    fn on_local_activity(&self);
    fn on_remote_activity(&self, fast_polling: bool);

    fn sequence_id(&self) -> Option<UniqueId> {
        self.core().sequence_id()
    }
}

struct FaultingState {
    fault_state: SessionFaultState,
    origin: Option<FaultOrigin>,
    terminating_fault: Option<Message>,
    reply_fault_context: Option<Box<dyn RequestContext>>,
    can_send_fault: bool,
    is_session_closed: bool,
    /// what the server acknowledges in the fault it sends when it gives up
    final_ranges: Option<SequenceRangeCollection>,
}

pub struct ChannelReliableSession {
    role: SessionRole,
    config: Arc<ReliableSessionConfig>,
    binder: Arc<dyn ReliableChannelBinder>,
    fault_dispatcher: Arc<dyn FaultDispatcher>,
    owner: Weak<dyn SessionOwner>,
    identity: Mutex<SequenceIdentity>,
    state: Mutex<FaultingState>,
    inactivity_timer: InterruptibleTimer,
}

impl ChannelReliableSession {
    pub fn new(
        role: SessionRole,
        config: Arc<ReliableSessionConfig>,
        binder: Arc<dyn ReliableChannelBinder>,
        fault_dispatcher: Arc<dyn FaultDispatcher>,
        owner: Weak<dyn SessionOwner>,
        identity: SequenceIdentity,
    ) -> Arc<ChannelReliableSession> {
        Arc::new_cyclic(|weak_self: &Weak<ChannelReliableSession>| {
            let weak_self = weak_self.clone();
            let inactivity_timer = InterruptibleTimer::new("inactivity", config.inactivity_timeout, Arc::new(move || -> TimerFuture {
                let session = weak_self.clone();
                Box::pin(async move {
                    if let Some(session) = session.upgrade() {
                        session.on_inactivity_elapsed();
                    }
                })
            }));

            ChannelReliableSession {
                role,
                config,
                binder,
                fault_dispatcher,
                owner,
                identity: Mutex::new(identity),
                state: Mutex::new(FaultingState {
                    fault_state: SessionFaultState::NotFaulted,
                    origin: None,
                    terminating_fault: None,
                    reply_fault_context: None,
                    can_send_fault: true,
                    is_session_closed: false,
                    final_ranges: None,
                }),
                inactivity_timer,
            }
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn version(&self) -> ReliableMessagingVersion {
        self.config.reliable_messaging_version
    }

    pub fn config(&self) -> &Arc<ReliableSessionConfig> {
        &self.config
    }

    pub fn binder(&self) -> &Arc<dyn ReliableChannelBinder> {
        &self.binder
    }

    pub fn input_id(&self) -> Option<UniqueId> {
        self.identity.lock().input_id()
    }

    pub fn output_id(&self) -> Option<UniqueId> {
        self.identity.lock().output_id()
    }

    /// The sequence the session is known by: the output sequence for clients, the input sequence
    ///  for servers
    pub fn sequence_id(&self) -> Option<UniqueId> {
        match self.role {
            SessionRole::Client => self.output_id(),
            SessionRole::Server => self.input_id(),
        }
    }

    pub(crate) fn set_output_id(&self, id: UniqueId) -> Result<(), ReliableSessionError> {
        self.identity.lock()
            .set_output_id(id)
            .map_err(|e| ReliableSessionError::InvalidState(e.to_string()))
    }

    pub fn fault_state(&self) -> SessionFaultState {
        self.state.lock().fault_state
    }

    pub fn fault_origin(&self) -> Option<FaultOrigin> {
        self.state.lock().origin
    }

    pub fn is_session_closed(&self) -> bool {
        self.state.lock().is_session_closed
    }

    /// Called when this side starts terminating its sequence. Afterwards an `UnknownSequence`
    ///  fault for one of our ids is an expected answer rather than a failure.
    pub fn close_session(&self) {
        self.state.lock().is_session_closed = true;
    }

    pub fn set_final_ranges(&self, ranges: SequenceRangeCollection) {
        self.state.lock().final_ranges = Some(ranges);
    }

    pub fn start_inactivity_timer(&self) {
        self.inactivity_timer.set();
    }

    /// Anything received from the remote side proves it is alive
    pub fn on_remote_activity(&self) {
        self.inactivity_timer.set();
    }

    fn fault_core(&self) {
        self.inactivity_timer.abort();
    }

    /// Stops the inactivity timer after a successful close. Faults reported afterwards are
    ///  ignored.
    pub fn close(&self) {
        self.inactivity_timer.abort();
        let mut state = self.state.lock();
        if state.fault_state == SessionFaultState::NotFaulted {
            state.fault_state = SessionFaultState::CleanedUp;
        }
    }

    fn owner_terminated(&self) -> Option<Arc<dyn SessionOwner>> {
        match self.owner.upgrade() {
            Some(owner) if !owner.is_terminated() => Some(owner),
            _ => None,
        }
    }

    /// This side detected a fault. `fault` is what the remote side is owed, if anything. It is
    ///  sent when the channel cleans up, as the reply to `context` if there is one.
    pub fn on_local_fault(&self, error: Option<ReliableSessionError>, fault: Option<WsrmFault>, context: Option<Box<dyn RequestContext>>) {
        let fault_message = fault.map(|f| f.to_message(self.version()));
        self.on_local_fault_message(error, fault_message, context);
    }

    pub fn on_local_fault_message(&self, error: Option<ReliableSessionError>, fault_message: Option<Message>, context: Option<Box<dyn RequestContext>>) {
        let owner = match self.owner_terminated() {
            Some(owner) => owner,
            None => {
                if let Some(context) = context {
                    context.abort();
                }
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if state.fault_state != SessionFaultState::NotFaulted {
                return;
            }
            state.fault_state = SessionFaultState::LocallyFaulted;
            state.origin = Some(FaultOrigin::Local);
            state.terminating_fault = fault_message;
            state.reply_fault_context = context;
        }

        match &error {
            Some(e) => warn!("session {:?} faulted locally: {}", self.sequence_id(), e),
            None => warn!("session {:?} faulted locally", self.sequence_id()),
        }
        self.fault_core();
        owner.fault(error);
        owner.unblock_close();
    }

    pub fn on_remote_fault(&self, error: Option<ReliableSessionError>) {
        let owner = match self.owner_terminated() {
            Some(owner) => owner,
            None => return,
        };

        {
            let mut state = self.state.lock();
            if state.fault_state != SessionFaultState::NotFaulted {
                return;
            }
            state.fault_state = SessionFaultState::RemotelyFaulted;
            state.origin = Some(FaultOrigin::Remote);
        }

        match &error {
            Some(e) => warn!("session {:?} faulted by the remote side: {}", self.sequence_id(), e),
            None => warn!("session {:?} faulted by the remote side", self.sequence_id()),
        }
        self.fault_core();
        owner.fault(error);
        owner.unblock_close();
    }

    /// An error no protocol rule accounts for. Nothing is sent to the remote side for it.
    pub fn on_unknown_exception(&self, error: ReliableSessionError) {
        self.state.lock().can_send_fault = false;
        self.on_local_fault(Some(error), None, None);
    }

    /// The owning channel faulted
    pub fn on_faulted(&self) {
        self.fault_core();
        self.cleanup();
    }

    pub fn abort(&self) {
        self.fault_core();
        self.cleanup();
    }

    /// Sends the owed fault (or a generic 'aborted' fault) if the binder can still carry it, and
    ///  releases the binder otherwise. Runs at most once.
    fn cleanup(&self) {
        let (send_fault, terminating_fault, context, final_ranges) = {
            let mut state = self.state.lock();
            if state.fault_state == SessionFaultState::CleanedUp {
                return;
            }
            if state.fault_state == SessionFaultState::NotFaulted {
                state.origin = Some(FaultOrigin::Channel);
            }
            let send_fault = state.can_send_fault && state.fault_state != SessionFaultState::RemotelyFaulted;
            state.fault_state = SessionFaultState::CleanedUp;
            (send_fault, state.terminating_fault.take(), state.reply_fault_context.take(), state.final_ranges.clone())
        };

        let binder_usable = self.binder.state() == CommunicationState::Opened
            && self.binder.connected()
            && (self.binder.can_send_asynchronously() || context.is_some());

        if send_fault && binder_usable {
            let fault = terminating_fault.or_else(|| {
                let identity = self.identity.lock().clone();
                let id = identity.input_id().or(identity.output_id())?;
                Some(WsrmFault::sequence_terminated(id, TerminationReason::Aborted, "the reliable session was aborted").to_message(self.version()))
            });

            if let Some(mut fault) = fault {
                if let (Some(ranges), Some(input_id)) = (final_ranges, self.input_id()) {
                    fault.set_acknowledgement(AcknowledgementHeader {
                        id: input_id,
                        ranges,
                        final_ack: self.version().supports_final_ack(),
                        buffer_remaining: None,
                    });
                }
                debug!("sending terminating fault for session {:?}", self.sequence_id());
                self.fault_dispatcher.send_fault_async(self.binder.clone(), context, fault);
                return;
            }
        }

        if let Some(context) = context {
            context.abort();
        }
        self.binder.abort();
    }

    fn on_inactivity_elapsed(&self) {
        let reason = format!("nothing was received from the remote endpoint for {:?}", self.config.inactivity_timeout);
        info!("session {:?}: {}", self.sequence_id(), reason);

        match self.sequence_id() {
            Some(id) => {
                let fault = WsrmFault::sequence_terminated(id, TerminationReason::InactivityTimeout, reason);
                self.on_local_fault(Some(fault.to_local_error()), Some(fault), None);
            }
            None => {
                self.on_local_fault(Some(ReliableSessionError::communication(reason, None)), None, None);
            }
        }
    }

    /// First look at every incoming message. Returns false if the message must not be processed
    ///  any further; the session has then faulted (or, for Feb2005, silently dropped an expected
    ///  `UnknownSequence` fault after close).
    pub fn process_info(&self, info: &WsrmMessageInfo, context: Option<Box<dyn RequestContext>>) -> bool {
        self.process_info_core(info, context, false).unwrap_or(false)
    }

    /// Like [Self::process_info], but returns the error instead of handing it to the owner. Used
    ///  while opening, where the caller reports the failure.
    pub fn try_process_info(&self, info: &WsrmMessageInfo, context: Option<Box<dyn RequestContext>>) -> Result<bool, ReliableSessionError> {
        self.process_info_core(info, context, true)
    }

    fn process_info_core(&self, info: &WsrmMessageInfo, context: Option<Box<dyn RequestContext>>, raise: bool) -> Result<bool, ReliableSessionError> {
        let error;

        if let Some(parsing_error) = &info.parsing_error {
            error = ReliableSessionError::Protocol(format!("the message with action {} could not be parsed: {}", info.action(), parsing_error));
            let fault = self.sequence_id()
                .map(|id| WsrmFault::protocol(id, format!("the message with action {} could not be parsed", info.action())));
            self.on_local_fault(Self::reported(raise, &error), fault, context);
        }
        else if let Some(fault) = &info.fault_reply {
            error = fault.to_local_error();
            self.on_local_fault(Self::reported(raise, &error), Some(fault.clone()), context);
        }
        else if let Some(header_fault) = info.wsrm_header_fault.as_ref().filter(|f| !self.owns(f.sequence_id)) {
            error = ReliableSessionError::Protocol(format!("received a {} fault for a sequence this session does not own", header_fault.code));
            self.on_local_fault(Self::reported(raise, &error), None, context);
        }
        else if let Some(fault) = &info.fault_info {
            let own_unknown_sequence = fault.is_unknown_sequence() && self.owns(fault.sequence_id);
            if own_unknown_sequence && self.is_session_closed() {
                return match self.version().closed_unknown_sequence_handling() {
                    ClosedUnknownSequenceHandling::Drop => {
                        debug!("dropping UnknownSequence fault for closed session {:?}", self.sequence_id());
                        Ok(false)
                    }
                    ClosedUnknownSequenceHandling::Continue => Ok(true),
                };
            }

            error = fault.to_remote_error();
            drop(context);
            self.on_remote_fault(Self::reported(raise, &error));
        }
        else {
            return Ok(true);
        }

        if raise {
            Err(error)
        }
        else {
            Ok(false)
        }
    }

    fn reported(raise: bool, error: &ReliableSessionError) -> Option<ReliableSessionError> {
        if raise {
            None
        }
        else {
            Some(error.clone())
        }
    }

    fn owns(&self, id: Option<UniqueId>) -> bool {
        match id {
            Some(id) => self.identity.lock().owns(id),
            None => false,
        }
    }

    fn verify_context(&self) -> VerifyContext {
        let identity = self.identity.lock();
        VerifyContext {
            version: self.version(),
            input_id: identity.input_id(),
            output_id: identity.output_id(),
        }
    }

    fn on_verify_fault(&self, fault: WsrmFault, context: Option<Box<dyn RequestContext>>) -> bool {
        debug!("message rejected by session {:?}: {}", self.sequence_id(), fault.reason);
        self.on_local_fault(Some(fault.to_local_error()), Some(fault), context);
        false
    }

    pub fn verify_duplex_protocol_elements(&self, info: &WsrmMessageInfo, context: Option<Box<dyn RequestContext>>) -> bool {
        match verify::verify_duplex(&self.verify_context(), info) {
            None => true,
            Some(fault) => self.on_verify_fault(fault, context),
        }
    }

    /// Verifies a message of a one-way session, as sender (client) or receiver (server)
    pub fn verify_simplex_protocol_elements(&self, info: &WsrmMessageInfo, context: Option<Box<dyn RequestContext>>) -> bool {
        let ctx = self.verify_context();
        let fault = match self.role {
            SessionRole::Client => verify::verify_simplex_sender(&ctx, info),
            SessionRole::Server => verify::verify_simplex_receiver(&ctx, info),
        };
        match fault {
            None => true,
            Some(fault) => self.on_verify_fault(fault, context),
        }
    }

    /// Shutdown requests must name the session's remote address as ReplyTo; faults the session
    ///  otherwise
    pub fn verify_wsrm_request(&self, info: &WsrmMessageInfo, context: Option<Box<dyn RequestContext>>) -> bool {
        let id = match self.input_id().or(self.output_id()) {
            Some(id) => id,
            None => return true,
        };
        match verify::verify_reply_to(id, info, &self.binder.remote_address()) {
            Ok(()) => true,
            Err(fault) => self.on_verify_fault(fault, context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{MockReliableChannelBinder, MockRequestContext};
    use crate::fault::FaultCode;
    use crate::fault_helper::MockFaultDispatcher;
    use crate::message;
    use crate::sequence_range::SequenceRange;
    use crate::test_util::session::TrackingSessionOwner;
    use crate::version::ReliableMessagingVersion::*;
    use rstest::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;

    fn id(raw: u128) -> UniqueId {
        UniqueId::from_raw(raw)
    }

    fn usable_binder() -> MockReliableChannelBinder {
        let mut binder = MockReliableChannelBinder::new();
        binder.expect_state().return_const(CommunicationState::Opened);
        binder.expect_connected().return_const(true);
        binder.expect_can_send_asynchronously().return_const(true);
        binder.expect_remote_address().return_const("urn:remote".to_string());
        binder
    }

    fn server_session(version: ReliableMessagingVersion, binder: MockReliableChannelBinder, dispatcher: MockFaultDispatcher, owner: &Arc<TrackingSessionOwner>) -> Arc<ChannelReliableSession> {
        let weak_owner: Weak<TrackingSessionOwner> = Arc::downgrade(owner);
        let session = ChannelReliableSession::new(
            SessionRole::Server,
            Arc::new(ReliableSessionConfig::new(version)),
            Arc::new(binder),
            Arc::new(dispatcher),
            weak_owner,
            SequenceIdentity::new(version, Some(id(1)), Some(id(2))),
        );
        owner.attach(&session);
        session
    }

    #[test]
    fn test_local_fault_sends_owed_fault() {
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async()
            .withf(|_, ctx, fault| ctx.is_none() && matches!(&fault.body, crate::message::MessageBody::Fault(f) if f.code == FaultCode::UnknownSequence))
            .times(1)
            .return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);

        session.on_local_fault(Some(ReliableSessionError::Protocol("x".into())), Some(WsrmFault::unknown_sequence(id(9))), None);

        assert_eq!(session.fault_state(), SessionFaultState::CleanedUp);
        assert_eq!(session.fault_origin(), Some(FaultOrigin::Local));
        assert_eq!(owner.fault_count(), 1);
        assert!(matches!(owner.last_error(), Some(ReliableSessionError::Protocol(_))));

        // the second fault loses
        session.on_remote_fault(None);
        session.on_local_fault(None, None, None);
        assert_eq!(owner.fault_count(), 1);
    }

    #[test]
    fn test_fault_after_close_is_ignored() {
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async().never();
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);

        session.close();
        session.on_local_fault(Some(ReliableSessionError::Protocol("late".into())), Some(WsrmFault::unknown_sequence(id(9))), None);
        session.on_remote_fault(None);

        assert_eq!(session.fault_state(), SessionFaultState::CleanedUp);
        assert_eq!(session.fault_origin(), None);
        assert_eq!(owner.fault_count(), 0);
    }

    #[test]
    fn test_remote_fault_sends_nothing() {
        let mut binder = usable_binder();
        binder.expect_abort().times(1).return_const(());
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async().never();
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, binder, dispatcher, &owner);

        session.on_remote_fault(Some(ReliableSessionError::RemoteFault("gone".into())));
        assert_eq!(session.fault_origin(), Some(FaultOrigin::Remote));
        assert_eq!(session.fault_state(), SessionFaultState::CleanedUp);
    }

    #[test]
    fn test_abort_sends_aborted_fault_with_final_ranges() {
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async()
            .withf(|_, _, fault| {
                let terminated = matches!(&fault.body, crate::message::MessageBody::Fault(f)
                    if f.code == FaultCode::SequenceTerminated(TerminationReason::Aborted) && f.sequence_id == Some(UniqueId::from_raw(1)));
                let acked = fault.acknowledgement_header().map(|a| a.final_ack && a.ranges.highest() == 4).unwrap_or(false);
                terminated && acked
            })
            .times(1)
            .return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);
        session.set_final_ranges(SequenceRangeCollection::from_wire(vec![SequenceRange::new(1, 4).unwrap()]).unwrap());

        session.abort();
        session.abort();
        assert_eq!(session.fault_origin(), Some(FaultOrigin::Channel));
        assert_eq!(owner.fault_count(), 0);
    }

    #[test]
    fn test_unusable_binder_is_aborted_with_context() {
        let mut binder = MockReliableChannelBinder::new();
        binder.expect_state().return_const(CommunicationState::Faulted);
        binder.expect_abort().times(1).return_const(());
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async().never();
        let mut context = MockRequestContext::new();
        context.expect_abort().times(1).return_const(());

        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, binder, dispatcher, &owner);
        session.on_local_fault(None, Some(WsrmFault::protocol(id(1), "bad")), Some(Box::new(context)));
    }

    #[test]
    fn test_unknown_exception_sends_no_fault() {
        let mut binder = usable_binder();
        binder.expect_abort().times(1).return_const(());
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async().never();
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, binder, dispatcher, &owner);

        session.on_unknown_exception(ReliableSessionError::InvalidState("surprise".into()));
        assert_eq!(owner.fault_count(), 1);
    }

    #[test]
    fn test_fault_after_owner_terminated_aborts_context() {
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), MockFaultDispatcher::new(), &owner);
        owner.set_terminated();

        let mut context = MockRequestContext::new();
        context.expect_abort().times(1).return_const(());
        session.on_local_fault(None, None, Some(Box::new(context)));
        assert_eq!(session.fault_state(), SessionFaultState::NotFaulted);
        assert_eq!(owner.fault_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_winner_under_concurrency() {
        for _ in 0..20 {
            let sent = Arc::new(AtomicUsize::new(0));
            let mut binder = usable_binder();
            binder.expect_abort().return_const(());
            let mut dispatcher = MockFaultDispatcher::new();
            let s = sent.clone();
            dispatcher.expect_send_fault_async()
                .returning(move |_, _, _| { s.fetch_add(1, Ordering::SeqCst); });

            let owner = TrackingSessionOwner::new();
            let session = server_session(Wsrm11, binder, dispatcher, &owner);

            let mut tasks = Vec::new();
            for i in 0..3 {
                let session = session.clone();
                tasks.push(tokio::spawn(async move {
                    match i {
                        0 => session.on_local_fault(None, Some(WsrmFault::protocol(UniqueId::from_raw(1), "local")), None),
                        1 => session.on_remote_fault(None),
                        _ => session.on_faulted(),
                    }
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }
            session.on_faulted();

            let expected_owner_faults = match session.fault_origin() {
                Some(FaultOrigin::Local) | Some(FaultOrigin::Remote) => 1,
                Some(FaultOrigin::Channel) => 0,
                None => panic!("nobody won"),
            };
            assert_eq!(owner.fault_count(), expected_owner_faults);
            assert!(sent.load(Ordering::SeqCst) <= 1);
            assert_eq!(session.fault_state(), SessionFaultState::CleanedUp);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_faults_session() {
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async()
            .withf(|_, _, fault| matches!(&fault.body, crate::message::MessageBody::Fault(f)
                if f.code == FaultCode::SequenceTerminated(TerminationReason::InactivityTimeout)))
            .times(1)
            .return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);
        let inactivity = session.config().inactivity_timeout;

        session.start_inactivity_timer();
        time::sleep(inactivity / 2).await;
        session.on_remote_activity();
        time::sleep(inactivity / 2 + Duration::from_secs(1)).await;
        assert_eq!(owner.fault_count(), 0);

        time::sleep(inactivity).await;
        assert_eq!(owner.fault_count(), 1);
        assert!(matches!(owner.last_error(), Some(ReliableSessionError::Communication { .. })));
    }

    #[rstest]
    #[case::feb_drops(WsrmFeb2005, false)]
    #[case::v11_continues(Wsrm11, true)]
    fn test_unknown_sequence_after_close(#[case] version: ReliableMessagingVersion, #[case] expected: bool) {
        let owner = TrackingSessionOwner::new();
        let session = server_session(version, usable_binder(), MockFaultDispatcher::new(), &owner);
        session.close_session();

        let info = WsrmMessageInfo::get(version, WsrmFault::unknown_sequence(id(2)).to_message(version));
        assert_eq!(session.process_info(&info, None), expected);
        assert_eq!(session.fault_state(), SessionFaultState::NotFaulted);
    }

    #[test]
    fn test_unknown_sequence_before_close_is_remote_fault() {
        let mut binder = usable_binder();
        binder.expect_abort().return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, binder, MockFaultDispatcher::new(), &owner);

        let info = WsrmMessageInfo::get(Wsrm11, WsrmFault::unknown_sequence(id(2)).to_message(Wsrm11));
        assert!(!session.process_info(&info, None));
        assert_eq!(session.fault_origin(), Some(FaultOrigin::Remote));
        assert!(matches!(owner.last_error(), Some(ReliableSessionError::RemoteFault(_))));
    }

    #[test]
    fn test_fault_for_foreign_sequence_is_protocol_violation() {
        // nothing specific is owed, the remote side learns of the abort
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async()
            .withf(|_, _, fault| matches!(&fault.body, crate::message::MessageBody::Fault(f)
                if f.code == FaultCode::SequenceTerminated(TerminationReason::Aborted)))
            .times(1)
            .return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);

        let info = WsrmMessageInfo::get(Wsrm11, WsrmFault::unknown_sequence(id(77)).to_message(Wsrm11));
        let result = session.try_process_info(&info, None);
        assert!(matches!(result, Err(ReliableSessionError::Protocol(_))));
        assert_eq!(session.fault_origin(), Some(FaultOrigin::Local));
        // raising mode leaves reporting to the caller
        assert_eq!(owner.fault_count(), 1);
        assert!(owner.last_error().is_none());
    }

    #[test]
    fn test_parse_error_faults_with_protocol_fault() {
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async()
            .withf(|_, _, fault| matches!(&fault.body, crate::message::MessageBody::Fault(f)
                if f.code == FaultCode::SequenceTerminated(TerminationReason::Protocol) && f.sequence_id == Some(UniqueId::from_raw(1))))
            .times(1)
            .return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);

        let mut msg = Message::application("urn:app", bytes::Bytes::new());
        msg.set_sequence(id(1), 0, false);
        assert!(!session.process_info(&WsrmMessageInfo::get(Wsrm11, msg), None));
    }

    #[test]
    fn test_verify_simplex_receiver_faults_on_ack() {
        let mut dispatcher = MockFaultDispatcher::new();
        dispatcher.expect_send_fault_async().times(1).return_const(());
        let owner = TrackingSessionOwner::new();
        let session = server_session(Wsrm11, usable_binder(), dispatcher, &owner);

        let ok = WsrmMessageInfo::get(Wsrm11, message::ack_requested(Wsrm11, id(1)));
        assert!(session.verify_simplex_protocol_elements(&ok, None));

        let ack = message::acknowledgement(Wsrm11, AcknowledgementHeader {
            id: id(1),
            ranges: SequenceRangeCollection::empty(),
            final_ack: false,
            buffer_remaining: None,
        });
        assert!(!session.verify_simplex_protocol_elements(&WsrmMessageInfo::get(Wsrm11, ack), None));
        assert_eq!(owner.fault_count(), 1);
    }
}
