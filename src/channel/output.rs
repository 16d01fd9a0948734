//! The sending side of a reliable session.
//!
//! Two shapes exist. Over a duplex binder, messages go out one-way and a receive loop picks up
//!  acknowledgements and shutdown responses. Over a request-reply binder, every message is a
//!  request whose reply carries the acknowledgement, and the session polls with AckRequested
//!  so the remote side always has a reply to answer on.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::binder::{send_masked, CommunicationState, MaskingMode, ReliableChannelBinder};
use crate::channel::{spawn_receive_loop, Lifecycle, ReceiveTarget};
use crate::config::ReliableSessionConfig;
use crate::connection::output::{MessageAttemptInfo, OutputConnectionHandler, ReliableOutputConnection};
use crate::fault::{ErrorCause, ReliableSessionError, WsrmFault};
use crate::fault_helper::FaultDispatcher;
use crate::message::{self, Message};
use crate::message_info::WsrmMessageInfo;
use crate::requestor::{ReliableRequestor, RequestorKind};
use crate::session::client::ClientReliableSession;
use crate::session::{verify, ReliableSession, SessionOwner};
use crate::sync::interruptible_timer::TimerFuture;
use crate::sync::wait_object::InterruptibleWaitObject;
use crate::timeout_helper::TimeoutHelper;
use crate::unique_id::UniqueId;
use crate::version::ReliableMessagingVersion;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputChannelShape {
    /// one-way sends, replies arrive on the binder's receive side
    Duplex,
    /// every send is a request, the reply carries what the remote side has to say
    Request,
}

type RequestorSlot = Mutex<Option<Arc<ReliableRequestor>>>;

pub struct ReliableOutputSessionChannel {
    shape: OutputChannelShape,
    config: Arc<ReliableSessionConfig>,
    binder: Arc<dyn ReliableChannelBinder>,
    session: Arc<ClientReliableSession>,
    lifecycle: Lifecycle,
    weak_self: Weak<ReliableOutputSessionChannel>,
    connection: Mutex<Option<Arc<ReliableOutputConnection>>>,
    close_requestor: RequestorSlot,
    terminate_requestor: RequestorSlot,
    /// request shape: set once the replies prove that everything was acknowledged
    shutdown_handle: InterruptibleWaitObject,
    /// the last recoverable transport error of a final retry
    max_retry_count_error: Mutex<Option<ReliableSessionError>>,
    requests_in_flight: Mutex<usize>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableOutputSessionChannel {
    pub fn new(
        shape: OutputChannelShape,
        config: Arc<ReliableSessionConfig>,
        binder: Arc<dyn ReliableChannelBinder>,
        fault_dispatcher: Arc<dyn FaultDispatcher>,
    ) -> Arc<ReliableOutputSessionChannel> {
        Arc::new_cyclic(|weak_self: &Weak<ReliableOutputSessionChannel>| {
            let owner: Weak<dyn SessionOwner> = weak_self.clone();
            let requestor_kind = match shape {
                OutputChannelShape::Duplex => RequestorKind::SendReceive,
                OutputChannelShape::Request => RequestorKind::Request,
            };
            let session = ClientReliableSession::new(config.clone(), binder.clone(), fault_dispatcher, owner, requestor_kind, None);

            if shape == OutputChannelShape::Request {
                let weak_channel = weak_self.clone();
                session.set_polling_callback(Arc::new(move || -> TimerFuture {
                    let channel = weak_channel.clone();
                    Box::pin(async move {
                        if let Some(channel) = channel.upgrade() {
                            channel.poll().await;
                        }
                    })
                }));
            }

            ReliableOutputSessionChannel {
                shape,
                config,
                binder,
                session,
                lifecycle: Lifecycle::new(),
                weak_self: weak_self.clone(),
                connection: Mutex::new(None),
                close_requestor: Mutex::new(None),
                terminate_requestor: Mutex::new(None),
                shutdown_handle: InterruptibleWaitObject::new(false),
                max_retry_count_error: Mutex::new(None),
                requests_in_flight: Mutex::new(0),
                receive_task: Mutex::new(None),
            }
        })
    }

    pub fn shape(&self) -> OutputChannelShape {
        self.shape
    }

    pub fn session(&self) -> &Arc<ClientReliableSession> {
        &self.session
    }

    pub fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    pub fn sequence_id(&self) -> Option<UniqueId> {
        self.session.sequence_id()
    }

    /// available once the channel is open
    pub fn connection(&self) -> Option<Arc<ReliableOutputConnection>> {
        self.connection.lock().clone()
    }

    fn version(&self) -> ReliableMessagingVersion {
        self.config.reliable_messaging_version
    }

    fn open_connection(&self) -> Result<Arc<ReliableOutputConnection>, ReliableSessionError> {
        self.connection()
            .ok_or_else(|| ReliableSessionError::InvalidState("the channel was never opened".to_string()))
    }

    /// Opens the binder and creates the sequence
    pub async fn open(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        self.lifecycle.transition(CommunicationState::Created, CommunicationState::Opening)?;
        let helper = TimeoutHelper::new(timeout);

        if let Err(e) = self.open_core(&helper).await {
            debug!("opening the output channel failed: {}", e);
            self.lifecycle.fault(e.clone());
            self.session.abort();
            return Err(e);
        }

        self.lifecycle.transition(CommunicationState::Opening, CommunicationState::Opened)?;
        info!("output channel opened on sequence {:?}", self.sequence_id());
        Ok(())
    }

    async fn open_core(&self, helper: &TimeoutHelper) -> Result<(), ReliableSessionError> {
        self.binder.open(helper.remaining()).await
            .map_err(ReliableSessionError::transport)?;
        self.session.open(helper.remaining()).await?;

        let id = self.sequence_id()
            .ok_or_else(|| ReliableSessionError::InvalidState("opening did not create a sequence".to_string()))?;
        let handler: Weak<dyn OutputConnectionHandler> = self.weak_self.clone();
        *self.connection.lock() = Some(ReliableOutputConnection::new(id, self.config.clone(), handler));

        if self.shape == OutputChannelShape::Duplex {
            *self.receive_task.lock() = Some(spawn_receive_loop(self.weak_self.clone()));
        }
        Ok(())
    }

    /// Returns once the message was handed to the transport. Delivery is confirmed later by
    ///  acknowledgements, and `close` waits for all of them.
    pub async fn send(&self, message: Message, timeout: Duration) -> Result<(), ReliableSessionError> {
        self.lifecycle.ensure_opened()?;
        let connection = self.open_connection()?;

        if connection.add_message(message, timeout).await? {
            Ok(())
        }
        else {
            Err(self.lifecycle.terminal_error().unwrap_or(ReliableSessionError::Closed))
        }
    }

    /// Waits for all messages to be acknowledged and runs the shutdown handshake. On failure the
    ///  channel is aborted and the first error is returned.
    pub async fn close(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        match self.lifecycle.state() {
            CommunicationState::Closed => return Ok(()),
            CommunicationState::Created => {
                self.lifecycle.close();
                return Ok(());
            }
            _ => {}
        }
        self.lifecycle.transition(CommunicationState::Opened, CommunicationState::Closing)?;
        let helper = TimeoutHelper::new(timeout);

        if let Err(e) = self.close_handshake(&helper).await {
            let error = self.lifecycle.terminal_error().unwrap_or(e);
            warn!("closing sequence {:?} failed: {}", self.sequence_id(), error);
            self.abort();
            return Err(error);
        }

        self.session.close();
        self.stop_receive_loop();
        let closed = self.binder.close(helper.remaining()).await;
        self.lifecycle.close();
        if let Err(e) = closed {
            self.binder.abort();
            return Err(ReliableSessionError::transport(e));
        }
        info!("output channel on sequence {:?} closed", self.sequence_id());
        Ok(())
    }

    async fn close_handshake(&self, helper: &TimeoutHelper) -> Result<(), ReliableSessionError> {
        let connection = self.open_connection()?;
        let version = self.version();
        let id = connection.id();

        debug!("sequence {}: waiting for outstanding acknowledgements", id);
        connection.close(helper.remaining()).await?;
        if self.shape == OutputChannelShape::Request {
            if connection.check_for_termination() {
                self.shutdown_handle.set();
            }
            if !self.shutdown_handle.wait(helper.remaining()).await? {
                return Err(ReliableSessionError::Timeout(format!("the replies on sequence {} never acknowledged every message", id)));
            }
        }
        let last = connection.last();

        if version.supports_close_sequence() {
            debug!("sequence {}: CloseSequence, last message {}", id, last);
            let requestor = self.install_requestor(&self.close_requestor, "CloseSequence", message::close_sequence(version, id, last))?;
            let info = self.shutdown_exchange(&requestor, helper).await?;
            verify::verify_close_sequence_response(id, requestor.message_id(), &info, last)
                .map_err(|fault| self.fault_with(fault))?;
        }

        self.session.core().close_session();
        let terminate = message::terminate_sequence(version, id, Some(last));
        debug!("sequence {}: TerminateSequence", id);

        if version.terminate_is_request_reply() {
            let requestor = self.install_requestor(&self.terminate_requestor, "TerminateSequence", terminate)?;
            let info = self.shutdown_exchange(&requestor, helper).await?;
            verify::verify_terminate_sequence_response(id, requestor.message_id(), &info, last)
                .map_err(|fault| self.fault_with(fault))?;
        }
        else {
            self.session.on_local_activity();
            if let Err(e) = self.transmit(terminate, helper.remaining()).await {
                if !self.binder.is_handleable(&e) {
                    return Err(ReliableSessionError::transport(e));
                }
                debug!("sequence {}: TerminateSequence was lost: {}", id, e);
            }
        }
        Ok(())
    }

    fn install_requestor(&self, slot: &RequestorSlot, name: &'static str, request: Message) -> Result<Arc<ReliableRequestor>, ReliableSessionError> {
        let kind = match self.shape {
            OutputChannelShape::Duplex => RequestorKind::SendWait,
            OutputChannelShape::Request => RequestorKind::Request,
        };
        let requestor = Arc::new(ReliableRequestor::new(kind, name, self.binder.clone(), request, true));
        *slot.lock() = Some(requestor.clone());

        // a fault that happened before the requestor was visible did not release it
        match self.lifecycle.terminal_error() {
            Some(e) => Err(e),
            None => Ok(requestor),
        }
    }

    async fn shutdown_exchange(&self, requestor: &ReliableRequestor, helper: &TimeoutHelper) -> Result<WsrmMessageInfo, ReliableSessionError> {
        self.session.on_local_activity();

        let reply = if self.shape == OutputChannelShape::Request {
            self.suspend_polling();
            let reply = requestor.request(helper.remaining()).await;
            self.resume_polling();
            reply
        }
        else {
            requestor.request(helper.remaining()).await
        };
        let reply = reply?
            .ok_or_else(|| ReliableSessionError::Protocol(format!("{} was answered without a message", requestor.name())))?;

        let info = WsrmMessageInfo::get(self.version(), reply);
        // replies of the duplex shape went through the receive loop already
        if self.shape == OutputChannelShape::Request && !self.intake(&info) {
            return Err(self.lifecycle.terminal_error()
                .unwrap_or_else(|| ReliableSessionError::Protocol(format!("the reply to {} was rejected", requestor.name()))));
        }
        Ok(info)
    }

    fn fault_with(&self, fault: WsrmFault) -> ReliableSessionError {
        let error = fault.to_local_error();
        self.session.core().on_local_fault(Some(error.clone()), Some(fault), None);
        error
    }

    /// Tears the channel down without waiting for anything
    pub fn abort(&self) {
        if self.lifecycle.close() {
            debug!("aborting output channel on sequence {:?}", self.sequence_id());
        }
        self.fan_out(&ReliableSessionError::Aborted);
        self.session.abort();
        self.stop_receive_loop();
    }

    fn stop_receive_loop(&self) {
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
    }

    /// Releases everything that may be blocked in `send` or `close`
    fn fan_out(&self, error: &ReliableSessionError) {
        if let Some(connection) = self.connection() {
            connection.fault(error.clone());
        }
        self.shutdown_handle.fault(error.clone());

        let close_requestor = self.close_requestor.lock().clone();
        if let Some(requestor) = close_requestor {
            requestor.fault(error.clone());
        }
        let terminate_requestor = self.terminate_requestor.lock().clone();
        if let Some(requestor) = terminate_requestor {
            requestor.fault(error.clone());
        }
    }

    fn suspend_polling(&self) {
        let mut in_flight = self.requests_in_flight.lock();
        *in_flight += 1;
        if *in_flight == 1 {
            self.session.stop_polling();
        }
    }

    fn resume_polling(&self) {
        let mut in_flight = self.requests_in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            let fast_polling = self.connection()
                .map(|c| c.quota_remaining() == 0)
                .unwrap_or(false);
            if let Err(e) = self.session.resume_polling(fast_polling) {
                debug!("not resuming polling: {}", e);
            }
        }
    }

    /// Sends one message in the channel's shape. Replies of the request shape are processed
    ///  before this returns.
    async fn transmit(&self, message: Message, timeout: Duration) -> anyhow::Result<()> {
        match self.shape {
            OutputChannelShape::Duplex => self.binder.send(message, timeout).await,
            OutputChannelShape::Request => {
                self.suspend_polling();
                let reply = self.binder.request(message, timeout).await;
                self.resume_polling();
                if let Some(reply) = reply? {
                    self.process_message(reply).await;
                }
                Ok(())
            }
        }
    }

    /// One poll of the request shape. Polls do not suspend polling.
    async fn poll(&self) {
        let id = match self.sequence_id() {
            Some(id) => id,
            None => return,
        };
        let request = message::ack_requested(self.version(), id);
        match self.binder.request(request, self.config.default_send_timeout).await {
            Ok(Some(reply)) => self.process_message(reply).await,
            Ok(None) => {}
            Err(e) if self.binder.is_handleable(&e) => debug!("poll on sequence {} failed: {}", id, e),
            Err(e) => {
                if !self.lifecycle.is_terminated() {
                    self.session.core().on_unknown_exception(ReliableSessionError::transport(e));
                }
            }
        }
    }

    /// Handles one incoming message: acknowledgements go to the connection, shutdown responses
    ///  to the requestor waiting for them
    pub async fn process_message(&self, message: Message) {
        let info = WsrmMessageInfo::get(self.version(), message);
        if !self.intake(&info) {
            return;
        }
        self.route(info).await;
    }

    /// Session checks and acknowledgement processing. Returns false if the message must not be
    ///  looked at any further.
    fn intake(&self, info: &WsrmMessageInfo) -> bool {
        let core = self.session.core();
        if !core.process_info(info, None) {
            return false;
        }
        if !core.verify_simplex_protocol_elements(info, None) {
            return false;
        }

        let connection = match self.connection() {
            Some(connection) => connection,
            None => {
                warn!("dropping {} received before the sequence was created", info.action());
                return false;
            }
        };

        if let Some(ack) = &info.acknowledgement_info {
            let shutting_down = self.close_requestor.lock().is_some() || self.terminate_requestor.lock().is_some();
            // the remote side may terminate with its final acknowledgement attached
            if ack.final_ack && !shutting_down && info.terminate_sequence_info.is_none() {
                let fault = WsrmFault::protocol(ack.id, "a final acknowledgement was received before the sequence was closed");
                self.fault_with(fault);
                return false;
            }
            if let Err(fault) = connection.process_transferred(&ack.ranges, ack.buffer_remaining) {
                self.fault_with(fault);
                return false;
            }
            trace!("sequence {}: acknowledged {}", ack.id, ack.ranges);
            if self.shape == OutputChannelShape::Request && connection.check_for_termination() {
                self.shutdown_handle.set();
            }
        }

        self.session.on_remote_activity(connection.quota_remaining() == 0);
        true
    }

    async fn route(&self, info: WsrmMessageInfo) {
        let close_response = info.close_sequence_response_info.as_ref().map(|r| r.relates_to);
        let terminate_response = info.terminate_sequence_response_info.as_ref().map(|r| r.relates_to);
        let unknown_sequence = info.wsrm_header_fault.as_ref().map(|f| f.is_unknown_sequence()).unwrap_or(false);

        if let Some(relates_to) = close_response {
            self.hand_over(&self.close_requestor, "CloseSequence", relates_to, info);
        }
        else if let Some(relates_to) = terminate_response {
            self.hand_over(&self.terminate_requestor, "TerminateSequence", relates_to, info);
        }
        else if unknown_sequence {
            // only passes the session while terminating: the remote side already forgot us
            let requestor = self.terminate_requestor.lock().clone();
            if let Some(requestor) = requestor {
                requestor.set_info(info);
            }
        }
        else if info.terminate_sequence_info.is_some() {
            self.on_remote_terminate(info).await;
        }
        else if info.acknowledgement_info.is_none() {
            warn!("dropping unexpected message {}", info.action());
        }
    }

    fn hand_over(&self, slot: &RequestorSlot, name: &str, relates_to: Option<UniqueId>, info: WsrmMessageInfo) {
        let requestor = slot.lock().clone();
        match requestor {
            Some(requestor) if requestor.message_id() == relates_to => requestor.set_info(info),
            _ => {
                let id = self.sequence_id().unwrap_or_default();
                self.fault_with(WsrmFault::protocol(id, format!("received a reply to {} that was never requested", name)));
            }
        }
    }

    /// 1.1 lets the destination terminate the sequence. It is answered in any case, and only
    ///  benign once everything was acknowledged.
    async fn on_remote_terminate(&self, info: WsrmMessageInfo) {
        let core = self.session.core();
        if !core.verify_wsrm_request(&info, None) {
            return;
        }
        let (request, connection) = match (&info.terminate_sequence_info, self.connection()) {
            (Some(request), Some(connection)) => (request, connection),
            _ => return,
        };

        let sent = connection.last();
        let acknowledged = info.acknowledgement_info.as_ref()
            .filter(|ack| ack.final_ack)
            .map(|ack| ack.ranges.highest());
        let inconsistent = match request.last_msg_number {
            Some(last) if last > sent => Some(format!("TerminateSequence names message {} as the last one, but only {} were sent", last, sent)),
            Some(last) if acknowledged.map(|a| a > last).unwrap_or(false) => Some(format!("the final acknowledgement goes beyond the last message {}", last)),
            _ => None,
        };
        if let Some(reason) = inconsistent {
            self.fault_with(WsrmFault::protocol(request.identifier, reason));
            return;
        }

        let response = message::terminate_sequence_response(self.version(), request.identifier, request.message_id, None);
        if let Err(e) = send_masked(self.binder.as_ref(), response, self.config.default_send_timeout, MaskingMode::Handled).await {
            debug!("could not answer TerminateSequence on sequence {}: {}", request.identifier, e);
        }

        if connection.has_unacknowledged() {
            core.on_remote_fault(Some(ReliableSessionError::RemoteFault(
                "the remote endpoint terminated the sequence before all messages were acknowledged".to_string(),
            )));
        }
        else {
            debug!("the remote endpoint terminated the completed sequence {}", request.identifier);
            core.close_session();
        }
    }
}

#[async_trait]
impl OutputConnectionHandler for ReliableOutputSessionChannel {
    async fn send_attempt(&self, attempt: MessageAttemptInfo, timeout: Duration, mask_unhandled: bool) -> Result<(), ReliableSessionError> {
        let max_retry_count = self.config.max_retry_count;

        if attempt.retry_count > max_retry_count {
            let id = attempt.message.sequence_header()
                .map(|h| h.id)
                .or(self.sequence_id())
                .unwrap_or_default();
            let fault = WsrmFault::max_retry_count_exceeded(id);
            let cause = self.max_retry_count_error.lock().clone()
                .map(|e| Arc::new(e) as ErrorCause);
            let error = ReliableSessionError::Communication {
                message: fault.reason.clone(),
                cause,
            };
            info!("sequence {}: message {} was not acknowledged after {} retries", id, attempt.sequence_number, max_retry_count);
            self.session.core().on_local_fault(Some(error.clone()), Some(fault), None);
            return Err(error);
        }

        self.session.on_local_activity();
        trace!("sending message {} (retry {})", attempt.sequence_number, attempt.retry_count);

        let e = match self.transmit(attempt.message, timeout).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if self.binder.is_handleable(&e) {
            if attempt.retry_count == max_retry_count {
                *self.max_retry_count_error.lock() = Some(ReliableSessionError::transport(e));
            }
            else {
                debug!("message {} was lost, it will be retransmitted: {}", attempt.sequence_number, e);
            }
            return Ok(());
        }

        let error = ReliableSessionError::transport(e);
        if mask_unhandled {
            // nobody waits for a retransmission, the session has to learn about it
            if !self.lifecycle.is_terminated() {
                self.session.core().on_unknown_exception(error);
            }
            return Ok(());
        }
        Err(error)
    }

    async fn send_ack_requested(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        self.session.on_local_activity();
        let id = self.sequence_id()
            .ok_or_else(|| ReliableSessionError::InvalidState("no sequence".to_string()))?;

        match self.transmit(message::ack_requested(self.version(), id), timeout).await {
            Ok(()) => Ok(()),
            Err(e) if self.binder.is_handleable(&e) => {
                debug!("AckRequested on sequence {} was lost: {}", id, e);
                Ok(())
            }
            Err(e) => Err(ReliableSessionError::transport(e)),
        }
    }

    fn on_connection_exception(&self, error: ReliableSessionError) {
        self.session.core().on_unknown_exception(error);
    }
}

impl SessionOwner for ReliableOutputSessionChannel {
    fn fault(&self, error: Option<ReliableSessionError>) {
        let error = match error {
            Some(e) => e,
            // the opener reports the error itself
            None if self.lifecycle.state() == CommunicationState::Opening => {
                self.session.on_faulted();
                return;
            }
            None => ReliableSessionError::communication("the reliable session faulted", None),
        };

        if !self.lifecycle.fault(error.clone()) {
            return;
        }
        info!("output channel on sequence {:?} faulted: {}", self.sequence_id(), error);
        self.fan_out(&error);
        self.session.on_faulted();
    }

    fn unblock_close(&self) {
        let error = self.lifecycle.terminal_error().unwrap_or(ReliableSessionError::Aborted);
        self.fan_out(&error);
    }

    fn is_terminated(&self) -> bool {
        self.lifecycle.is_terminated()
    }
}

#[async_trait]
impl ReceiveTarget for ReliableOutputSessionChannel {
    fn binder(&self) -> &Arc<dyn ReliableChannelBinder> {
        &self.binder
    }

    fn poll_interval(&self) -> Duration {
        self.config.receive_poll_interval
    }

    fn is_receiving(&self) -> bool {
        !self.lifecycle.is_terminated()
    }

    async fn process_message(&self, message: Message) {
        ReliableOutputSessionChannel::process_message(self, message).await;
    }

    fn on_receive_failed(&self, error: ReliableSessionError) {
        // once TerminateSequence went out, the remote side may hang up
        if self.lifecycle.state() == CommunicationState::Closing && self.session.core().is_session_closed() {
            debug!("receive ended while closing: {}", error);
            return;
        }
        self.session.core().on_unknown_exception(error);
    }
}
