//! The receiving side of a one-way reliable session over a duplex binder.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::binder::{send_masked, CommunicationState, MaskingMode, ReceiveResult, ReliableChannelBinder};
use crate::channel::{spawn_receive_loop, Lifecycle, ReceiveTarget};
use crate::config::ReliableSessionConfig;
use crate::connection::input::{ReceiveOutcome, ReliableInputConnection};
use crate::fault::{FaultCode, ReliableSessionError, WsrmFault};
use crate::fault_helper::FaultDispatcher;
use crate::message::{self, Message, SequenceHeader};
use crate::message_info::WsrmMessageInfo;
use crate::session::server::ServerReliableSession;
use crate::session::{ReliableSession, SessionOwner};
use crate::sync::wait_object::InterruptibleWaitObject;
use crate::timeout_helper::TimeoutHelper;
use crate::unique_id::UniqueId;
use crate::version::{ReliableMessagingVersion, WsrmAction};

pub struct ReliableInputSessionChannel {
    config: Arc<ReliableSessionConfig>,
    binder: Arc<dyn ReliableChannelBinder>,
    session: ServerReliableSession,
    lifecycle: Lifecycle,
    weak_self: Weak<ReliableInputSessionChannel>,
    connection: Mutex<ReliableInputConnection>,
    deliveries: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    /// the CreateSequence request and our response, for answering retransmissions
    create_sequence_exchange: Mutex<Option<(Option<UniqueId>, Message)>>,
    /// a CloseSequence is answered once every message up to its last number arrived
    pending_close_reply: Mutex<Option<Option<UniqueId>>>,
    /// set when the sender terminated the sequence
    terminated: InterruptibleWaitObject,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableInputSessionChannel {
    /// Waits for a CreateSequence on the binder, creates the sequence and returns the opened
    ///  channel for it. Offers are refused, the channel is one-way.
    pub async fn accept(
        config: Arc<ReliableSessionConfig>,
        binder: Arc<dyn ReliableChannelBinder>,
        fault_dispatcher: Arc<dyn FaultDispatcher>,
        timeout: Duration,
    ) -> Result<Arc<ReliableInputSessionChannel>, ReliableSessionError> {
        let helper = TimeoutHelper::new(timeout);
        let version = config.reliable_messaging_version;

        if binder.state() == CommunicationState::Created {
            binder.open(helper.remaining()).await
                .map_err(ReliableSessionError::transport)?;
        }

        loop {
            let received = binder.try_receive(helper.remaining()).await
                .map_err(ReliableSessionError::transport)?;
            let request = match received {
                ReceiveResult::Message(message) => message,
                ReceiveResult::TimedOut => {
                    if helper.is_expired() {
                        return Err(ReliableSessionError::Timeout(format!("no CreateSequence arrived within {:?}", timeout)));
                    }
                    continue;
                }
                ReceiveResult::EndOfSession => {
                    return Err(ReliableSessionError::communication("the remote endpoint went away before creating a sequence", None));
                }
            };

            let info = WsrmMessageInfo::get(version, request);
            let create = match &info.create_sequence_info {
                Some(create) if info.parsing_error.is_none() => create.clone(),
                _ => {
                    debug!("ignoring {} while waiting for CreateSequence", info.action());
                    continue;
                }
            };

            let request_id = info.message.message_id;
            match (create.offer, version) {
                (Some(offer), ReliableMessagingVersion::WsrmFeb2005) => {
                    info!("refusing CreateSequence offering {}", offer);
                    let refusal = WsrmFault::new(FaultCode::CreateSequenceRefused, None, "this endpoint does not accept offers, the session is one-way")
                        .to_message(version)
                        .with_relates_to(request_id);
                    send_masked(binder.as_ref(), refusal, helper.remaining(), MaskingMode::Handled).await
                        .map_err(ReliableSessionError::transport)?;
                    continue;
                }
                (Some(offer), ReliableMessagingVersion::Wsrm11) => debug!("not accepting the offered sequence {}", offer),
                (None, _) => {}
            }

            let input_id = UniqueId::new();
            let response = message::create_sequence_response(version, &info.message, input_id, None);
            binder.send(response.clone(), helper.remaining()).await
                .map_err(ReliableSessionError::transport)?;
            info!("accepted sequence {} from {}", input_id, create.acks_to);

            let channel = ReliableInputSessionChannel::new(config, binder, fault_dispatcher, input_id, create.ordered);
            *channel.create_sequence_exchange.lock() = Some((request_id, response));
            channel.open(helper.remaining()).await?;
            return Ok(channel);
        }
    }

    pub fn new(
        config: Arc<ReliableSessionConfig>,
        binder: Arc<dyn ReliableChannelBinder>,
        fault_dispatcher: Arc<dyn FaultDispatcher>,
        input_id: UniqueId,
        ordered: bool,
    ) -> Arc<ReliableInputSessionChannel> {
        let (deliveries, inbox) = mpsc::unbounded_channel();
        let max_ranges = config.max_sequence_ranges;

        Arc::new_cyclic(|weak_self: &Weak<ReliableInputSessionChannel>| {
            let owner: Weak<dyn SessionOwner> = weak_self.clone();
            ReliableInputSessionChannel {
                session: ServerReliableSession::new(config.clone(), binder.clone(), fault_dispatcher, owner, input_id, None),
                config,
                binder,
                lifecycle: Lifecycle::new(),
                weak_self: weak_self.clone(),
                connection: Mutex::new(ReliableInputConnection::new(input_id, ordered, max_ranges)),
                deliveries: Mutex::new(Some(deliveries)),
                inbox: tokio::sync::Mutex::new(inbox),
                create_sequence_exchange: Mutex::new(None),
                pending_close_reply: Mutex::new(None),
                terminated: InterruptibleWaitObject::new(false),
                receive_task: Mutex::new(None),
            }
        })
    }

    pub fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    pub fn sequence_id(&self) -> UniqueId {
        self.connection.lock().id()
    }

    pub fn session(&self) -> &ServerReliableSession {
        &self.session
    }

    /// the last message number, once the sender declared it
    pub fn last(&self) -> Option<i64> {
        self.connection.lock().last()
    }

    pub fn is_terminated_by_sender(&self) -> bool {
        self.terminated.is_set()
    }

    fn version(&self) -> ReliableMessagingVersion {
        self.config.reliable_messaging_version
    }

    pub async fn open(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        self.lifecycle.transition(CommunicationState::Created, CommunicationState::Opening)?;
        if let Err(e) = self.session.open(timeout).await {
            self.lifecycle.fault(e.clone());
            self.session.abort();
            return Err(e);
        }
        *self.receive_task.lock() = Some(spawn_receive_loop(self.weak_self.clone()));
        self.lifecycle.transition(CommunicationState::Opening, CommunicationState::Opened)
    }

    /// The next message in delivery order. `None` once the sender terminated the sequence and
    ///  everything was delivered.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>, ReliableSessionError> {
        if let Some(e) = self.lifecycle.terminal_error() {
            return Err(e);
        }

        let mut inbox = self.inbox.lock().await;
        match time::timeout(timeout, inbox.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => match self.lifecycle.terminal_error() {
                Some(e) => Err(e),
                None => Ok(None),
            },
            Err(_) => Err(ReliableSessionError::Timeout(format!("nothing was received on sequence {} within {:?}", self.sequence_id(), timeout))),
        }
    }

    /// Waits for the sender to terminate the sequence
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

        let error = match self.terminated.wait(helper.remaining()).await {
            Ok(true) => None,
            Ok(false) => Some(ReliableSessionError::Timeout(format!("sequence {} was not terminated within {:?}", self.sequence_id(), timeout))),
            Err(e) => Some(self.lifecycle.terminal_error().unwrap_or(e)),
        };
        if let Some(e) = error {
            warn!("closing input channel on sequence {} failed: {}", self.sequence_id(), e);
            self.abort();
            return Err(e);
        }

        self.session.close();
        self.stop_receive_loop();
        let closed = self.binder.close(helper.remaining()).await;
        self.lifecycle.close();
        if let Err(e) = closed {
            self.binder.abort();
            return Err(ReliableSessionError::transport(e));
        }
        info!("input channel on sequence {} closed", self.sequence_id());
        Ok(())
    }

    pub fn abort(&self) {
        if self.lifecycle.close() {
            debug!("aborting input channel on sequence {}", self.sequence_id());
        }
        self.fan_out(&ReliableSessionError::Aborted);
        self.remember_final_ranges();
        self.session.abort();
        self.stop_receive_loop();
    }

    fn stop_receive_loop(&self) {
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
    }

    fn fan_out(&self, error: &ReliableSessionError) {
        self.terminated.fault(error.clone());
        self.deliveries.lock().take();
    }

    /// 1.1 faults acknowledge what was received, so the sender knows what got through
    fn remember_final_ranges(&self) {
        if self.version().supports_final_ack() {
            let ranges = self.connection.lock().ranges().clone();
            self.session.core().set_final_ranges(ranges);
        }
    }

    pub async fn process_message(&self, message: Message) {
        let info = WsrmMessageInfo::get(self.version(), message);
        let core = self.session.core();
        if !core.process_info(&info, None) {
            return;
        }
        if !core.verify_simplex_protocol_elements(&info, None) {
            return;
        }
        self.session.on_remote_activity(false);

        if let Some(sequence) = info.sequenced_message_info.clone() {
            self.on_sequenced_message(sequence, info).await;
        }
        else if info.close_sequence_info.is_some() {
            self.on_close_sequence(info).await;
        }
        else if info.terminate_sequence_info.is_some() {
            self.on_terminate_sequence(info).await;
        }
        else if info.ack_requested_info.is_some() {
            self.send_acknowledgement().await;
        }
        else if info.create_sequence_info.is_some() {
            self.on_create_sequence_retransmitted(info).await;
        }
        else {
            warn!("dropping unexpected message {}", info.action());
        }
    }

    async fn on_sequenced_message(&self, sequence: SequenceHeader, info: WsrmMessageInfo) {
        let marker_only = info.wsrm_action == Some(WsrmAction::LastMessage);
        let payload = if marker_only { None } else { Some(info.into_message()) };

        let outcome = self.connection.lock().receive(sequence.number, payload, sequence.last_message);
        match outcome {
            ReceiveOutcome::Accepted(deliverable) => {
                trace!("sequence {}: accepted message {}", sequence.id, sequence.number);
                let deliveries = self.deliveries.lock().clone();
                if let Some(deliveries) = deliveries {
                    for message in deliverable {
                        if deliveries.send(message).is_err() {
                            debug!("sequence {}: nobody receives anymore", sequence.id);
                            break;
                        }
                    }
                }
            }
            ReceiveOutcome::Duplicate => {}
            ReceiveOutcome::RangesExceeded => return,
            ReceiveOutcome::BeyondLast => {
                self.on_beyond_last(sequence.id, sequence.number).await;
                return;
            }
        }

        self.send_acknowledgement().await;
        self.complete_pending_close().await;
    }

    /// Feb2005 has no way to refuse a single message, the sequence is over. 1.1 tells the
    ///  sender that the sequence is closed and keeps the session.
    async fn on_beyond_last(&self, id: UniqueId, number: i64) {
        match self.version() {
            ReliableMessagingVersion::WsrmFeb2005 => {
                let fault = WsrmFault::last_message_number_exceeded(id);
                self.session.core().on_local_fault(Some(fault.to_local_error()), Some(fault), None);
            }
            ReliableMessagingVersion::Wsrm11 => {
                debug!("sequence {}: message {} arrived after the sequence was closed", id, number);
                self.send_one_way(WsrmFault::sequence_closed(id).to_message(self.version())).await;
            }
        }
    }

    async fn send_acknowledgement(&self) {
        let ack = {
            let connection = self.connection.lock();
            let final_ack = self.version().supports_final_ack() && connection.is_closed();
            let buffer_remaining = if self.config.flow_control_enabled {
                let remaining = self.config.max_transfer_window_size.saturating_sub(connection.buffered());
                Some(i32::try_from(remaining).unwrap_or(i32::MAX))
            }
            else {
                None
            };
            connection.acknowledgement(final_ack, buffer_remaining)
        };
        self.send_one_way(message::acknowledgement(self.version(), ack)).await;
    }

    async fn on_close_sequence(&self, info: WsrmMessageInfo) {
        let core = self.session.core();
        if !core.verify_wsrm_request(&info, None) {
            return;
        }
        let request = match &info.close_sequence_info {
            Some(request) => request,
            None => return,
        };

        let closed = self.connection.lock().close(request.last_msg_number);
        if let Err(fault) = closed {
            core.on_local_fault(Some(fault.to_local_error()), Some(fault), None);
            return;
        }
        debug!("sequence {} closed by the sender", request.identifier);
        *self.pending_close_reply.lock() = Some(request.message_id);
        self.complete_pending_close().await;
    }

    /// Answers a pending CloseSequence once nothing is missing anymore
    async fn complete_pending_close(&self) {
        let (id, relates_to, ack) = {
            let connection = self.connection.lock();
            if !connection.is_complete() {
                return;
            }
            let relates_to = match self.pending_close_reply.lock().take() {
                Some(relates_to) => relates_to,
                None => return,
            };
            (connection.id(), relates_to, connection.acknowledgement(true, None))
        };
        self.send_one_way(message::close_sequence_response(self.version(), id, relates_to, ack)).await;
    }

    async fn on_terminate_sequence(&self, info: WsrmMessageInfo) {
        let core = self.session.core();
        if !core.verify_wsrm_request(&info, None) {
            return;
        }
        let request = match &info.terminate_sequence_info {
            Some(request) => request,
            None => return,
        };

        match self.version() {
            ReliableMessagingVersion::Wsrm11 => {
                let (closed, ack) = {
                    let mut connection = self.connection.lock();
                    let closed = connection.close(request.last_msg_number);
                    (closed, connection.acknowledgement(true, None))
                };
                if let Err(fault) = closed {
                    core.on_local_fault(Some(fault.to_local_error()), Some(fault), None);
                    return;
                }
                let response = message::terminate_sequence_response(self.version(), request.identifier, request.message_id, Some(ack));
                self.send_one_way(response).await;
            }
            ReliableMessagingVersion::WsrmFeb2005 => {
                if !self.connection.lock().is_complete() {
                    let fault = WsrmFault::protocol(request.identifier, "the sequence was terminated before all messages were received");
                    core.on_local_fault(Some(fault.to_local_error()), Some(fault), None);
                    return;
                }
            }
        }
        self.on_terminated();
    }

    fn on_terminated(&self) {
        if self.terminated.is_set() {
            return;
        }
        info!("sequence {} terminated by the sender", self.sequence_id());
        self.session.core().close_session();
        self.deliveries.lock().take();
        self.terminated.set();
    }

    async fn on_create_sequence_retransmitted(&self, info: WsrmMessageInfo) {
        let exchange = self.create_sequence_exchange.lock().clone();
        match exchange {
            Some((request_id, response)) if request_id.is_some() && request_id == info.message.message_id => {
                debug!("answering retransmitted CreateSequence for {}", self.sequence_id());
                self.send_one_way(response).await;
            }
            _ => warn!("dropping CreateSequence on the established sequence {}", self.sequence_id()),
        }
    }

    async fn send_one_way(&self, message: Message) {
        let action = message.action.clone();
        let sent = send_masked(self.binder.as_ref(), message, self.config.default_send_timeout, MaskingMode::Handled).await;
        if let Err(e) = sent {
            if !self.lifecycle.is_terminated() {
                debug!("sending {} failed: {}", action, e);
                self.session.core().on_unknown_exception(ReliableSessionError::transport(e));
            }
        }
    }
}

impl SessionOwner for ReliableInputSessionChannel {
    fn fault(&self, error: Option<ReliableSessionError>) {
        let error = error.unwrap_or_else(|| ReliableSessionError::communication("the reliable session faulted", None));
        if !self.lifecycle.fault(error.clone()) {
            return;
        }
        info!("input channel on sequence {} faulted: {}", self.sequence_id(), error);
        self.remember_final_ranges();
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
impl ReceiveTarget for ReliableInputSessionChannel {
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
        ReliableInputSessionChannel::process_message(self, message).await;
    }

    fn on_receive_failed(&self, error: ReliableSessionError) {
        if self.session.core().is_session_closed() {
            debug!("receive ended after the sequence was terminated: {}", error);
            return;
        }
        self.session.core().on_unknown_exception(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use crate::test_util::binder::binder_pair;
    use crate::test_util::channel::open_channel_pair;
    use crate::test_util::fault::TrackingFaultDispatcher;
    use crate::version::ReliableMessagingVersion::*;
    use bytes::Bytes;
    use rstest::*;

    fn app_message(n: u32) -> Message {
        Message::application(format!("urn:app/{}", n), Bytes::from(format!("payload {}", n)))
    }

    fn fault_code(message: &Message) -> FaultCode {
        match &message.body {
            MessageBody::Fault(body) => body.code.clone(),
            other => panic!("not a fault: {:?}", other),
        }
    }

    #[rstest]
    #[case::feb2005(WsrmFeb2005)]
    #[case::wsrm11(Wsrm11)]
    #[tokio::test(start_paused = true)]
    async fn test_end_to_end(#[case] version: ReliableMessagingVersion) {
        let pair = open_channel_pair(ReliableSessionConfig::new(version), ReliableSessionConfig::new(version)).await.unwrap();
        assert_eq!(pair.client.sequence_id(), Some(pair.server.sequence_id()));

        for n in 1..=3 {
            pair.client.send(app_message(n), Duration::from_secs(10)).await.unwrap();
        }
        for n in 1..=3 {
            let received = pair.server.receive(Duration::from_secs(10)).await.unwrap().unwrap();
            assert_eq!(received.action, format!("urn:app/{}", n));
            assert!(matches!(received.body, MessageBody::Application(_)));
        }

        let server = pair.server.clone();
        let server_close = tokio::spawn(async move { server.close(Duration::from_secs(30)).await });
        pair.client.close(Duration::from_secs(30)).await.unwrap();
        server_close.await.unwrap().unwrap();

        // Feb2005 numbers the LastMessage marker
        let expected_last = match version {
            WsrmFeb2005 => 4,
            Wsrm11 => 3,
        };
        assert_eq!(pair.server.last(), Some(expected_last));
        assert_eq!(pair.client.connection().unwrap().last(), expected_last);
        assert!(pair.server.is_terminated_by_sender());
        assert_eq!(pair.server.state(), CommunicationState::Closed);
        assert!(matches!(pair.server.receive(Duration::from_secs(1)).await, Ok(None)));

        pair.client_faults.assert_no_fault_sent();
        pair.server_faults.assert_no_fault_sent();
    }

    #[rstest]
    #[case::feb2005(WsrmFeb2005, FaultCode::LastMessageNumberExceeded, CommunicationState::Faulted)]
    #[case::wsrm11(Wsrm11, FaultCode::SequenceClosed, CommunicationState::Opened)]
    #[tokio::test(start_paused = true)]
    async fn test_message_beyond_last(#[case] version: ReliableMessagingVersion, #[case] expected: FaultCode, #[case] state: CommunicationState) {
        let (client_binder, server_binder) = binder_pair("urn:client", "urn:server");
        let faults = TrackingFaultDispatcher::new();
        let id = UniqueId::from_raw(5);
        let channel = ReliableInputSessionChannel::new(Arc::new(ReliableSessionConfig::new(version)), server_binder.clone(), faults.clone(), id, true);
        server_binder.open(Duration::from_secs(1)).await.unwrap();
        client_binder.open(Duration::from_secs(1)).await.unwrap();
        channel.open(Duration::from_secs(1)).await.unwrap();

        let mut first = app_message(1);
        first.set_sequence(id, 1, false);
        channel.process_message(first).await;
        match version {
            WsrmFeb2005 => channel.process_message(message::last_message(version, id, 2)).await,
            Wsrm11 => channel.process_message(message::close_sequence(version, id, 1).with_message_id(UniqueId::new())).await,
        }

        let mut late = app_message(5);
        late.set_sequence(id, 5, false);
        channel.process_message(late).await;

        let fault = match version {
            WsrmFeb2005 => faults.sent_faults().pop().unwrap().0,
            Wsrm11 => {
                faults.assert_no_fault_sent();
                server_binder.take_sent().into_iter().find(|m| m.is_fault()).unwrap()
            }
        };
        assert_eq!(fault_code(&fault), expected);
        assert_eq!(channel.state(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sequence_is_answered_when_complete() {
        let (_client_binder, server_binder) = binder_pair("urn:client", "urn:server");
        let faults = TrackingFaultDispatcher::new();
        let id = UniqueId::from_raw(5);
        let channel = ReliableInputSessionChannel::new(Arc::new(ReliableSessionConfig::new(Wsrm11)), server_binder.clone(), faults.clone(), id, true);
        server_binder.open(Duration::from_secs(1)).await.unwrap();
        channel.open(Duration::from_secs(1)).await.unwrap();

        let mut second = app_message(2);
        second.set_sequence(id, 2, false);
        channel.process_message(second).await;

        let close_id = UniqueId::new();
        channel.process_message(message::close_sequence(Wsrm11, id, 2).with_message_id(close_id).with_reply_to("urn:client")).await;
        assert!(server_binder.take_sent().iter().all(|m| !matches!(m.body, MessageBody::CloseSequenceResponse { .. })));

        let mut first = app_message(1);
        first.set_sequence(id, 1, false);
        channel.process_message(first).await;
        let sent = server_binder.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].acknowledgement_header().unwrap().final_ack);
        let response = &sent[1];
        assert!(matches!(response.body, MessageBody::CloseSequenceResponse { .. }));
        assert_eq!(response.relates_to, Some(close_id));
        assert!(response.acknowledgement_header().unwrap().ranges.is_complete_up_to(2));

        assert_eq!(channel.receive(Duration::from_secs(1)).await.unwrap().unwrap().action, "urn:app/1");
        assert_eq!(channel.receive(Duration::from_secs(1)).await.unwrap().unwrap().action, "urn:app/2");
        faults.assert_no_fault_sent();
    }

    #[tokio::test(start_paused = true)]
    async fn test_feb_terminate_before_complete_is_a_protocol_fault() {
        let (_client_binder, server_binder) = binder_pair("urn:client", "urn:server");
        let faults = TrackingFaultDispatcher::new();
        let id = UniqueId::from_raw(5);
        let channel = ReliableInputSessionChannel::new(Arc::new(ReliableSessionConfig::new(WsrmFeb2005)), server_binder.clone(), faults.clone(), id, true);
        server_binder.open(Duration::from_secs(1)).await.unwrap();
        channel.open(Duration::from_secs(1)).await.unwrap();

        let mut second = app_message(2);
        second.set_sequence(id, 2, false);
        channel.process_message(second).await;
        channel.process_message(message::terminate_sequence(WsrmFeb2005, id, None)).await;

        assert_eq!(channel.state(), CommunicationState::Faulted);
        assert!(!channel.is_terminated_by_sender());
        let sent = faults.sent_faults();
        assert_eq!(sent.len(), 1);
        assert!(matches!(channel.receive(Duration::from_secs(1)).await, Err(ReliableSessionError::Protocol(_))));
    }

    #[rstest]
    #[case::feb2005_refuses(WsrmFeb2005, true)]
    #[case::wsrm11_ignores_offer(Wsrm11, false)]
    #[tokio::test(start_paused = true)]
    async fn test_accept_with_offer(#[case] version: ReliableMessagingVersion, #[case] refused: bool) {
        let (client_binder, server_binder) = binder_pair("urn:client", "urn:server");
        client_binder.open(Duration::from_secs(1)).await.unwrap();
        let config = Arc::new(ReliableSessionConfig::new(version));
        let accepting = tokio::spawn(ReliableInputSessionChannel::accept(config, server_binder.clone(), TrackingFaultDispatcher::new(), Duration::from_secs(30)));

        let request_id = UniqueId::new();
        let offering = message::create_sequence(version, "urn:client", Some(UniqueId::new()), true).with_message_id(request_id);
        client_binder.send(offering, Duration::from_secs(1)).await.unwrap();

        if refused {
            let refusal = match client_binder.try_receive(Duration::from_secs(5)).await.unwrap() {
                ReceiveResult::Message(m) => m,
                _ => panic!("expected a refusal"),
            };
            assert_eq!(fault_code(&refusal), FaultCode::CreateSequenceRefused);
            assert_eq!(refusal.relates_to, Some(request_id));

            let plain = message::create_sequence(version, "urn:client", None, true).with_message_id(UniqueId::new());
            client_binder.send(plain, Duration::from_secs(1)).await.unwrap();
        }
        let channel = accepting.await.unwrap().unwrap();
        assert_eq!(channel.state(), CommunicationState::Opened);

        let response = match client_binder.try_receive(Duration::from_secs(5)).await.unwrap() {
            ReceiveResult::Message(m) => m,
            _ => panic!("expected a response"),
        };
        assert!(matches!(&response.body, MessageBody::CreateSequenceResponse(body) if body.identifier == channel.sequence_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_times_out_without_terminate() {
        let pair = open_channel_pair(ReliableSessionConfig::new(Wsrm11), ReliableSessionConfig::new(Wsrm11)).await.unwrap();
        let result = pair.server.close(Duration::from_secs(5)).await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(pair.server.state(), CommunicationState::Closed);
    }
}
