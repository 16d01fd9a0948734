use anyhow::{anyhow, bail};

use crate::fault::{FaultCode, WsrmFault};
use crate::message::{AcknowledgementHeader, CreateSequenceBody, Message, MessageBody, SequenceHeader, WsrmHeader};
use crate::unique_id::UniqueId;
use crate::version::{ReliableMessagingVersion, WsrmAction};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceResponseInfo {
    pub identifier: UniqueId,
    pub accept_acks_to: Option<String>,
    pub relates_to: Option<UniqueId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShutdownRequestInfo {
    pub identifier: UniqueId,
    pub last_msg_number: Option<i64>,
    pub message_id: Option<UniqueId>,
    pub reply_to: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShutdownResponseInfo {
    pub identifier: UniqueId,
    pub relates_to: Option<UniqueId>,
}

/// Everything WSRM-related that was found in an incoming message. If the message could not be
///  parsed, `parsing_error` is set and none of the other parts are.
#[derive(Clone, Debug)]
pub struct WsrmMessageInfo {
    pub message: Message,
    pub wsrm_action: Option<WsrmAction>,
    pub parsing_error: Option<String>,
    /// a fault this side owes the sender of the message because of what it contains
    pub fault_reply: Option<WsrmFault>,

    pub sequenced_message_info: Option<SequenceHeader>,
    pub acknowledgement_info: Option<AcknowledgementHeader>,
    pub ack_requested_info: Option<UniqueId>,
    pub uses_sequence_str: bool,

    pub create_sequence_info: Option<CreateSequenceBody>,
    pub create_sequence_response_info: Option<CreateSequenceResponseInfo>,
    pub close_sequence_info: Option<ShutdownRequestInfo>,
    pub close_sequence_response_info: Option<ShutdownResponseInfo>,
    pub terminate_sequence_info: Option<ShutdownRequestInfo>,
    pub terminate_sequence_response_info: Option<ShutdownResponseInfo>,

    /// set for WSRM faults (which carry a sequence id)
    pub wsrm_header_fault: Option<WsrmFault>,
    /// set for every fault, WSRM or not
    pub fault_info: Option<WsrmFault>,
}

impl WsrmMessageInfo {
    fn empty(message: Message) -> WsrmMessageInfo {
        WsrmMessageInfo {
            message,
            wsrm_action: None,
            parsing_error: None,
            fault_reply: None,
            sequenced_message_info: None,
            acknowledgement_info: None,
            ack_requested_info: None,
            uses_sequence_str: false,
            create_sequence_info: None,
            create_sequence_response_info: None,
            close_sequence_info: None,
            close_sequence_response_info: None,
            terminate_sequence_info: None,
            terminate_sequence_response_info: None,
            wsrm_header_fault: None,
            fault_info: None,
        }
    }

    pub fn get(version: ReliableMessagingVersion, message: Message) -> WsrmMessageInfo {
        let mut info = WsrmMessageInfo::empty(message);
        if let Err(e) = info.parse(version) {
            let mut failed = WsrmMessageInfo::empty(info.message);
            failed.parsing_error = Some(e.to_string());
            return failed;
        }
        info
    }

    pub fn action(&self) -> &str {
        &self.message.action
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    fn parse(&mut self, version: ReliableMessagingVersion) -> anyhow::Result<()> {
        let message = &self.message;

        self.wsrm_action = version.parse_action(&message.action);
        if self.wsrm_action.is_none() && ReliableMessagingVersion::is_any_wsrm_uri(&message.action) && !message.is_fault() {
            bail!("the action {} is not supported by {:?}", message.action, version);
        }

        if let Some(expected) = Self::action_for_body(&message.body) {
            if self.wsrm_action != Some(expected) {
                bail!("the message body requires action {:?}, but the action was {}", expected, message.action);
            }
        }
        else if let Some(action) = self.wsrm_action {
            if !matches!(action, WsrmAction::SequenceAcknowledgement | WsrmAction::AckRequested | WsrmAction::LastMessage | WsrmAction::Fault) {
                bail!("the action {} requires a body", message.action);
            }
        }

        for header in &message.headers {
            match header {
                WsrmHeader::Sequence(sequence) => {
                    if sequence.number < 1 {
                        bail!("invalid message number {} on sequence {}", sequence.number, sequence.id);
                    }
                    if sequence.last_message && !version.supports_last_message_marker() {
                        bail!("the LastMessage marker is not supported by {:?}", version);
                    }
                    if sequence.number == i64::MAX {
                        self.fault_reply = Some(WsrmFault::new(
                            FaultCode::MessageNumberRollover,
                            Some(sequence.id),
                            format!("the maximum message number was reached on sequence {}", sequence.id),
                        ));
                    }
                    self.sequenced_message_info = Some(sequence.clone());
                }
                WsrmHeader::SequenceAcknowledgement(ack) => {
                    if ack.final_ack && !version.supports_final_ack() {
                        bail!("the Final acknowledgement flag is not supported by {:?}", version);
                    }
                    if let Some(remaining) = ack.buffer_remaining {
                        if remaining < 0 {
                            bail!("negative BufferRemaining {} on sequence {}", remaining, ack.id);
                        }
                    }
                    self.acknowledgement_info = Some(ack.clone());
                }
                WsrmHeader::AckRequested { id } => {
                    self.ack_requested_info = Some(*id);
                }
                WsrmHeader::UsesSequenceStr => {
                    self.uses_sequence_str = true;
                }
            }
        }

        match &message.body {
            MessageBody::CreateSequence(body) => {
                self.create_sequence_info = Some(body.clone());
            }
            MessageBody::CreateSequenceResponse(body) => {
                self.create_sequence_response_info = Some(CreateSequenceResponseInfo {
                    identifier: body.identifier,
                    accept_acks_to: body.accept_acks_to.clone(),
                    relates_to: message.relates_to,
                });
            }
            MessageBody::CloseSequence { identifier, last_msg_number } => {
                self.close_sequence_info = Some(Self::shutdown_request(message, *identifier, *last_msg_number)?);
            }
            MessageBody::TerminateSequence { identifier, last_msg_number } => {
                self.terminate_sequence_info = Some(Self::shutdown_request(message, *identifier, *last_msg_number)?);
            }
            MessageBody::CloseSequenceResponse { identifier } => {
                self.close_sequence_response_info = Some(ShutdownResponseInfo { identifier: *identifier, relates_to: message.relates_to });
            }
            MessageBody::TerminateSequenceResponse { identifier } => {
                self.terminate_sequence_response_info = Some(ShutdownResponseInfo { identifier: *identifier, relates_to: message.relates_to });
            }
            MessageBody::Fault(body) => {
                let fault = WsrmFault::from_body(body);
                if fault.code.is_wsrm() {
                    if fault.sequence_id.is_none() && fault.code != FaultCode::CreateSequenceRefused && fault.code != FaultCode::WsrmRequired {
                        return Err(anyhow!("WSRM fault {} does not identify a sequence", fault.code));
                    }
                    if fault.sequence_id.is_some() {
                        self.wsrm_header_fault = Some(fault.clone());
                    }
                }
                self.fault_info = Some(fault);
            }
            MessageBody::Empty | MessageBody::Application(_) => {}
        }

        Ok(())
    }

    fn shutdown_request(message: &Message, identifier: UniqueId, last_msg_number: Option<i64>) -> anyhow::Result<ShutdownRequestInfo> {
        if let Some(last) = last_msg_number {
            if last < 0 {
                bail!("invalid last message number {} for sequence {}", last, identifier);
            }
        }
        Ok(ShutdownRequestInfo {
            identifier,
            last_msg_number,
            message_id: message.message_id,
            reply_to: message.reply_to.clone(),
        })
    }

    fn action_for_body(body: &MessageBody) -> Option<WsrmAction> {
        match body {
            MessageBody::CreateSequence(_) => Some(WsrmAction::CreateSequence),
            MessageBody::CreateSequenceResponse(_) => Some(WsrmAction::CreateSequenceResponse),
            MessageBody::CloseSequence { .. } => Some(WsrmAction::CloseSequence),
            MessageBody::CloseSequenceResponse { .. } => Some(WsrmAction::CloseSequenceResponse),
            MessageBody::TerminateSequence { .. } => Some(WsrmAction::TerminateSequence),
            MessageBody::TerminateSequenceResponse { .. } => Some(WsrmAction::TerminateSequenceResponse),
            MessageBody::Empty | MessageBody::Application(_) | MessageBody::Fault(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message;
    use crate::sequence_range::SequenceRangeCollection;
    use bytes::Bytes;
    use rstest::*;
    use ReliableMessagingVersion::*;

    fn id(raw: u128) -> UniqueId {
        UniqueId::from_raw(raw)
    }

    fn sequenced(number: i64, last_message: bool) -> Message {
        let mut msg = Message::application("urn:app/Op", Bytes::from_static(b"payload"));
        msg.set_sequence(id(1), number, last_message);
        msg
    }

    #[rstest]
    #[case::ok(Wsrm11, sequenced(1, false), false)]
    #[case::zero(Wsrm11, sequenced(0, false), true)]
    #[case::negative(WsrmFeb2005, sequenced(-3, false), true)]
    #[case::last_message_feb(WsrmFeb2005, sequenced(3, true), false)]
    #[case::last_message_11(Wsrm11, sequenced(3, true), true)]
    #[case::close_in_feb(WsrmFeb2005, message::close_sequence(Wsrm11, id(1), 2), true)]
    #[case::close_in_11(Wsrm11, message::close_sequence(Wsrm11, id(1), 2), false)]
    #[case::other_dialect(Wsrm11, message::ack_requested(WsrmFeb2005, id(1)), true)]
    #[case::action_body_mismatch(Wsrm11, Message::new("http://docs.oasis-open.org/ws-rx/wsrm/200702/CreateSequence", MessageBody::Empty), true)]
    fn test_parse_errors(#[case] version: ReliableMessagingVersion, #[case] msg: Message, #[case] expect_error: bool) {
        let info = WsrmMessageInfo::get(version, msg);
        assert_eq!(info.parsing_error.is_some(), expect_error, "{:?}", info.parsing_error);
    }

    #[test]
    fn test_final_ack_only_in_11() {
        let ack = AcknowledgementHeader {
            id: id(1),
            ranges: SequenceRangeCollection::empty(),
            final_ack: true,
            buffer_remaining: None,
        };
        assert!(WsrmMessageInfo::get(WsrmFeb2005, message::acknowledgement(WsrmFeb2005, ack.clone())).parsing_error.is_some());

        let info = WsrmMessageInfo::get(Wsrm11, message::acknowledgement(Wsrm11, ack.clone()));
        assert!(info.parsing_error.is_none());
        assert_eq!(info.acknowledgement_info, Some(ack));
    }

    #[test]
    fn test_rollover_produces_fault_reply() {
        let info = WsrmMessageInfo::get(Wsrm11, sequenced(i64::MAX, false));
        assert!(info.parsing_error.is_none());
        assert_eq!(info.fault_reply.map(|f| f.code), Some(FaultCode::MessageNumberRollover));
    }

    #[test]
    fn test_faults() {
        let wsrm = WsrmFault::unknown_sequence(id(4)).to_message(Wsrm11);
        let info = WsrmMessageInfo::get(Wsrm11, wsrm);
        assert_eq!(info.wsrm_header_fault.as_ref().map(|f| f.sequence_id), Some(Some(id(4))));
        assert!(info.fault_info.is_some());

        let app = WsrmFault::new(FaultCode::Other("Receiver".to_string()), None, "boom").to_message(Wsrm11);
        let info = WsrmMessageInfo::get(Wsrm11, app);
        assert!(info.wsrm_header_fault.is_none());
        assert_eq!(info.fault_info.map(|f| f.reason), Some("boom".to_string()));
    }

    #[test]
    fn test_shutdown_infos() {
        let close = message::close_sequence(Wsrm11, id(2), 5)
            .with_message_id(id(9))
            .with_reply_to("urn:client");
        let info = WsrmMessageInfo::get(Wsrm11, close);
        assert_eq!(info.close_sequence_info, Some(ShutdownRequestInfo {
            identifier: id(2),
            last_msg_number: Some(5),
            message_id: Some(id(9)),
            reply_to: Some("urn:client".to_string()),
        }));
        assert_eq!(info.wsrm_action, Some(WsrmAction::CloseSequence));
    }
}
