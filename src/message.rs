//! Structured representation of the messages exchanged by the reliable session. Encoding these
//!  to and from XML is the job of the message encoder below the binder and is not done here;
//!  the model carries exactly the information the WSRM headers and bodies carry on the wire.

use bytes::Bytes;

use crate::fault::FaultCode;
use crate::sequence_range::SequenceRangeCollection;
use crate::unique_id::UniqueId;
use crate::version::{ReliableMessagingVersion, WsrmAction};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub action: String,
    pub message_id: Option<UniqueId>,
    pub relates_to: Option<UniqueId>,
    pub reply_to: Option<String>,
    pub headers: Vec<WsrmHeader>,
    pub body: MessageBody,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceHeader {
    pub id: UniqueId,
    pub number: i64,
    /// Feb2005 marks the last message of a sequence in its Sequence header
    pub last_message: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcknowledgementHeader {
    pub id: UniqueId,
    pub ranges: SequenceRangeCollection,
    /// 1.1 only: the receiver will not accept any further messages on this sequence
    pub final_ack: bool,
    /// flow control extension: how many more messages the receiver is willing to buffer
    pub buffer_remaining: Option<i32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WsrmHeader {
    Sequence(SequenceHeader),
    SequenceAcknowledgement(AcknowledgementHeader),
    AckRequested { id: UniqueId },
    UsesSequenceStr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceBody {
    pub acks_to: String,
    pub offer: Option<UniqueId>,
    pub ordered: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceResponseBody {
    pub identifier: UniqueId,
    /// present iff an offered sequence was accepted
    pub accept_acks_to: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaultBody {
    pub code: FaultCode,
    pub sequence_id: Option<UniqueId>,
    pub reason: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessageBody {
    Empty,
    Application(Bytes),
    CreateSequence(CreateSequenceBody),
    CreateSequenceResponse(CreateSequenceResponseBody),
    CloseSequence { identifier: UniqueId, last_msg_number: Option<i64> },
    CloseSequenceResponse { identifier: UniqueId },
    TerminateSequence { identifier: UniqueId, last_msg_number: Option<i64> },
    TerminateSequenceResponse { identifier: UniqueId },
    Fault(FaultBody),
}

impl Message {
    pub fn new(action: impl Into<String>, body: MessageBody) -> Message {
        Message {
            action: action.into(),
            message_id: None,
            relates_to: None,
            reply_to: None,
            headers: Vec::new(),
            body,
        }
    }

    pub fn application(action: impl Into<String>, payload: Bytes) -> Message {
        Message::new(action, MessageBody::Application(payload))
    }

    fn wsrm(version: ReliableMessagingVersion, action: WsrmAction, body: MessageBody) -> Message {
        // callers only build actions that exist in the session's dialect
        debug_assert!(version.supports_action(action), "{:?} does not exist in {:?}", action, version);
        let uri = version.action_uri(action).unwrap_or_default();
        Message::new(uri, body)
    }

    pub fn with_message_id(mut self, id: UniqueId) -> Message {
        self.message_id = Some(id);
        self
    }

    pub fn with_relates_to(mut self, id: Option<UniqueId>) -> Message {
        self.relates_to = id;
        self
    }

    pub fn with_reply_to(mut self, address: impl Into<String>) -> Message {
        self.reply_to = Some(address.into());
        self
    }

    pub fn with_header(mut self, header: WsrmHeader) -> Message {
        self.headers.push(header);
        self
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.body, MessageBody::Fault(_))
    }

    pub fn sequence_header(&self) -> Option<&SequenceHeader> {
        self.headers.iter()
            .find_map(|h| match h {
                WsrmHeader::Sequence(s) => Some(s),
                _ => None,
            })
    }

    pub fn acknowledgement_header(&self) -> Option<&AcknowledgementHeader> {
        self.headers.iter()
            .find_map(|h| match h {
                WsrmHeader::SequenceAcknowledgement(a) => Some(a),
                _ => None,
            })
    }

    /// Adds or replaces the acknowledgement header for a sequence
    pub fn set_acknowledgement(&mut self, ack: AcknowledgementHeader) {
        self.headers.retain(|h| !matches!(h, WsrmHeader::SequenceAcknowledgement(a) if a.id == ack.id));
        self.headers.push(WsrmHeader::SequenceAcknowledgement(ack));
    }

    /// Stamps an application message with its position in a sequence
    pub fn set_sequence(&mut self, id: UniqueId, number: i64, last_message: bool) {
        self.headers.retain(|h| !matches!(h, WsrmHeader::Sequence(_)));
        self.headers.push(WsrmHeader::Sequence(SequenceHeader { id, number, last_message }));
    }
}

pub fn create_sequence(version: ReliableMessagingVersion, acks_to: impl Into<String>, offer: Option<UniqueId>, ordered: bool) -> Message {
    Message::wsrm(version, WsrmAction::CreateSequence, MessageBody::CreateSequence(CreateSequenceBody {
        acks_to: acks_to.into(),
        offer,
        ordered,
    }))
}

/// Builds the answer a listener sends after accepting a CreateSequence request
pub fn create_sequence_response(version: ReliableMessagingVersion, request: &Message, identifier: UniqueId, accept_acks_to: Option<String>) -> Message {
    Message::wsrm(version, WsrmAction::CreateSequenceResponse, MessageBody::CreateSequenceResponse(CreateSequenceResponseBody {
        identifier,
        accept_acks_to,
    }))
        .with_relates_to(request.message_id)
}

pub fn ack_requested(version: ReliableMessagingVersion, id: UniqueId) -> Message {
    Message::wsrm(version, WsrmAction::AckRequested, MessageBody::Empty)
        .with_header(WsrmHeader::AckRequested { id })
}

pub fn acknowledgement(version: ReliableMessagingVersion, ack: AcknowledgementHeader) -> Message {
    Message::wsrm(version, WsrmAction::SequenceAcknowledgement, MessageBody::Empty)
        .with_header(WsrmHeader::SequenceAcknowledgement(ack))
}

/// Feb2005 ends a sequence with an empty message that carries the LastMessage marker
pub fn last_message(version: ReliableMessagingVersion, id: UniqueId, number: i64) -> Message {
    let mut msg = Message::wsrm(version, WsrmAction::LastMessage, MessageBody::Empty);
    msg.set_sequence(id, number, true);
    msg
}

pub fn close_sequence(version: ReliableMessagingVersion, identifier: UniqueId, last_msg_number: i64) -> Message {
    Message::wsrm(version, WsrmAction::CloseSequence, MessageBody::CloseSequence {
        identifier,
        last_msg_number: Some(last_msg_number),
    })
}

pub fn close_sequence_response(version: ReliableMessagingVersion, identifier: UniqueId, relates_to: Option<UniqueId>, final_ack: AcknowledgementHeader) -> Message {
    Message::wsrm(version, WsrmAction::CloseSequenceResponse, MessageBody::CloseSequenceResponse { identifier })
        .with_relates_to(relates_to)
        .with_header(WsrmHeader::SequenceAcknowledgement(final_ack))
}

/// Feb2005 does not transmit the last message number in TerminateSequence
pub fn terminate_sequence(version: ReliableMessagingVersion, identifier: UniqueId, last_msg_number: Option<i64>) -> Message {
    let last_msg_number = match version {
        ReliableMessagingVersion::WsrmFeb2005 => None,
        ReliableMessagingVersion::Wsrm11 => last_msg_number,
    };
    Message::wsrm(version, WsrmAction::TerminateSequence, MessageBody::TerminateSequence { identifier, last_msg_number })
}

/// The receiving side attaches its final acknowledgement, the sending side has none to give
pub fn terminate_sequence_response(version: ReliableMessagingVersion, identifier: UniqueId, relates_to: Option<UniqueId>, final_ack: Option<AcknowledgementHeader>) -> Message {
    let response = Message::wsrm(version, WsrmAction::TerminateSequenceResponse, MessageBody::TerminateSequenceResponse { identifier })
        .with_relates_to(relates_to);
    match final_ack {
        Some(ack) => response.with_header(WsrmHeader::SequenceAcknowledgement(ack)),
        None => response,
    }
}
