//! Checks that every sequence identifier in an incoming message belongs to this session and that
//!  the message is legal in the session's shape. Each check returns the fault this side owes the
//!  remote endpoint, or `None` if the message is acceptable.

use crate::fault::WsrmFault;
use crate::message_info::WsrmMessageInfo;
use crate::unique_id::UniqueId;
use crate::version::ReliableMessagingVersion;

/// The identifiers of the session that verifies a message
#[derive(Copy, Clone, Debug)]
pub struct VerifyContext {
    pub version: ReliableMessagingVersion,
    pub input_id: Option<UniqueId>,
    pub output_id: Option<UniqueId>,
}

impl VerifyContext {
    fn is_input(&self, id: UniqueId) -> bool {
        self.input_id == Some(id)
    }

    fn is_output(&self, id: UniqueId) -> bool {
        self.output_id == Some(id)
    }

    /// faults relate to the sequence this side received on if there is one
    fn fault_id(&self, fallback: UniqueId) -> UniqueId {
        self.input_id.or(self.output_id).unwrap_or(fallback)
    }

    fn protocol(&self, id: UniqueId, text: String) -> Option<WsrmFault> {
        Some(WsrmFault::protocol(id, text))
    }
}

/// Elements that do not exist in Feb2005. The parser rejects their actions, this catches what
///  slips through in headers.
fn verify_dialect(ctx: &VerifyContext, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if ctx.version != ReliableMessagingVersion::WsrmFeb2005 {
        return None;
    }
    let v11_element = info.close_sequence_info.as_ref().map(|i| i.identifier)
        .or(info.close_sequence_response_info.as_ref().map(|i| i.identifier))
        .or(info.terminate_sequence_response_info.as_ref().map(|i| i.identifier))
        .or(info.acknowledgement_info.as_ref().filter(|a| a.final_ack).map(|a| a.id));
    match v11_element {
        Some(id) => ctx.protocol(ctx.fault_id(id), format!("the message with action {} contains an element that does not exist in WS-ReliableMessaging February 2005", info.action())),
        None => None,
    }
}

/// A session that both sends and receives: acknowledgements must be for the output sequence,
///  sequenced messages and ack requests for the input sequence.
pub fn verify_duplex(ctx: &VerifyContext, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if let Some(fault) = verify_dialect(ctx, info) {
        return Some(fault);
    }

    if let Some(ack) = &info.acknowledgement_info {
        if !ctx.is_output(ack.id) {
            return Some(WsrmFault::unknown_sequence(ack.id));
        }
    }
    if let Some(id) = info.ack_requested_info {
        if !ctx.is_input(id) {
            return Some(WsrmFault::unknown_sequence(id));
        }
    }
    if let Some(sequence) = &info.sequenced_message_info {
        if !ctx.is_input(sequence.id) {
            return Some(WsrmFault::unknown_sequence(sequence.id));
        }
    }

    if let Some(terminate) = &info.terminate_sequence_info {
        let id = terminate.identifier;
        if !ctx.is_input(id) {
            match ctx.version {
                ReliableMessagingVersion::WsrmFeb2005 => {
                    if let Some(output_id) = ctx.output_id {
                        return ctx.protocol(output_id, format!("TerminateSequence for sequence {} is not supported, only the receiving side may terminate a sequence", id));
                    }
                    return Some(WsrmFault::unknown_sequence(id));
                }
                ReliableMessagingVersion::Wsrm11 => {
                    if !ctx.is_output(id) {
                        return Some(WsrmFault::unknown_sequence(id));
                    }
                }
            }
        }
    }
    if let Some(response) = &info.terminate_sequence_response_info {
        if !ctx.is_output(response.identifier) {
            return Some(WsrmFault::unknown_sequence(response.identifier));
        }
    }

    if let Some(close) = &info.close_sequence_info {
        let id = close.identifier;
        if !ctx.is_input(id) {
            if ctx.is_output(id) {
                return ctx.protocol(ctx.fault_id(id), format!("CloseSequence for the sending sequence {} is not supported", id));
            }
            return Some(WsrmFault::unknown_sequence(id));
        }
    }
    if let Some(response) = &info.close_sequence_response_info {
        let id = response.identifier;
        if !ctx.is_output(id) {
            if ctx.is_input(id) {
                return ctx.protocol(id, format!("unexpected CloseSequenceResponse for the receiving sequence {}", id));
            }
            return Some(WsrmFault::unknown_sequence(id));
        }
    }

    None
}

/// The sending side of a one-way session. It receives nothing but acknowledgements and the
///  responses to its own shutdown requests.
pub fn verify_simplex_sender(ctx: &VerifyContext, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if let Some(fault) = verify_dialect(ctx, info) {
        return Some(fault);
    }

    if let Some(ack) = &info.acknowledgement_info {
        if !ctx.is_output(ack.id) {
            return Some(WsrmFault::unknown_sequence(ack.id));
        }
    }
    if let Some(id) = info.ack_requested_info {
        return ctx.protocol(ctx.fault_id(id), format!("unexpected AckRequested for sequence {}, this side only sends", id));
    }
    if info.create_sequence_info.is_some() {
        let id = ctx.output_id.unwrap_or_default();
        return ctx.protocol(id, "unexpected CreateSequence, this side only sends".to_string());
    }
    if let Some(sequence) = &info.sequenced_message_info {
        return Some(WsrmFault::unknown_sequence(sequence.id));
    }

    if let Some(terminate) = &info.terminate_sequence_info {
        let id = terminate.identifier;
        match ctx.version {
            ReliableMessagingVersion::WsrmFeb2005 => {
                return ctx.protocol(ctx.fault_id(id), format!("TerminateSequence for sequence {} is not supported, only the receiving side may terminate a sequence", id));
            }
            ReliableMessagingVersion::Wsrm11 => {
                if !ctx.is_output(id) {
                    return ctx.protocol(ctx.fault_id(id), format!("TerminateSequence for sequence {} does not address the sending sequence", id));
                }
            }
        }
    }
    if let Some(response) = &info.terminate_sequence_response_info {
        if !ctx.is_output(response.identifier) {
            return Some(WsrmFault::unknown_sequence(response.identifier));
        }
    }

    if let Some(close) = &info.close_sequence_info {
        let id = close.identifier;
        if ctx.is_output(id) {
            return ctx.protocol(id, format!("CloseSequence for the sending sequence {} is not supported", id));
        }
        return Some(WsrmFault::unknown_sequence(id));
    }
    if let Some(response) = &info.close_sequence_response_info {
        if !ctx.is_output(response.identifier) {
            return Some(WsrmFault::unknown_sequence(response.identifier));
        }
    }

    None
}

/// The receiving side of a one-way session. It never gets acknowledgements or responses, since
///  it sends no sequence and no requests of its own.
pub fn verify_simplex_receiver(ctx: &VerifyContext, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if let Some(fault) = verify_dialect(ctx, info) {
        return Some(fault);
    }

    if let Some(ack) = &info.acknowledgement_info {
        return ctx.protocol(ctx.fault_id(ack.id), format!("unexpected acknowledgement for sequence {}, this side only receives", ack.id));
    }
    if let Some(id) = info.ack_requested_info {
        if !ctx.is_input(id) {
            return Some(WsrmFault::unknown_sequence(id));
        }
    }
    if let Some(response) = &info.create_sequence_response_info {
        return ctx.protocol(ctx.fault_id(response.identifier), "unexpected CreateSequenceResponse, this side only receives".to_string());
    }
    if let Some(sequence) = &info.sequenced_message_info {
        if !ctx.is_input(sequence.id) {
            return Some(WsrmFault::unknown_sequence(sequence.id));
        }
    }

    if let Some(terminate) = &info.terminate_sequence_info {
        if !ctx.is_input(terminate.identifier) {
            return Some(WsrmFault::unknown_sequence(terminate.identifier));
        }
    }
    if let Some(response) = &info.terminate_sequence_response_info {
        return ctx.protocol(ctx.fault_id(response.identifier), "unexpected TerminateSequenceResponse, this side only receives".to_string());
    }

    if let Some(close) = &info.close_sequence_info {
        if !ctx.is_input(close.identifier) {
            return Some(WsrmFault::unknown_sequence(close.identifier));
        }
    }
    if let Some(response) = &info.close_sequence_response_info {
        return ctx.protocol(ctx.fault_id(response.identifier), "unexpected CloseSequenceResponse, this side only receives".to_string());
    }

    None
}

fn verify_final_ack(output_id: UniqueId, info: &WsrmMessageInfo, last: i64) -> Result<(), WsrmFault> {
    let ack = match &info.acknowledgement_info {
        Some(ack) if ack.final_ack => ack,
        _ => return Err(WsrmFault::protocol(output_id, "the response does not carry the final acknowledgement")),
    };
    if ack.ranges.is_complete_up_to(last) {
        Ok(())
    }
    else {
        Err(WsrmFault::invalid_acknowledgement(output_id, &ack.ranges))
    }
}

/// The reply to our CloseSequence must relate to it and carry a final acknowledgement of
///  exactly `[1, last]`
pub fn verify_close_sequence_response(output_id: UniqueId, request_id: Option<UniqueId>, info: &WsrmMessageInfo, last: i64) -> Result<(), WsrmFault> {
    let response = match &info.close_sequence_response_info {
        Some(response) => response,
        None => return Err(WsrmFault::protocol(output_id, format!("expected CloseSequenceResponse in reply to CloseSequence, received {}", info.action()))),
    };
    if response.relates_to != request_id {
        return Err(WsrmFault::protocol(output_id, "the CloseSequenceResponse does not relate to the CloseSequence request"));
    }
    verify_final_ack(output_id, info, last)
}

/// Like [verify_close_sequence_response]. An `UnknownSequence` fault is also accepted: the remote
///  side already forgot the sequence, which is what termination is for.
pub fn verify_terminate_sequence_response(output_id: UniqueId, request_id: Option<UniqueId>, info: &WsrmMessageInfo, last: i64) -> Result<(), WsrmFault> {
    if info.wsrm_header_fault.as_ref().map(|f| f.is_unknown_sequence()).unwrap_or(false) {
        return Ok(());
    }
    let response = match &info.terminate_sequence_response_info {
        Some(response) => response,
        None => return Err(WsrmFault::protocol(output_id, format!("expected TerminateSequenceResponse in reply to TerminateSequence, received {}", info.action()))),
    };
    if response.relates_to != request_id {
        return Err(WsrmFault::protocol(output_id, "the TerminateSequenceResponse does not relate to the TerminateSequence request"));
    }
    verify_final_ack(output_id, info, last)
}

/// Shutdown requests must ask for the reply to go where the session's traffic goes
pub fn verify_reply_to(fault_id: UniqueId, info: &WsrmMessageInfo, remote_address: &str) -> Result<(), WsrmFault> {
    let request = info.close_sequence_info.as_ref()
        .or(info.terminate_sequence_info.as_ref());
    match request.and_then(|r| r.reply_to.as_deref()) {
        Some(reply_to) if reply_to != remote_address => Err(WsrmFault::protocol(
            fault_id,
            format!("the ReplyTo address {} of {} differs from the session's remote address {}", reply_to, info.action(), remote_address),
        )),
        _ => Ok(()),
    }
}
