use std::fmt::{Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::message::{FaultBody, Message, MessageBody};
use crate::sequence_range::SequenceRangeCollection;
use crate::unique_id::UniqueId;
use crate::version::{ReliableMessagingVersion, WsrmAction};

/// Why a sequence was terminated. This travels with the `SequenceTerminated` fault so the remote
///  side can tell "we gave up" from "you violated the protocol".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TerminationReason {
    Protocol,
    Communication,
    MaxRetryCountExceeded,
    InactivityTimeout,
    QuotaExceeded,
    Aborted,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultCode {
    SequenceTerminated(TerminationReason),
    UnknownSequence,
    InvalidAcknowledgement,
    MessageNumberRollover,
    LastMessageNumberExceeded,
    SequenceClosed,
    CreateSequenceRefused,
    WsrmRequired,
    /// a SOAP fault that is not defined by WSRM
    Other(String),
}

impl FaultCode {
    pub fn is_wsrm(&self) -> bool {
        !matches!(self, FaultCode::Other(_))
    }
}

impl Display for FaultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultCode::SequenceTerminated(reason) => write!(f, "SequenceTerminated({:?})", reason),
            FaultCode::Other(code) => write!(f, "{}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A fault this endpoint owes the remote side, or one it received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WsrmFault {
    pub code: FaultCode,
    pub sequence_id: Option<UniqueId>,
    pub reason: String,
}

impl WsrmFault {
    pub fn new(code: FaultCode, sequence_id: Option<UniqueId>, reason: impl Into<String>) -> WsrmFault {
        WsrmFault {
            code,
            sequence_id,
            reason: reason.into(),
        }
    }

    pub fn sequence_terminated(sequence_id: UniqueId, reason: TerminationReason, text: impl Into<String>) -> WsrmFault {
        WsrmFault::new(FaultCode::SequenceTerminated(reason), Some(sequence_id), text)
    }

    pub fn protocol(sequence_id: UniqueId, text: impl Into<String>) -> WsrmFault {
        WsrmFault::sequence_terminated(sequence_id, TerminationReason::Protocol, text)
    }

    pub fn unknown_sequence(sequence_id: UniqueId) -> WsrmFault {
        WsrmFault::new(FaultCode::UnknownSequence, Some(sequence_id), format!("the sequence {} is unknown", sequence_id))
    }

    pub fn invalid_acknowledgement(sequence_id: UniqueId, ranges: &SequenceRangeCollection) -> WsrmFault {
        WsrmFault::new(
            FaultCode::InvalidAcknowledgement,
            Some(sequence_id),
            format!("the acknowledgement {} for sequence {} violates the protocol", ranges, sequence_id),
        )
    }

    pub fn max_retry_count_exceeded(sequence_id: UniqueId) -> WsrmFault {
        WsrmFault::sequence_terminated(
            sequence_id,
            TerminationReason::MaxRetryCountExceeded,
            "the maximum retry count was exceeded before the message was acknowledged",
        )
    }

    pub fn last_message_number_exceeded(sequence_id: UniqueId) -> WsrmFault {
        WsrmFault::new(
            FaultCode::LastMessageNumberExceeded,
            Some(sequence_id),
            format!("a message beyond the declared last message was received on sequence {}", sequence_id),
        )
    }

    pub fn sequence_closed(sequence_id: UniqueId) -> WsrmFault {
        WsrmFault::new(FaultCode::SequenceClosed, Some(sequence_id), format!("the sequence {} is closed", sequence_id))
    }

    pub fn is_unknown_sequence(&self) -> bool {
        self.code == FaultCode::UnknownSequence
    }

    pub fn from_body(body: &FaultBody) -> WsrmFault {
        WsrmFault::new(body.code.clone(), body.sequence_id, body.reason.clone())
    }

    /// The wire representation of this fault
    pub fn to_message(&self, version: ReliableMessagingVersion) -> Message {
        let action = version.action_uri(WsrmAction::Fault)
            .unwrap_or_default();
        Message::new(action, MessageBody::Fault(FaultBody {
            code: self.code.clone(),
            sequence_id: self.sequence_id,
            reason: self.reason.clone(),
        }))
    }

    /// The error raised locally when this fault is sent by this side
    pub fn to_local_error(&self) -> ReliableSessionError {
        match &self.code {
            FaultCode::SequenceTerminated(TerminationReason::Protocol) |
            FaultCode::UnknownSequence |
            FaultCode::InvalidAcknowledgement |
            FaultCode::LastMessageNumberExceeded |
            FaultCode::SequenceClosed |
            FaultCode::MessageNumberRollover |
            FaultCode::WsrmRequired => ReliableSessionError::Protocol(self.reason.clone()),
            FaultCode::SequenceTerminated(TerminationReason::QuotaExceeded) => ReliableSessionError::QuotaExceeded(self.reason.clone()),
            FaultCode::CreateSequenceRefused => ReliableSessionError::CreateSequenceRefused(self.reason.clone()),
            _ => ReliableSessionError::communication(self.reason.clone(), None),
        }
    }

    /// The error raised locally when the remote side sends this fault
    pub fn to_remote_error(&self) -> ReliableSessionError {
        match &self.code {
            FaultCode::CreateSequenceRefused => ReliableSessionError::CreateSequenceRefused(self.reason.clone()),
            code => ReliableSessionError::RemoteFault(format!("{}: {}", code, self.reason)),
        }
    }
}

pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync>;

/// The terminal error of a session or channel. It is cloned to every operation that was blocked
///  when the session faulted.
#[derive(Debug, Clone, Error)]
pub enum ReliableSessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("the remote endpoint faulted the sequence: {0}")]
    RemoteFault(String),
    #[error("communication failure: {message}")]
    Communication {
        message: String,
        #[source]
        cause: Option<ErrorCause>,
    },
    #[error("the remote endpoint refused to create a sequence: {0}")]
    CreateSequenceRefused(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("the channel was aborted")]
    Aborted,
    #[error("the channel is closed")]
    Closed,
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ReliableSessionError {
    pub fn communication(message: impl Into<String>, cause: Option<anyhow::Error>) -> ReliableSessionError {
        ReliableSessionError::Communication {
            message: message.into(),
            cause: cause.map(to_cause),
        }
    }

    /// wraps a transport error
    pub fn transport(e: anyhow::Error) -> ReliableSessionError {
        ReliableSessionError::Communication {
            message: e.to_string(),
            cause: Some(to_cause(e)),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReliableSessionError::Timeout(_))
    }
}

pub fn to_cause(e: anyhow::Error) -> ErrorCause {
    let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
    Arc::from(boxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::error::Error;

    #[rstest]
    #[case::protocol(WsrmFault::protocol(UniqueId::from_raw(1), "x"), "protocol violation: x")]
    #[case::unknown(WsrmFault::unknown_sequence(UniqueId::from_raw(1)), "protocol violation: the sequence urn:uuid:00000000-0000-0000-0000-000000000001 is unknown")]
    #[case::retry(WsrmFault::max_retry_count_exceeded(UniqueId::from_raw(1)), "communication failure: the maximum retry count was exceeded before the message was acknowledged")]
    #[case::quota(WsrmFault::sequence_terminated(UniqueId::from_raw(1), TerminationReason::QuotaExceeded, "full"), "quota exceeded: full")]
    fn test_local_error(#[case] fault: WsrmFault, #[case] expected: &str) {
        assert_eq!(fault.to_local_error().to_string(), expected);
    }

    #[test]
    fn test_to_message() {
        let fault = WsrmFault::max_retry_count_exceeded(UniqueId::from_raw(7));
        let msg = fault.to_message(ReliableMessagingVersion::WsrmFeb2005);
        assert_eq!(msg.action, "http://schemas.xmlsoap.org/ws/2005/02/rm/fault");
        match &msg.body {
            MessageBody::Fault(body) => {
                assert_eq!(body.code, FaultCode::SequenceTerminated(TerminationReason::MaxRetryCountExceeded));
                assert_eq!(WsrmFault::from_body(body), fault);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_transport_error_keeps_cause() {
        let e = ReliableSessionError::transport(anyhow::anyhow!("connection reset"));
        assert_eq!(e.to_string(), "communication failure: connection reset");
        assert!(e.source().is_some());
        assert!(e.clone().source().is_some());
    }
}
