//! The two WS-ReliableMessaging dialects. Every behavior that differs between them is a function
//!  on [ReliableMessagingVersion] so the rest of the crate never branches on the dialect ad hoc.

use std::time::Duration;

const WSRM_FEB2005_NAMESPACE: &str = "http://schemas.xmlsoap.org/ws/2005/02/rm";
const WSRM_11_NAMESPACE: &str = "http://docs.oasis-open.org/ws-rx/wsrm/200702";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ReliableMessagingVersion {
    WsrmFeb2005,
    Wsrm11,
}

/// WSRM protocol actions. Not every action exists in both dialects.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WsrmAction {
    CreateSequence,
    CreateSequenceResponse,
    SequenceAcknowledgement,
    AckRequested,
    CloseSequence,
    CloseSequenceResponse,
    TerminateSequence,
    TerminateSequenceResponse,
    LastMessage,
    Fault,
}

impl WsrmAction {
    const ALL: [WsrmAction; 10] = [
        WsrmAction::CreateSequence,
        WsrmAction::CreateSequenceResponse,
        WsrmAction::SequenceAcknowledgement,
        WsrmAction::AckRequested,
        WsrmAction::CloseSequence,
        WsrmAction::CloseSequenceResponse,
        WsrmAction::TerminateSequence,
        WsrmAction::TerminateSequenceResponse,
        WsrmAction::LastMessage,
        WsrmAction::Fault,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            WsrmAction::CreateSequence => "CreateSequence",
            WsrmAction::CreateSequenceResponse => "CreateSequenceResponse",
            WsrmAction::SequenceAcknowledgement => "SequenceAcknowledgement",
            WsrmAction::AckRequested => "AckRequested",
            WsrmAction::CloseSequence => "CloseSequence",
            WsrmAction::CloseSequenceResponse => "CloseSequenceResponse",
            WsrmAction::TerminateSequence => "TerminateSequence",
            WsrmAction::TerminateSequenceResponse => "TerminateSequenceResponse",
            WsrmAction::LastMessage => "LastMessage",
            WsrmAction::Fault => "fault",
        }
    }
}

/// How a session that already considers its sequence closed reacts to an `UnknownSequence` fault
///  for one of its own identifiers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClosedUnknownSequenceHandling {
    /// discard the message, nothing else happens
    Drop,
    /// the fault is the expected answer to TerminateSequence, the caller keeps processing it
    Continue,
}

impl ReliableMessagingVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            ReliableMessagingVersion::WsrmFeb2005 => WSRM_FEB2005_NAMESPACE,
            ReliableMessagingVersion::Wsrm11 => WSRM_11_NAMESPACE,
        }
    }

    pub fn supports_action(&self, action: WsrmAction) -> bool {
        match action {
            WsrmAction::CloseSequence |
            WsrmAction::CloseSequenceResponse |
            WsrmAction::TerminateSequenceResponse => *self == ReliableMessagingVersion::Wsrm11,
            WsrmAction::LastMessage => *self == ReliableMessagingVersion::WsrmFeb2005,
            _ => true,
        }
    }

    /// The action URI, or None if the action does not exist in this dialect
    pub fn action_uri(&self, action: WsrmAction) -> Option<String> {
        if self.supports_action(action) {
            Some(format!("{}/{}", self.namespace(), action.suffix()))
        }
        else {
            None
        }
    }

    /// Maps an action URI to a WSRM action of *this* dialect. An action from the other dialect's
    ///  namespace is not recognized.
    pub fn parse_action(&self, uri: &str) -> Option<WsrmAction> {
        let suffix = uri.strip_prefix(self.namespace())?.strip_prefix('/')?;
        WsrmAction::ALL.iter()
            .find(|a| a.suffix() == suffix && self.supports_action(**a))
            .cloned()
    }

    /// true if the URI is in *any* dialect's WSRM namespace
    pub fn is_any_wsrm_uri(uri: &str) -> bool {
        uri.starts_with(WSRM_FEB2005_NAMESPACE) || uri.starts_with(WSRM_11_NAMESPACE)
    }

    /// Interval of keep-alive probes. It must stay well below the remote side's inactivity
    ///  timeout even if every probe but the last one is lost.
    pub fn keep_alive_interval(&self, inactivity_timeout: Duration, max_retry_count: u32) -> Duration {
        let divisor = max_retry_count.max(1).saturating_mul(2);
        inactivity_timeout / divisor
    }

    pub fn supports_close_sequence(&self) -> bool {
        *self == ReliableMessagingVersion::Wsrm11
    }

    /// 1.1 answers TerminateSequence with TerminateSequenceResponse, Feb2005 sends it one-way
    pub fn terminate_is_request_reply(&self) -> bool {
        *self == ReliableMessagingVersion::Wsrm11
    }

    pub fn supports_final_ack(&self) -> bool {
        *self == ReliableMessagingVersion::Wsrm11
    }

    pub fn supports_last_message_marker(&self) -> bool {
        *self == ReliableMessagingVersion::WsrmFeb2005
    }

    pub fn closed_unknown_sequence_handling(&self) -> ClosedUnknownSequenceHandling {
        match self {
            ReliableMessagingVersion::WsrmFeb2005 => ClosedUnknownSequenceHandling::Drop,
            ReliableMessagingVersion::Wsrm11 => ClosedUnknownSequenceHandling::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use ReliableMessagingVersion::*;

    #[rstest]
    #[case::create_feb(WsrmFeb2005, WsrmAction::CreateSequence, Some("http://schemas.xmlsoap.org/ws/2005/02/rm/CreateSequence"))]
    #[case::create_11(Wsrm11, WsrmAction::CreateSequence, Some("http://docs.oasis-open.org/ws-rx/wsrm/200702/CreateSequence"))]
    #[case::close_feb(WsrmFeb2005, WsrmAction::CloseSequence, None)]
    #[case::close_11(Wsrm11, WsrmAction::CloseSequence, Some("http://docs.oasis-open.org/ws-rx/wsrm/200702/CloseSequence"))]
    #[case::terminate_response_feb(WsrmFeb2005, WsrmAction::TerminateSequenceResponse, None)]
    #[case::last_message_feb(WsrmFeb2005, WsrmAction::LastMessage, Some("http://schemas.xmlsoap.org/ws/2005/02/rm/LastMessage"))]
    #[case::last_message_11(Wsrm11, WsrmAction::LastMessage, None)]
    #[case::fault_11(Wsrm11, WsrmAction::Fault, Some("http://docs.oasis-open.org/ws-rx/wsrm/200702/fault"))]
    fn test_action_uri(#[case] version: ReliableMessagingVersion, #[case] action: WsrmAction, #[case] expected: Option<&str>) {
        assert_eq!(version.action_uri(action).as_deref(), expected);
        if let Some(uri) = expected {
            assert_eq!(version.parse_action(uri), Some(action));
        }
    }

    #[rstest]
    #[case::other_dialect(WsrmFeb2005, "http://docs.oasis-open.org/ws-rx/wsrm/200702/CreateSequence")]
    #[case::unsupported(WsrmFeb2005, "http://schemas.xmlsoap.org/ws/2005/02/rm/CloseSequence")]
    #[case::application(Wsrm11, "urn:app/DoSomething")]
    #[case::bad_suffix(Wsrm11, "http://docs.oasis-open.org/ws-rx/wsrm/200702CreateSequence")]
    fn test_parse_action_unknown(#[case] version: ReliableMessagingVersion, #[case] uri: &str) {
        assert_eq!(version.parse_action(uri), None);
    }

    #[rstest]
    #[case::default(600, 8, 37_500)]
    #[case::single_retry(60, 1, 30_000)]
    #[case::zero_retries(60, 0, 30_000)]
    #[case::huge_retry_count(4_294_967_295, u32::MAX, 1_000)]
    fn test_keep_alive_interval(#[case] inactivity_secs: u64, #[case] max_retry_count: u32, #[case] expected_millis: u64) {
        for version in [WsrmFeb2005, Wsrm11] {
            assert_eq!(
                version.keep_alive_interval(Duration::from_secs(inactivity_secs), max_retry_count),
                Duration::from_millis(expected_millis)
            );
        }
    }

    #[test]
    fn test_dialect_flags() {
        assert!(!WsrmFeb2005.supports_close_sequence());
        assert!(Wsrm11.supports_close_sequence());
        assert!(!WsrmFeb2005.terminate_is_request_reply());
        assert!(Wsrm11.terminate_is_request_reply());
        assert_eq!(WsrmFeb2005.closed_unknown_sequence_handling(), ClosedUnknownSequenceHandling::Drop);
        assert_eq!(Wsrm11.closed_unknown_sequence_handling(), ClosedUnknownSequenceHandling::Continue);
    }
}
