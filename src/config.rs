use std::time::Duration;

use anyhow::bail;

use crate::version::ReliableMessagingVersion;

/// Time slice of a single attempt of a requestor (CreateSequence, CloseSequence, ...). Longer
///  exchanges are split into several attempts.
pub const REQUESTOR_ITERATION_TIME: Duration = Duration::from_secs(10);

/// Assumed CreateSequence round trip time before the first one completed
pub const UNKNOWN_INITIATION_TIME: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ReliableSessionConfig {
    pub reliable_messaging_version: ReliableMessagingVersion,

    /// If nothing is received from the remote side for this long, the session faults. The
    ///  remote side is expected to use the same value, which is why keep-alive traffic is
    ///  derived from it.
    ///
    /// Keep-alive polls are only sent by request-reply output channels. A duplex sequence whose
    ///  application stops sending therefore faults on both ends once this elapses.
    pub inactivity_timeout: Duration,

    /// number of times a message is re-sent before the sequence is given up
    pub max_retry_count: u32,

    /// maximum number of sent but unacknowledged messages
    pub max_transfer_window_size: usize,

    /// honor the remote side's 'buffer remaining' acknowledgement extension
    pub flow_control_enabled: bool,

    pub ordered: bool,

    /// Retransmission starts at this interval and doubles with every retry up to
    ///  `max_retransmission_interval`
    pub initial_retransmission_interval: Duration,
    pub max_retransmission_interval: Duration,

    pub default_open_timeout: Duration,
    pub default_send_timeout: Duration,
    pub default_close_timeout: Duration,
    /// poll interval of the receive loop; it only bounds how long a single receive call blocks
    pub receive_poll_interval: Duration,

    /// the binder runs over a secure conversation session (adds the 'uses sequence STR' header
    ///  to 1.1 CreateSequence requests)
    pub secure_conversation: bool,

    /// upper limit for the number of disjoint ranges a receiver tracks
    pub max_sequence_ranges: usize,
}

impl ReliableSessionConfig {
    pub fn new(reliable_messaging_version: ReliableMessagingVersion) -> ReliableSessionConfig {
        ReliableSessionConfig {
            reliable_messaging_version,
            inactivity_timeout: Duration::from_secs(600),
            max_retry_count: 8,
            max_transfer_window_size: 8,
            flow_control_enabled: true,
            ordered: true,
            initial_retransmission_interval: Duration::from_secs(1),
            max_retransmission_interval: Duration::from_secs(60),
            default_open_timeout: Duration::from_secs(60),
            default_send_timeout: Duration::from_secs(60),
            default_close_timeout: Duration::from_secs(60),
            receive_poll_interval: Duration::from_secs(1),
            secure_conversation: false,
            max_sequence_ranges: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inactivity_timeout.is_zero() {
            bail!("inactivity timeout must be positive");
        }
        if self.max_retry_count == 0 {
            bail!("max retry count must be at least 1");
        }
        if self.max_transfer_window_size == 0 {
            bail!("max transfer window size must be at least 1");
        }
        if self.initial_retransmission_interval.is_zero() {
            bail!("initial retransmission interval must be positive");
        }
        if self.max_retransmission_interval < self.initial_retransmission_interval {
            bail!("max retransmission interval must not be smaller than the initial retransmission interval");
        }
        if self.receive_poll_interval.is_zero() {
            bail!("receive poll interval must be positive");
        }
        if self.max_sequence_ranges == 0 {
            bail!("max sequence ranges must be at least 1");
        }
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.reliable_messaging_version.keep_alive_interval(self.inactivity_timeout, self.max_retry_count)
    }
}
