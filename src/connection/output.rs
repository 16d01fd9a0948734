use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::ReliableSessionConfig;
use crate::fault::{ReliableSessionError, WsrmFault};
use crate::message::{self, Message};
use crate::sequence_range::SequenceRangeCollection;
use crate::sync::interruptible_timer::{InterruptibleTimer, TimerFuture};
use crate::sync::wait_object::InterruptibleWaitObject;
use crate::timeout_helper::TimeoutHelper;
use crate::unique_id::UniqueId;

/// One transmission of a sequenced message. The message already carries its Sequence header.
#[derive(Clone, Debug)]
pub struct MessageAttemptInfo {
    pub message: Message,
    pub sequence_number: i64,
    /// 0 for the first transmission
    pub retry_count: u32,
}

/// What the connection needs from its channel
#[async_trait]
pub trait OutputConnectionHandler: Send + Sync + 'static {
    /// `mask_unhandled` is set for retransmissions, which nobody waits for
    async fn send_attempt(&self, attempt: MessageAttemptInfo, timeout: Duration, mask_unhandled: bool) -> Result<(), ReliableSessionError>;
    async fn send_ack_requested(&self, timeout: Duration) -> Result<(), ReliableSessionError>;
    /// a retransmission failed in a way the connection cannot recover from
    fn on_connection_exception(&self, error: ReliableSessionError);
}

struct PendingMessage {
    message: Message,
    retry_count: u32,
}

struct OutputState {
    last_assigned: i64,
    closed: bool,
    terminal: Option<ReliableSessionError>,
    /// sent but not yet acknowledged, by message number
    window: BTreeMap<i64, PendingMessage>,
    acknowledged: SequenceRangeCollection,
    buffer_remaining: Option<i32>,
    retry_interval: Duration,
}

impl OutputState {
    fn quota(&self, config: &ReliableSessionConfig) -> usize {
        let window_quota = config.max_transfer_window_size.saturating_sub(self.window.len());
        match (config.flow_control_enabled, self.buffer_remaining) {
            (true, Some(remaining)) => {
                let remaining = usize::try_from(remaining).unwrap_or(0);
                // an empty window gets no acknowledgements, so it must be allowed to probe
                if self.window.is_empty() {
                    window_quota.min(remaining.max(1))
                }
                else {
                    window_quota.min(remaining)
                }
            }
            _ => window_quota,
        }
    }
}

/// The sending half of a sequence: numbers messages, keeps them until they are acknowledged and
///  retransmits them with exponential backoff.
pub struct ReliableOutputConnection {
    id: UniqueId,
    config: Arc<ReliableSessionConfig>,
    handler: Weak<dyn OutputConnectionHandler>,
    state: Mutex<OutputState>,
    quota_changed: Notify,
    /// set once the connection is closed and everything was acknowledged
    drained: InterruptibleWaitObject,
    retry_timer: InterruptibleTimer,
}

impl ReliableOutputConnection {
    pub fn new(id: UniqueId, config: Arc<ReliableSessionConfig>, handler: Weak<dyn OutputConnectionHandler>) -> Arc<ReliableOutputConnection> {
        Arc::new_cyclic(|weak_self: &Weak<ReliableOutputConnection>| {
            let weak_self = weak_self.clone();
            let retry_timer = InterruptibleTimer::new("retry", config.initial_retransmission_interval, Arc::new(move || -> TimerFuture {
                let connection = weak_self.clone();
                Box::pin(async move {
                    if let Some(connection) = connection.upgrade() {
                        connection.on_retry_elapsed().await;
                    }
                })
            }));

            ReliableOutputConnection {
                id,
                state: Mutex::new(OutputState {
                    last_assigned: 0,
                    closed: false,
                    terminal: None,
                    window: BTreeMap::new(),
                    acknowledged: SequenceRangeCollection::empty(),
                    buffer_remaining: None,
                    retry_interval: config.initial_retransmission_interval,
                }),
                config,
                handler,
                quota_changed: Notify::new(),
                drained: InterruptibleWaitObject::new(false),
                retry_timer,
            }
        })
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    /// Numbers the message and sends it, waiting for transfer window quota if necessary.
    ///  Returns false if the connection was closed in the meantime.
    pub async fn add_message(&self, message: Message, timeout: Duration) -> Result<bool, ReliableSessionError> {
        let helper = TimeoutHelper::new(timeout);

        let (number, stamped) = loop {
            let quota_changed = self.quota_changed.notified();
            {
                let mut state = self.state.lock();
                if let Some(e) = &state.terminal {
                    return Err(e.clone());
                }
                if state.closed {
                    return Ok(false);
                }
                if state.quota(&self.config) > 0 {
                    state.last_assigned += 1;
                    let number = state.last_assigned;
                    let mut stamped = message.clone();
                    stamped.set_sequence(self.id, number, false);
                    state.window.insert(number, PendingMessage { message: stamped.clone(), retry_count: 0 });
                    break (number, stamped);
                }
            }

            trace!("sequence {}: waiting for transfer window quota", self.id);
            if tokio::time::timeout(helper.remaining(), quota_changed).await.is_err() {
                return Err(ReliableSessionError::Timeout(format!("no transfer window quota became available on sequence {} within {:?}", self.id, timeout)));
            }
        };

        self.retry_timer.set_if_not_set(self.retry_interval());
        trace!("sequence {}: sending message {}", self.id, number);
        self.send(MessageAttemptInfo { message: stamped, sequence_number: number, retry_count: 0 }, helper.remaining(), false).await?;
        Ok(true)
    }

    async fn send(&self, attempt: MessageAttemptInfo, timeout: Duration, mask_unhandled: bool) -> Result<(), ReliableSessionError> {
        match self.handler.upgrade() {
            Some(handler) => handler.send_attempt(attempt, timeout, mask_unhandled).await,
            None => Err(ReliableSessionError::Aborted),
        }
    }

    fn retry_interval(&self) -> Duration {
        self.state.lock().retry_interval
    }

    /// Applies an acknowledgement. Returns the fault to send if the acknowledgement claims
    ///  messages that were never sent, or drops messages it acknowledged before.
    pub fn process_transferred(&self, ranges: &SequenceRangeCollection, buffer_remaining: Option<i32>) -> Result<(), WsrmFault> {
        let (window_empty, progressed, drained) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return Ok(());
            }
            if ranges.highest() > state.last_assigned || !ranges.covers(&state.acknowledged) {
                return Err(WsrmFault::invalid_acknowledgement(self.id, ranges));
            }

            let before = state.window.len();
            state.window.retain(|n, _| !ranges.contains(*n));
            let progressed = state.window.len() < before;

            state.acknowledged = ranges.clone();
            if self.config.flow_control_enabled {
                state.buffer_remaining = buffer_remaining;
            }
            if progressed {
                state.retry_interval = self.config.initial_retransmission_interval;
            }
            let window_empty = state.window.is_empty();
            (window_empty, progressed, state.closed && window_empty)
        };

        if window_empty {
            self.retry_timer.cancel();
        }
        else if progressed {
            self.retry_timer.set_interval(self.retry_interval());
        }
        self.quota_changed.notify_waiters();
        if drained {
            debug!("sequence {}: all messages acknowledged", self.id);
            self.drained.set();
        }
        Ok(())
    }

    async fn on_retry_elapsed(&self) {
        let (attempts, next_interval) = {
            let mut state = self.state.lock();
            if state.terminal.is_some() || state.window.is_empty() {
                return;
            }
            let attempts: Vec<MessageAttemptInfo> = state.window.iter_mut()
                .map(|(number, pending)| {
                    pending.retry_count += 1;
                    MessageAttemptInfo {
                        message: pending.message.clone(),
                        sequence_number: *number,
                        retry_count: pending.retry_count,
                    }
                })
                .collect();
            state.retry_interval = (state.retry_interval * 2).min(self.config.max_retransmission_interval);
            (attempts, state.retry_interval)
        };

        let handler = match self.handler.upgrade() {
            Some(handler) => handler,
            None => return,
        };

        debug!("sequence {}: retransmitting {} message(s)", self.id, attempts.len());
        for attempt in attempts {
            if let Err(e) = handler.send_attempt(attempt, self.config.default_send_timeout, true).await {
                self.on_retry_failed(handler.as_ref(), e);
                return;
            }
            if self.is_terminal() {
                return;
            }
        }
        if let Err(e) = handler.send_ack_requested(self.config.default_send_timeout).await {
            self.on_retry_failed(handler.as_ref(), e);
            return;
        }

        let pending = {
            let state = self.state.lock();
            state.terminal.is_none() && !state.window.is_empty()
        };
        if pending {
            self.retry_timer.set_interval(next_interval);
        }
    }

    fn on_retry_failed(&self, handler: &dyn OutputConnectionHandler, e: ReliableSessionError) {
        if !self.is_terminal() {
            handler.on_connection_exception(e);
        }
    }

    /// Stops accepting messages and waits until everything sent was acknowledged. Feb2005
    ///  sequences are ended with a LastMessage marker, which is sent here.
    pub async fn close(&self, timeout: Duration) -> Result<(), ReliableSessionError> {
        let helper = TimeoutHelper::new(timeout);
        let version = self.config.reliable_messaging_version;

        let (last_message, drained) = {
            let mut state = self.state.lock();
            if let Some(e) = &state.terminal {
                return Err(e.clone());
            }
            let mut last_message = None;
            if !state.closed {
                state.closed = true;
                if version.supports_last_message_marker() {
                    state.last_assigned += 1;
                    let number = state.last_assigned;
                    let msg = message::last_message(version, self.id, number);
                    state.window.insert(number, PendingMessage { message: msg.clone(), retry_count: 0 });
                    last_message = Some(MessageAttemptInfo { message: msg, sequence_number: number, retry_count: 0 });
                }
            }
            (last_message, state.window.is_empty())
        };

        self.quota_changed.notify_waiters();
        if drained {
            self.drained.set();
        }
        if let Some(attempt) = last_message {
            self.retry_timer.set_if_not_set(self.retry_interval());
            self.send(attempt, helper.remaining(), false).await?;
        }

        match self.drained.wait(helper.remaining()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReliableSessionError::Timeout(format!("not all messages on sequence {} were acknowledged within {:?}", self.id, timeout))),
            Err(e) => Err(e),
        }
    }

    /// The number of the last message: final once the connection is closed
    pub fn last(&self) -> i64 {
        self.state.lock().last_assigned
    }

    pub fn is_last_known(&self) -> bool {
        self.state.lock().closed
    }

    /// true once the connection is closed and every message was acknowledged
    pub fn check_for_termination(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.window.is_empty()
    }

    /// true while a sent message waits for its acknowledgement
    pub fn has_unacknowledged(&self) -> bool {
        !self.state.lock().window.is_empty()
    }

    pub fn quota_remaining(&self) -> usize {
        self.state.lock().quota(&self.config)
    }

    pub fn acknowledged(&self) -> SequenceRangeCollection {
        self.state.lock().acknowledged.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Releases everything blocked in the connection with the error. Idempotent, the first
    ///  error sticks.
    pub fn fault(&self, error: ReliableSessionError) {
        {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(error.clone());
        }
        self.retry_timer.abort();
        self.drained.fault(error);
        self.quota_changed.notify_waiters();
    }

    pub fn abort(&self) {
        self.fault(ReliableSessionError::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultCode;
    use crate::message::MessageBody;
    use crate::sequence_range::SequenceRange;
    use crate::version::ReliableMessagingVersion::{self, *};
    use bytes::Bytes;
    use tokio::time::{self, Instant};

    #[derive(Default)]
    struct RecordingHandler {
        attempts: Mutex<Vec<(i64, u32, Duration)>>,
        ack_requests: Mutex<u32>,
        exceptions: Mutex<Vec<ReliableSessionError>>,
        started: Mutex<Option<Instant>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<RecordingHandler> {
            let handler = RecordingHandler::default();
            *handler.started.lock() = Some(Instant::now());
            Arc::new(handler)
        }

        fn attempts(&self) -> Vec<(i64, u32)> {
            self.attempts.lock()
                .iter()
                .map(|(n, r, _)| (*n, *r))
                .collect()
        }

        fn attempt_times(&self) -> Vec<Duration> {
            self.attempts.lock()
                .iter()
                .map(|(_, _, t)| *t)
                .collect()
        }
    }

    #[async_trait]
    impl OutputConnectionHandler for RecordingHandler {
        async fn send_attempt(&self, attempt: MessageAttemptInfo, _timeout: Duration, _mask_unhandled: bool) -> Result<(), ReliableSessionError> {
            let elapsed = self.started.lock().map(|s| s.elapsed()).unwrap_or_default();
            assert_eq!(attempt.message.sequence_header().map(|h| h.number), Some(attempt.sequence_number));
            self.attempts.lock().push((attempt.sequence_number, attempt.retry_count, elapsed));
            Ok(())
        }

        async fn send_ack_requested(&self, _timeout: Duration) -> Result<(), ReliableSessionError> {
            *self.ack_requests.lock() += 1;
            Ok(())
        }

        fn on_connection_exception(&self, error: ReliableSessionError) {
            self.exceptions.lock().push(error);
        }
    }

    fn config(version: ReliableMessagingVersion, window: usize) -> Arc<ReliableSessionConfig> {
        let mut config = ReliableSessionConfig::new(version);
        config.max_transfer_window_size = window;
        config.initial_retransmission_interval = Duration::from_secs(1);
        config.max_retransmission_interval = Duration::from_secs(4);
        Arc::new(config)
    }

    fn connection(version: ReliableMessagingVersion, window: usize, handler: &Arc<RecordingHandler>) -> Arc<ReliableOutputConnection> {
        let weak_handler: Weak<RecordingHandler> = Arc::downgrade(handler);
        ReliableOutputConnection::new(UniqueId::from_raw(7), config(version, window), weak_handler)
    }

    fn app_message() -> Message {
        Message::application("urn:app/Op", Bytes::from_static(b"payload"))
    }

    fn acked(upper: i64) -> SequenceRangeCollection {
        SequenceRangeCollection::from_wire(vec![SequenceRange::new(1, upper).unwrap()]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_blocks_until_acknowledged() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 2, &handler);

        assert!(connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap());
        assert!(connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap());
        assert_eq!(connection.quota_remaining(), 0);

        let c = connection.clone();
        let blocked = tokio::spawn(async move { c.add_message(app_message(), Duration::from_secs(10)).await });
        time::sleep(Duration::from_millis(500)).await;
        assert!(!blocked.is_finished());

        connection.process_transferred(&acked(1), None).unwrap();
        assert!(blocked.await.unwrap().unwrap());
        assert_eq!(handler.attempts(), vec![(1, 0), (2, 0), (3, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_wait_times_out() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 1, &handler);
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();
        let result = connection.add_message(app_message(), Duration::from_millis(500)).await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_backs_off_until_acknowledged() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 8, &handler);
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();

        time::sleep(Duration::from_millis(11_500)).await;
        assert_eq!(handler.attempts(), vec![(1, 0), (1, 1), (1, 2), (1, 3), (1, 4)]);
        assert_eq!(handler.attempt_times(), vec![
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(7),
            Duration::from_secs(11),
        ]);
        assert_eq!(*handler.ack_requests.lock(), 4);

        connection.process_transferred(&acked(1), None).unwrap();
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(handler.attempts().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_acknowledgements() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 8, &handler);
        for _ in 0..3 {
            connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();
        }

        let fault = connection.process_transferred(&acked(5), None).unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidAcknowledgement);

        connection.process_transferred(&acked(2), None).unwrap();
        // acknowledging less than before is a violation too
        assert!(connection.process_transferred(&acked(1), None).is_err());
        connection.process_transferred(&acked(3), None).unwrap();
        assert_eq!(connection.acknowledged(), acked(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_acknowledgements() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 8, &handler);
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();

        let c = connection.clone();
        let closing = tokio::spawn(async move { c.close(Duration::from_secs(30)).await });
        time::sleep(Duration::from_millis(100)).await;
        assert!(!closing.is_finished());
        assert!(connection.is_last_known());
        assert!(!connection.add_message(app_message(), Duration::from_secs(1)).await.unwrap());

        connection.process_transferred(&acked(2), None).unwrap();
        closing.await.unwrap().unwrap();
        assert_eq!(connection.last(), 2);
        assert!(connection.check_for_termination());
    }

    #[tokio::test(start_paused = true)]
    async fn test_feb2005_close_sends_last_message() {
        let handler = RecordingHandler::new();
        let connection = connection(WsrmFeb2005, 8, &handler);
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();

        let c = connection.clone();
        let closing = tokio::spawn(async move { c.close(Duration::from_secs(30)).await });
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.attempts(), vec![(1, 0), (2, 0)]);

        connection.process_transferred(&acked(2), None).unwrap();
        closing.await.unwrap().unwrap();
        assert_eq!(connection.last(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_releases_waiters() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 8, &handler);
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();

        let c = connection.clone();
        let closing = tokio::spawn(async move { c.close(Duration::from_secs(30)).await });
        time::sleep(Duration::from_millis(100)).await;

        connection.fault(ReliableSessionError::RemoteFault("gone".to_string()));
        connection.abort();
        assert!(matches!(closing.await.unwrap(), Err(ReliableSessionError::RemoteFault(_))));
        assert!(matches!(connection.add_message(app_message(), Duration::from_secs(1)).await, Err(ReliableSessionError::RemoteFault(_))));

        let attempts = handler.attempts().len();
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handler.attempts().len(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_remaining_limits_quota() {
        let handler = RecordingHandler::new();
        let connection = connection(Wsrm11, 8, &handler);
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();
        connection.add_message(app_message(), Duration::from_secs(10)).await.unwrap();

        connection.process_transferred(&acked(1), Some(0)).unwrap();
        assert_eq!(connection.quota_remaining(), 0);

        connection.process_transferred(&acked(2), Some(0)).unwrap();
        // nothing in flight: one probe is allowed
        assert_eq!(connection.quota_remaining(), 1);

        connection.process_transferred(&acked(2), Some(3)).unwrap();
        assert_eq!(connection.quota_remaining(), 3);
    }

    #[test]
    fn test_last_message_marker() {
        let msg = message::last_message(WsrmFeb2005, UniqueId::from_raw(7), 4);
        assert_eq!(msg.body, MessageBody::Empty);
        assert!(msg.sequence_header().map(|h| h.last_message).unwrap_or(false));
    }
}
