use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::fault::WsrmFault;
use crate::message::{AcknowledgementHeader, Message};
use crate::sequence_range::SequenceRangeCollection;
use crate::unique_id::UniqueId;

#[derive(Debug)]
pub enum ReceiveOutcome {
    /// new message; these are ready for delivery to the application, in delivery order
    Accepted(Vec<Message>),
    /// the number was received before
    Duplicate,
    /// the number is beyond the declared last message of the sequence
    BeyondLast,
    /// accepting the number would exceed the number of ranges this side tracks; the message is
    ///  dropped unacknowledged and the sender will retransmit it
    RangesExceeded,
}

/// Receiving half of a sequence. Delivers every message number exactly once, in order if the
///  sequence is ordered.
///
/// `None` messages are placeholders (Feb2005 LastMessage markers) that occupy a number but
///  are not delivered.
pub struct ReliableInputConnection {
    id: UniqueId,
    ordered: bool,
    max_ranges: usize,
    ranges: SequenceRangeCollection,
    last: Option<i64>,
    /// no further messages are accepted (1.1 CloseSequence)
    closed: bool,
    next_to_deliver: i64,
    out_of_order: BTreeMap<i64, Option<Message>>,
}

impl ReliableInputConnection {
    pub fn new(id: UniqueId, ordered: bool, max_ranges: usize) -> ReliableInputConnection {
        ReliableInputConnection {
            id,
            ordered,
            max_ranges,
            ranges: SequenceRangeCollection::empty(),
            last: None,
            closed: false,
            next_to_deliver: 1,
            out_of_order: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    pub fn ranges(&self) -> &SequenceRangeCollection {
        &self.ranges
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// messages received but held back because an earlier number is missing
    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn receive(&mut self, number: i64, message: Option<Message>, last_marker: bool) -> ReceiveOutcome {
        if self.ranges.contains(number) {
            trace!("sequence {}: duplicate message {}", self.id, number);
            return ReceiveOutcome::Duplicate;
        }
        if self.last.map(|last| number > last).unwrap_or(false) {
            return ReceiveOutcome::BeyondLast;
        }
        if !self.ranges.can_merge(number, self.max_ranges) {
            debug!("sequence {}: dropping message {}, already tracking {} ranges", self.id, number, self.ranges.len());
            return ReceiveOutcome::RangesExceeded;
        }
        if last_marker {
            if self.ranges.highest() > number {
                return ReceiveOutcome::BeyondLast;
            }
            self.last = Some(number);
        }

        // can_merge guarantees a valid number here
        if self.ranges.merge(number).is_err() {
            return ReceiveOutcome::Duplicate;
        }

        if !self.ordered {
            return ReceiveOutcome::Accepted(message.into_iter().collect());
        }

        self.out_of_order.insert(number, message);
        let mut deliverable = Vec::new();
        while let Some(next) = self.out_of_order.remove(&self.next_to_deliver) {
            deliverable.extend(next);
            self.next_to_deliver += 1;
        }
        ReceiveOutcome::Accepted(deliverable)
    }

    /// Records the last message number the sender declared. Fails if messages beyond it were
    ///  already received, or a different last number was declared before.
    pub fn set_last(&mut self, last: i64) -> Result<(), WsrmFault> {
        if let Some(previous) = self.last {
            if previous != last {
                return Err(WsrmFault::protocol(self.id, format!("the last message number {} contradicts the previously declared {}", last, previous)));
            }
        }
        if self.ranges.highest() > last {
            return Err(WsrmFault::protocol(self.id, format!("message {} was received, but the last message number is {}", self.ranges.highest(), last)));
        }
        self.last = Some(last);
        Ok(())
    }

    /// Stops accepting messages. The last number defaults to the highest one received.
    pub fn close(&mut self, last: Option<i64>) -> Result<(), WsrmFault> {
        let last = last.unwrap_or_else(|| self.last.unwrap_or(self.ranges.highest()));
        self.set_last(last)?;
        self.closed = true;
        Ok(())
    }

    /// true once the last number is known and every number up to it was received
    pub fn is_complete(&self) -> bool {
        match self.last {
            Some(last) => self.ranges.is_complete_up_to(last),
            None => false,
        }
    }

    pub fn acknowledgement(&self, final_ack: bool, buffer_remaining: Option<i32>) -> AcknowledgementHeader {
        AcknowledgementHeader {
            id: self.id,
            ranges: self.ranges.clone(),
            final_ack,
            buffer_remaining,
        }
    }
}
