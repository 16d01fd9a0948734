//! The two halves of a sequence as seen by one endpoint: the output connection numbers, buffers
//!  and retransmits what this side sends, the input connection tracks what it received.

pub mod input;
pub mod output;
