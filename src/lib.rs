//! A WS-ReliableMessaging session layer (WS-RM February 2005 and WS-RM 1.1).
//!
//! The crate sits between an application channel and a transport [binder::ReliableChannelBinder].
//!  [channel::output::ReliableOutputSessionChannel] creates a sequence, numbers and retransmits
//!  messages until they are acknowledged and runs the shutdown handshake;
//!  [channel::input::ReliableInputSessionChannel] accepts a sequence, delivers every message
//!  exactly once and acknowledges what it received. Both share the fault state machine in
//!  [session].
//!
//! Message encoding is not done here; [message] is the structured model of what goes on the
//!  wire.

pub mod binder;
pub mod channel;
pub mod config;
pub mod connection;
pub mod fault;
pub mod fault_helper;
pub mod message;
pub mod message_info;
pub mod requestor;
pub mod sequence_range;
pub mod session;
pub mod sync;
pub mod test_util;
pub mod timeout_helper;
pub mod unique_id;
pub mod version;
