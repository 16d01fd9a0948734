//! Test doubles for code built on reliable sessions: an in-memory binder pair, and owners and
//!  fault dispatchers that record what happens to them.
//!
//! These are part of the regular (non-#[cfg(test)]) code so applications can use them to test
//!  their own channels.

pub mod binder;
pub mod channel;
pub mod fault;
pub mod session;
