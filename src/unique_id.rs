use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use uuid::Uuid;

use crate::version::ReliableMessagingVersion;

const URN_PREFIX: &str = "urn:uuid:";

/// Identifier of a WSRM sequence or of a message (for request / reply correlation). On the wire
///  this is a `urn:uuid:...` URI.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct UniqueId(Uuid);

impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", URN_PREFIX, self.0)
    }
}

impl FromStr for UniqueId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(URN_PREFIX)
            .ok_or_else(|| anyhow!("not a urn:uuid identifier: {}", s))?;
        Ok(UniqueId(Uuid::parse_str(raw)?))
    }
}

impl UniqueId {
    pub fn new() -> UniqueId {
        UniqueId(Uuid::new_v4())
    }

    pub fn from_raw(value: u128) -> UniqueId {
        UniqueId(Uuid::from_u128(value))
    }

    pub fn to_raw(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        UniqueId::new()
    }
}

/// The identifiers a session is bound to. A session may know the sequence it receives on
///  (`input_id`), the one it sends on (`output_id`), or both.
///
/// Once set, an identifier never changes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceIdentity {
    pub version: ReliableMessagingVersion,
    input_id: Option<UniqueId>,
    output_id: Option<UniqueId>,
}

impl SequenceIdentity {
    pub fn new(version: ReliableMessagingVersion, input_id: Option<UniqueId>, output_id: Option<UniqueId>) -> SequenceIdentity {
        SequenceIdentity {
            version,
            input_id,
            output_id,
        }
    }

    pub fn input_id(&self) -> Option<UniqueId> {
        self.input_id
    }

    pub fn output_id(&self) -> Option<UniqueId> {
        self.output_id
    }

    pub fn set_input_id(&mut self, id: UniqueId) -> anyhow::Result<()> {
        Self::assign(&mut self.input_id, id, "input")
    }

    pub fn set_output_id(&mut self, id: UniqueId) -> anyhow::Result<()> {
        Self::assign(&mut self.output_id, id, "output")
    }

    fn assign(slot: &mut Option<UniqueId>, id: UniqueId, kind: &str) -> anyhow::Result<()> {
        match slot {
            Some(existing) if *existing != id => Err(anyhow!("{} sequence id is already set to {}", kind, existing)),
            _ => {
                *slot = Some(id);
                Ok(())
            }
        }
    }

    /// true if the given id is one of the identifiers this session owns
    pub fn owns(&self, id: UniqueId) -> bool {
        self.input_id == Some(id) || self.output_id == Some(id)
    }
}
