use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique 128-bit identifier for a message envelope.
///
/// Time-ordered (UUIDv7) so that two ids minted close together sort close
/// together, which keeps `BTreeMap`-ordered structures (the DLQ) roughly
/// insertion-ordered without a separate sequence field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "Uuid", try_from = "Uuid")]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<MessageId> for Uuid {
    fn from(id: MessageId) -> Uuid {
        id.0
    }
}

impl TryFrom<Uuid> for MessageId {
    type Error = std::convert::Infallible;

    fn try_from(uuid: Uuid) -> Result<Self, Self::Error> {
        Ok(Self(uuid))
    }
}
