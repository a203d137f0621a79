//! Node identity.

use std::fmt;

use rand::RngCore;
use uuid::Uuid;

/// 128-bit node identity, totally ordered.
///
/// Every node draws one `NodeId` for its lifetime; in addition every
/// connection carries a per-connection handshake id used to break ties
/// between simultaneous connects. The nil value is a sentinel for
/// "identity not yet learned".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(Uuid);

impl NodeId {
    /// The nil sentinel.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Draw a fresh random id from the given source.
    ///
    /// The caller supplies the RNG so tests can seed it; production code
    /// feeds OS entropy through `StdRng::from_entropy`.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut raw = [0u8; 16];
        rng.fill_bytes(&mut raw);
        Self(uuid::Builder::from_random_bytes(raw).into_uuid())
    }

    pub const fn from_bytes(raw: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(raw))
    }

    pub const fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
