//! Link maps — the set of (node id, listen address) pairs a node advertises
//! to its established peers in topology change messages.

use bytes::{Buf, BufMut};
use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::node::NodeId;
use crate::wire::WireError;

/// One advertised link: the listen address a peer can be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub addr: String,
}

/// Ordered map from node id to link. The total order on ids gives the
/// serialized form a deterministic layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMap {
    links: BTreeMap<NodeId, Link>,
}

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uuid: NodeId, addr: String) {
        self.links.insert(uuid, Link { addr });
    }

    pub fn get(&self, uuid: &NodeId) -> Option<&Link> {
        self.links.get(uuid)
    }

    pub fn contains(&self, uuid: &NodeId) -> bool {
        self.links.contains_key(uuid)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, NodeId, Link> {
        self.links.iter()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Wire layout: entry count (u16 BE), then per entry the raw 16-byte id
    /// followed by a u16-length-prefixed UTF-8 address.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        debug_assert!(self.links.len() <= u16::MAX as usize);
        buf.put_u16(self.links.len() as u16);
        for (uuid, link) in &self.links {
            buf.put_slice(&uuid.into_bytes());
            buf.put_u16(link.addr.len() as u16);
            buf.put_slice(link.addr.as_bytes());
        }
    }

    /// Decode a link map, rejecting entries with a nil id or empty address.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let count = buf.get_u16() as usize;

        let mut links = BTreeMap::new();
        for _ in 0..count {
            if buf.remaining() < 16 {
                return Err(WireError::Truncated);
            }
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            let uuid = NodeId::from_bytes(raw);

            let addr = crate::wire::get_string(buf, "link address")?;
            if uuid.is_nil() || addr.is_empty() {
                return Err(WireError::InvalidLink);
            }
            links.insert(uuid, Link { addr });
        }
        Ok(Self { links })
    }
}

impl<'a> IntoIterator for &'a LinkMap {
    type Item = (&'a NodeId, &'a Link);
    type IntoIter = btree_map::Iter<'a, NodeId, Link>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_map() -> LinkMap {
        let mut rng = StdRng::seed_from_u64(3);
        let mut lm = LinkMap::new();
        lm.insert(NodeId::random(&mut rng), "tcp://10.0.0.1:4567".into());
        lm.insert(NodeId::random(&mut rng), "tcp://10.0.0.2:4567".into());
        lm
    }

    #[test]
    fn encode_decode_round_trip() {
        let lm = sample_map();
        let mut buf = BytesMut::new();
        lm.encode_into(&mut buf);
        let decoded = LinkMap::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, lm);
    }

    #[test]
    fn empty_map_round_trip() {
        let lm = LinkMap::new();
        let mut buf = BytesMut::new();
        lm.encode_into(&mut buf);
        assert_eq!(buf.len(), 2);
        let decoded = LinkMap::decode(&mut buf.freeze()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn nil_uuid_entry_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_slice(&[0u8; 16]);
        buf.put_u16(4);
        buf.put_slice(b"addr");
        assert!(matches!(
            LinkMap::decode(&mut buf.freeze()),
            Err(WireError::InvalidLink)
        ));
    }

    #[test]
    fn empty_addr_entry_is_rejected() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_slice(&NodeId::random(&mut rng).into_bytes());
        buf.put_u16(0);
        assert!(matches!(
            LinkMap::decode(&mut buf.freeze()),
            Err(WireError::InvalidLink)
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let lm = sample_map();
        let mut buf = BytesMut::new();
        lm.encode_into(&mut buf);
        let bytes = buf.freeze();
        let mut short = &bytes[..bytes.len() - 3];
        assert!(matches!(
            LinkMap::decode(&mut short),
            Err(WireError::Truncated)
        ));
    }
}
