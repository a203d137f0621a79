//! Per-connection protocol state machine.
//!
//! One `PeerProto` exists for every live transport. The acceptor side opens
//! with a `HANDSHAKE` carrying a freshly drawn handshake id; the connector
//! echoes that id in its `HANDSHAKE_RESPONSE`, so both endpoints of a
//! connection agree on the value later used to break ties between
//! simultaneous connects. After the closing `HANDSHAKE_OK` both sides are
//! established and exchange topology changes.

use gmcast_core::wire::{Body, Handshake, Message};
use gmcast_core::{LinkMap, NodeId};

use crate::transport::{Fd, Transport, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Init,
    HandshakeSent,
    HandshakeWait,
    Ok,
    Failed,
}

/// Outcome of feeding one frame to the state machine. The controller acts
/// on anything but `Unchanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoEvent {
    Unchanged,
    Established,
    TopologyChanged,
    Failed,
}

pub struct PeerProto {
    transport: Box<dyn Transport>,
    state: ProtoState,
    local_uuid: NodeId,
    local_addr: String,
    group_name: String,
    handshake_uuid: NodeId,
    remote_uuid: NodeId,
    remote_addr: String,
    link_map: LinkMap,
    seq: u32,
}

impl PeerProto {
    /// `remote_addr` is the dialed address on the connector side and empty
    /// on the acceptor side until the peer reports its listen address.
    pub fn new(
        transport: Box<dyn Transport>,
        handshake_uuid: NodeId,
        local_uuid: NodeId,
        local_addr: String,
        remote_addr: String,
        group_name: String,
    ) -> Self {
        Self {
            transport,
            state: ProtoState::Init,
            local_uuid,
            local_addr,
            group_name,
            handshake_uuid,
            remote_uuid: NodeId::nil(),
            remote_addr,
            link_map: LinkMap::new(),
            seq: 0,
        }
    }

    pub fn state(&self) -> ProtoState {
        self.state
    }

    pub fn handshake_uuid(&self) -> NodeId {
        self.handshake_uuid
    }

    pub fn remote_uuid(&self) -> NodeId {
        self.remote_uuid
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn link_map(&self) -> &LinkMap {
        &self.link_map
    }

    pub fn fd(&self) -> Fd {
        self.transport.fd()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Acceptor role: announce ourselves and wait for the response.
    pub fn send_handshake(&mut self) {
        debug_assert_eq!(self.state, ProtoState::Init);
        let body = Body::Handshake(Handshake {
            handshake_uuid: self.handshake_uuid,
            group_name: self.group_name.clone(),
            listen_addr: self.local_addr.clone(),
        });
        if self.send(body) {
            self.state = ProtoState::HandshakeSent;
        }
    }

    /// Connector role: the acceptor speaks first.
    pub fn wait_handshake(&mut self) {
        debug_assert_eq!(self.state, ProtoState::Init);
        self.state = ProtoState::HandshakeWait;
    }

    /// Advance the state machine by one protocol frame. User frames never
    /// reach this point; the controller dispatches them before decoding the
    /// body.
    pub fn handle_message(&mut self, msg: &Message) -> ProtoEvent {
        match &msg.body {
            Body::Handshake(hs) => self.handle_handshake(msg.source, hs),
            Body::HandshakeResponse(hs) => self.handle_handshake_response(msg.source, hs),
            Body::HandshakeOk => self.handle_handshake_ok(),
            Body::HandshakeFail { reason } => {
                tracing::debug!(fd = self.fd(), reason = %reason, "handshake rejected by peer");
                self.fail()
            }
            Body::TopologyChange(lm) => self.handle_topology_change(lm),
            Body::User { .. } => ProtoEvent::Unchanged,
        }
    }

    fn handle_handshake(&mut self, source: NodeId, hs: &Handshake) -> ProtoEvent {
        if self.state != ProtoState::HandshakeWait {
            tracing::debug!(fd = self.fd(), state = ?self.state, "unexpected handshake");
            return self.fail();
        }
        if hs.group_name != self.group_name {
            tracing::info!(
                fd = self.fd(),
                group = %hs.group_name,
                "rejecting peer from foreign group"
            );
            self.send(Body::HandshakeFail {
                reason: "invalid group".into(),
            });
            return self.fail();
        }
        self.remote_uuid = source;
        self.remote_addr = hs.listen_addr.clone();
        // Adopt the acceptor's handshake id for this connection.
        self.handshake_uuid = hs.handshake_uuid;

        let body = Body::HandshakeResponse(Handshake {
            handshake_uuid: self.handshake_uuid,
            group_name: self.group_name.clone(),
            listen_addr: self.local_addr.clone(),
        });
        if !self.send(body) {
            return self.fail();
        }
        ProtoEvent::Unchanged
    }

    fn handle_handshake_response(&mut self, source: NodeId, hs: &Handshake) -> ProtoEvent {
        if self.state != ProtoState::HandshakeSent {
            tracing::debug!(fd = self.fd(), state = ?self.state, "unexpected handshake response");
            return self.fail();
        }
        if hs.group_name != self.group_name {
            tracing::info!(
                fd = self.fd(),
                group = %hs.group_name,
                "rejecting peer from foreign group"
            );
            self.send(Body::HandshakeFail {
                reason: "invalid group".into(),
            });
            return self.fail();
        }
        self.remote_uuid = source;
        self.remote_addr = hs.listen_addr.clone();
        if !self.send(Body::HandshakeOk) {
            return self.fail();
        }
        self.state = ProtoState::Ok;
        ProtoEvent::Established
    }

    fn handle_handshake_ok(&mut self) -> ProtoEvent {
        if self.state != ProtoState::HandshakeWait {
            tracing::debug!(fd = self.fd(), state = ?self.state, "unexpected handshake ok");
            return self.fail();
        }
        self.state = ProtoState::Ok;
        ProtoEvent::Established
    }

    fn handle_topology_change(&mut self, lm: &LinkMap) -> ProtoEvent {
        if self.state != ProtoState::Ok {
            tracing::debug!(fd = self.fd(), state = ?self.state, "topology change before established");
            return self.fail();
        }
        // An identical re-advertisement is quiescent; reacting to it would
        // keep two settled nodes re-broadcasting at each other forever.
        if self.link_map == *lm {
            return ProtoEvent::Unchanged;
        }
        self.link_map = lm.clone();
        ProtoEvent::TopologyChanged
    }

    /// Broadcast path: send our current advertised link set.
    pub fn send_topology_change(&mut self, lm: &LinkMap) {
        self.send(Body::TopologyChange(lm.clone()));
    }

    /// Raw fan-out path for already-encoded user frames; errors are the
    /// caller's to log.
    pub fn send_raw(&mut self, dg: &[u8]) -> std::io::Result<()> {
        self.transport.send(dg)
    }

    /// Force the terminal state (transport-level failure observed by the
    /// controller).
    pub fn fail(&mut self) -> ProtoEvent {
        self.state = ProtoState::Failed;
        ProtoEvent::Failed
    }

    fn send(&mut self, body: Body) -> bool {
        let msg = Message {
            source: self.local_uuid,
            seq: self.seq,
            body,
        };
        self.seq = self.seq.wrapping_add(1);
        match self.transport.send(&msg.encode()) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(fd = self.fd(), error = %err, "transport send failed");
                false
            }
        }
    }
}

impl Drop for PeerProto {
    fn drop(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmcast_core::wire::{self, T_USER_BASE};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Capture-only transport: frames pile up for the test to shuttle.
    struct SinkTransport {
        fd: Fd,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl Transport for SinkTransport {
        fn fd(&self) -> Fd {
            self.fd
        }
        fn state(&self) -> TransportState {
            TransportState::Connected
        }
        fn send(&mut self, dg: &[u8]) -> std::io::Result<()> {
            self.sent.borrow_mut().push(dg.to_vec());
            Ok(())
        }
        fn close(&mut self) {}
    }

    struct Endpoint {
        proto: PeerProto,
        uuid: NodeId,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    fn endpoint(
        rng: &mut StdRng,
        fd: Fd,
        addr: &str,
        remote_addr: &str,
        group: &str,
    ) -> Endpoint {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let uuid = NodeId::random(rng);
        let proto = PeerProto::new(
            Box::new(SinkTransport {
                fd,
                sent: sent.clone(),
            }),
            NodeId::random(rng),
            uuid,
            addr.to_string(),
            remote_addr.to_string(),
            group.to_string(),
        );
        Endpoint { proto, uuid, sent }
    }

    /// Deliver everything `from` has queued into `to`, returning the events.
    fn shuttle(from: &Endpoint, to: &mut Endpoint) -> Vec<ProtoEvent> {
        let frames: Vec<_> = from.sent.borrow_mut().drain(..).collect();
        frames
            .iter()
            .map(|dg| {
                let msg = Message::decode(dg).unwrap();
                to.proto.handle_message(&msg)
            })
            .collect()
    }

    fn handshake_pair(group_a: &str, group_b: &str) -> (Endpoint, Endpoint, Vec<ProtoEvent>) {
        let mut rng = StdRng::seed_from_u64(5);
        // `acc` accepted the connection, `conn` dialed it.
        let mut acc = endpoint(&mut rng, 1, "tcp://10.0.0.1:4567", "", group_a);
        let mut conn = endpoint(
            &mut rng,
            2,
            "tcp://10.0.0.2:4567",
            "tcp://10.0.0.1:4567",
            group_b,
        );

        acc.proto.send_handshake();
        conn.proto.wait_handshake();

        let mut events = shuttle(&acc, &mut conn);
        events.extend(shuttle(&conn, &mut acc));
        events.extend(shuttle(&acc, &mut conn));
        (acc, conn, events)
    }

    #[test]
    fn full_handshake_establishes_both_sides() {
        let (acc, conn, events) = handshake_pair("galaxy", "galaxy");
        assert_eq!(acc.proto.state(), ProtoState::Ok);
        assert_eq!(conn.proto.state(), ProtoState::Ok);
        assert_eq!(acc.proto.remote_uuid(), conn.uuid);
        assert_eq!(conn.proto.remote_uuid(), acc.uuid);
        assert_eq!(acc.proto.remote_addr(), "tcp://10.0.0.2:4567");
        assert_eq!(conn.proto.remote_addr(), "tcp://10.0.0.1:4567");
        // Both endpoints settle on the acceptor's handshake id.
        assert_eq!(acc.proto.handshake_uuid(), conn.proto.handshake_uuid());
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == ProtoEvent::Established)
                .count(),
            2
        );
    }

    #[test]
    fn group_mismatch_fails_and_notifies() {
        let (acc, conn, events) = handshake_pair("galaxy", "andromeda");
        // The connector rejects the foreign group; its HANDSHAKE_FAIL then
        // fails the acceptor as well.
        assert_eq!(conn.proto.state(), ProtoState::Failed);
        assert_eq!(acc.proto.state(), ProtoState::Failed);
        assert_eq!(
            events.iter().filter(|e| **e == ProtoEvent::Failed).count(),
            2
        );
        assert!(!events.contains(&ProtoEvent::Established));
    }

    #[test]
    fn out_of_order_frame_fails_the_peer() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut conn = endpoint(&mut rng, 3, "tcp://10.0.0.2:4567", "tcp://10.0.0.1:4567", "g");
        conn.proto.wait_handshake();

        let msg = Message {
            source: NodeId::random(&mut rng),
            seq: 0,
            body: Body::HandshakeOk,
        };
        assert_eq!(conn.proto.handle_message(&msg), ProtoEvent::Failed);
        assert_eq!(conn.proto.state(), ProtoState::Failed);
    }

    #[test]
    fn topology_before_established_fails_the_peer() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut conn = endpoint(&mut rng, 4, "tcp://10.0.0.2:4567", "tcp://10.0.0.1:4567", "g");
        conn.proto.wait_handshake();

        let msg = Message {
            source: NodeId::random(&mut rng),
            seq: 0,
            body: Body::TopologyChange(LinkMap::new()),
        };
        assert_eq!(conn.proto.handle_message(&msg), ProtoEvent::Failed);
    }

    #[test]
    fn topology_change_replaces_link_map_once() {
        let (mut acc, conn, _) = handshake_pair("galaxy", "galaxy");
        let mut rng = StdRng::seed_from_u64(8);

        let mut lm = LinkMap::new();
        lm.insert(NodeId::random(&mut rng), "tcp://10.0.0.3:4567".into());
        let msg = Message {
            source: conn.uuid,
            seq: 9,
            body: Body::TopologyChange(lm.clone()),
        };
        assert_eq!(acc.proto.handle_message(&msg), ProtoEvent::TopologyChanged);
        assert_eq!(acc.proto.link_map(), &lm);

        // Re-advertising the same map is quiescent.
        assert_eq!(acc.proto.handle_message(&msg), ProtoEvent::Unchanged);
    }

    #[test]
    fn user_frames_do_not_touch_state() {
        let (mut acc, conn, _) = handshake_pair("galaxy", "galaxy");
        let dg = wire::encode_user(conn.uuid, 0, 1, b"payload");
        let msg = Message::decode(&dg).unwrap();
        assert_eq!(msg.msg_type(), T_USER_BASE);
        assert_eq!(acc.proto.handle_message(&msg), ProtoEvent::Unchanged);
        assert_eq!(acc.proto.state(), ProtoState::Ok);
    }
}
