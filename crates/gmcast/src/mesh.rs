//! The mesh controller.
//!
//! `Gmcast` owns the listener, the peer table and the address book, and is
//! driven entirely by the surrounding event loop: inbound datagrams arrive
//! through [`Gmcast::handle_up`], user datagrams leave through
//! [`Gmcast::handle_down`], and [`Gmcast::handle_timers`] runs the
//! reconnect schedule. Everything happens on one thread; no callback
//! blocks.
//!
//! The mesh converges by gossip: whenever a connection is established or
//! lost the controller rebuilds its advertised link set from the
//! established peers and broadcasts it, and any address a peer advertises
//! that we do not yet track becomes a pending address to dial. Two nodes
//! that connect to each other simultaneously resolve the duplicate by
//! comparing per-connection handshake ids, which both endpoints of a
//! connection share.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gmcast_core::wire::{self, Message, HEADER_SIZE, T_USER_BASE};
use gmcast_core::{GmcastConfig, LinkMap, NodeId};

use crate::addr::{AddrSet, AddressBook};
use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::proto::{PeerProto, ProtoEvent, ProtoState};
use crate::transport::{Fd, Listener, Net, TransportState};
use crate::view::View;

/// How long a failed address waits before the next connect attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Grace period before forgotten entries may be re-dialed (they are
/// evicted on the next sweep instead).
const FORGET_BACKOFF: Duration = Duration::from_secs(5);

/// Reconnect sweep period.
const CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Upper bound (exclusive) of the jitter applied to freshly learned
/// addresses, to avoid synchronized connect storms.
const CONNECT_JITTER_MS: u64 = 100;

/// A user datagram delivered up from the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDatagram {
    pub source: NodeId,
    pub payload: Bytes,
}

/// Point-in-time snapshot of one peer-table entry.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub fd: Fd,
    pub state: ProtoState,
    pub remote_uuid: NodeId,
    pub remote_addr: String,
    pub handshake_uuid: NodeId,
}

pub struct Gmcast {
    my_uuid: NodeId,
    group_name: String,
    listen_addr: String,
    initial_addr: Option<String>,
    max_retry_cnt: i32,
    net: Box<dyn Net>,
    listener: Option<Box<dyn Listener>>,
    peers: BTreeMap<Fd, PeerProto>,
    addrs: AddressBook,
    clock: Rc<dyn Clock>,
    rng: StdRng,
    next_check: Instant,
    user_seq: u32,
}

impl Gmcast {
    /// Build a controller from a `gmcast://` URI, with the system clock and
    /// OS entropy.
    pub fn new(uri: &str, net: Box<dyn Net>) -> Result<Self, Error> {
        Self::with_runtime(uri, net, Rc::new(SystemClock), StdRng::from_entropy())
    }

    /// Build with an injected clock and RNG; the simulation harness and the
    /// deterministic tests come through here.
    pub fn with_runtime(
        uri: &str,
        net: Box<dyn Net>,
        clock: Rc<dyn Clock>,
        mut rng: StdRng,
    ) -> Result<Self, Error> {
        let config = GmcastConfig::from_uri(uri)?;
        let my_uuid = NodeId::random(&mut rng);
        let now = clock.now();
        tracing::debug!(uuid = %my_uuid, listen_addr = %config.listen_addr, "gmcast configured");
        Ok(Self {
            my_uuid,
            group_name: config.group_name,
            listen_addr: config.listen_addr.clone(),
            initial_addr: config.initial_addr,
            max_retry_cnt: config.max_retry_cnt,
            net,
            listener: None,
            peers: BTreeMap::new(),
            addrs: AddressBook::new(config.listen_addr),
            clock,
            rng,
            next_check: now,
            user_seq: 0,
        })
    }

    pub fn my_uuid(&self) -> NodeId {
        self.my_uuid
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.addrs
    }

    pub fn listener_fd(&self) -> Option<Fd> {
        self.listener.as_ref().map(|l| l.fd())
    }

    pub fn peer_info(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(&fd, p)| PeerInfo {
                fd,
                state: p.state(),
                remote_uuid: p.remote_uuid(),
                remote_addr: p.remote_addr().to_string(),
                handshake_uuid: p.handshake_uuid(),
            })
            .collect()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bind the listener and, if configured, dial the initial seed.
    pub fn connect(&mut self) -> Result<(), Error> {
        tracing::debug!(uuid = %self.my_uuid, "gmcast connect");
        let listener = self.net.listen(&self.listen_addr)?;
        self.listener = Some(listener);

        if let Some(initial) = self.initial_addr.clone() {
            self.insert_address(AddrSet::Pending, &initial, NodeId::nil())?;
            self.connect_peer(&initial)?;
        }
        Ok(())
    }

    /// Tear everything down: listener, every peer (closing its transport),
    /// both address maps.
    pub fn close(&mut self) {
        tracing::debug!(uuid = %self.my_uuid, "gmcast close");
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
        self.peers.clear();
        self.addrs.clear();
    }

    // ── Event-loop entry points ──────────────────────────────────────────────

    /// Dispatch one inbound datagram. Returns the decoded user delivery, if
    /// the datagram was user payload addressed to the layer above.
    pub fn handle_up(&mut self, id: Fd, dg: &[u8]) -> Result<Option<UserDatagram>, Error> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(None);
        };
        if id == listener.fd() {
            self.accept_peer()?;
            return Ok(None);
        }
        if !self.peers.contains_key(&id) {
            tracing::trace!(fd = id, "datagram for unknown peer");
            return Ok(None);
        }
        if dg.is_empty() {
            self.handle_transport_event(id)?;
            return Ok(None);
        }

        let prev_state = self.peers[&id].state();
        if prev_state == ProtoState::Failed {
            tracing::warn!(fd = id, "datagram for unhandled failed peer");
            self.handle_failed(id)?;
            return Ok(None);
        }

        let msg = match Message::decode(dg) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(fd = id, error = %err, "undecodable frame");
                self.peers.get_mut(&id).expect("peer").fail();
                self.handle_failed(id)?;
                return Ok(None);
            }
        };

        if msg.msg_type() >= T_USER_BASE {
            let payload = Bytes::copy_from_slice(&dg[HEADER_SIZE..]);
            return Ok(Some(UserDatagram {
                source: msg.source,
                payload,
            }));
        }

        let event = self.peers.get_mut(&id).expect("peer").handle_message(&msg);
        match event {
            ProtoEvent::Unchanged => {}
            ProtoEvent::Failed => {
                self.handle_failed(id)?;
                self.reconnect()?;
                return Ok(None);
            }
            ProtoEvent::Established | ProtoEvent::TopologyChanged => {
                self.update_addresses()?;
                self.reconnect()?;
            }
        }

        // The peer may have been dropped as a duplicate inside
        // update_addresses; re-check before running the establishment
        // callback.
        let now_ok = self
            .peers
            .get(&id)
            .map(|p| p.state() == ProtoState::Ok)
            .unwrap_or(false);
        if prev_state != ProtoState::Ok && now_ok {
            self.handle_established(id)?;
        }
        Ok(None)
    }

    /// Fan one user datagram out to every peer in the table. The transport
    /// decides whether a not-yet-established peer can take it; per-peer
    /// errors never stop the broadcast.
    pub fn handle_down(&mut self, dg: &[u8]) -> Result<(), Error> {
        let frame = wire::encode_user(self.my_uuid, self.user_seq, 1, dg);
        self.user_seq = self.user_seq.wrapping_add(1);
        for (&fd, peer) in self.peers.iter_mut() {
            if let Err(err) = peer.send_raw(&frame) {
                tracing::debug!(fd, error = %err, "transport send failed");
            }
        }
        Ok(())
    }

    /// Run the reconnect sweep when due. Returns the next wake time for the
    /// scheduler.
    pub fn handle_timers(&mut self) -> Result<Instant, Error> {
        let now = self.clock.now();
        if now >= self.next_check {
            self.reconnect()?;
            self.next_check = now + CHECK_PERIOD;
        }
        Ok(self.next_check)
    }

    /// The membership layer above confirmed a primary view: forget every
    /// peer it no longer names, and stop counting past failures against the
    /// ones it does.
    pub fn handle_stable_view(&mut self, view: &View) -> Result<(), Error> {
        tracing::info!(%view, "handle stable view");
        if !view.is_prim() {
            return Ok(());
        }

        let known: BTreeSet<NodeId> = self.addrs.remote().values().map(|e| e.uuid).collect();
        for uuid in known.difference(view.members()).copied().collect::<Vec<_>>() {
            self.forget(uuid)?;
        }
        for &uuid in view.members() {
            if self.addrs.declare_stable(uuid) {
                tracing::info!(uuid = %uuid, "declaring stable");
            }
        }
        Ok(())
    }

    /// Drop every connection to `uuid` and push its addresses over the
    /// retry budget; the next sweep evicts them.
    pub fn forget(&mut self, uuid: NodeId) -> Result<(), Error> {
        if uuid.is_nil() {
            // Nil matches every half-open connection; there is nothing
            // meaningful to forget.
            tracing::debug!("ignoring forget for nil uuid");
            return Ok(());
        }
        let doomed: Vec<Fd> = self
            .peers
            .iter()
            .filter(|(_, p)| p.remote_uuid() == uuid)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in doomed {
            tracing::debug!(fd, uuid = %uuid, "forgetting connection");
            self.peers.remove(&fd);
        }
        self.addrs.penalize(
            uuid,
            self.max_retry_cnt + 1,
            self.clock.now() + FORGET_BACKOFF,
        );
        self.update_addresses()
    }

    // ── Accept / connect paths ───────────────────────────────────────────────

    fn accept_peer(&mut self) -> Result<(), Error> {
        let listener = self.listener.as_mut().expect("listener");
        let transport = match listener.accept() {
            Ok(tp) => tp,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                return Ok(());
            }
        };
        let fd = transport.fd();
        let handshake_uuid = NodeId::random(&mut self.rng);
        let peer = PeerProto::new(
            transport,
            handshake_uuid,
            self.my_uuid,
            self.listen_addr.clone(),
            String::new(),
            self.group_name.clone(),
        );
        let peer = match self.peers.entry(fd) {
            Entry::Occupied(_) => {
                return Err(Error::Invariant(format!("duplicate fd {fd} in peer table")))
            }
            Entry::Vacant(slot) => slot.insert(peer),
        };
        peer.send_handshake();
        if peer.state() == ProtoState::Failed {
            self.handle_failed(fd)?;
        }
        Ok(())
    }

    fn connect_peer(&mut self, remote_addr: &str) -> Result<(), Error> {
        if remote_addr == self.listen_addr {
            return Ok(());
        }
        let transport = match self.net.connect(remote_addr) {
            Ok(tp) => tp,
            Err(err) => {
                tracing::debug!(addr = remote_addr, error = %err, "connect failed");
                return Ok(());
            }
        };
        let fd = transport.fd();
        let handshake_uuid = NodeId::random(&mut self.rng);
        let peer = PeerProto::new(
            transport,
            handshake_uuid,
            self.my_uuid,
            self.listen_addr.clone(),
            remote_addr.to_string(),
            self.group_name.clone(),
        );
        match self.peers.entry(fd) {
            Entry::Occupied(_) => {
                return Err(Error::Invariant(format!("duplicate fd {fd} in peer table")))
            }
            Entry::Vacant(slot) => slot.insert(peer).wait_handshake(),
        }
        Ok(())
    }

    // ── Peer state callbacks ─────────────────────────────────────────────────

    /// Zero-length datagram: the transport reports a state change.
    fn handle_transport_event(&mut self, id: Fd) -> Result<(), Error> {
        let peer = self.peers.get(&id).expect("peer");
        match peer.transport_state() {
            TransportState::Connected
                if matches!(peer.state(), ProtoState::Init | ProtoState::HandshakeWait) =>
            {
                tracing::debug!(fd = id, "transport connected");
            }
            TransportState::Connected => {
                tracing::warn!(fd = id, "zero length datagram");
            }
            _ => {
                self.peers.get_mut(&id).expect("peer").fail();
                self.handle_failed(id)?;
            }
        }
        Ok(())
    }

    fn handle_established(&mut self, est_fd: Fd) -> Result<(), Error> {
        let (est_uuid, est_hs_uuid, est_addr) = {
            let peer = self.peers.get(&est_fd).expect("peer");
            (
                peer.remote_uuid(),
                peer.handshake_uuid(),
                peer.remote_addr().to_string(),
            )
        };
        tracing::debug!(uuid = %est_uuid, addr = %est_addr, "connection established");

        // Promote the address from pending to remote and grant it a deep
        // failure budget.
        if self.addrs.remove(AddrSet::Pending, &est_addr).is_some() {
            tracing::debug!(addr = %est_addr, "erasing from pending list");
        }
        if self.addrs.get(AddrSet::Remote, &est_addr).is_none() {
            tracing::debug!(addr = %est_addr, "inserting into remote list");
            self.insert_address(AddrSet::Remote, &est_addr, est_uuid)?;
        }
        if let Some(entry) = self.addrs.get_mut(AddrSet::Remote, &est_addr) {
            entry.retry_cnt = self.max_retry_cnt - 60;
        }

        // Clean up other connections to the same node. The shared
        // handshake id decides which duplicate survives, so both endpoints
        // come to the same verdict independently.
        let mut stale: Vec<Fd> = Vec::new();
        let mut est_is_duplicate = false;
        for (&fd, peer) in &self.peers {
            if fd == est_fd || peer.remote_uuid() != est_uuid {
                continue;
            }
            if peer.handshake_uuid() < est_hs_uuid {
                stale.push(fd);
            } else if peer.handshake_uuid() > est_hs_uuid {
                est_is_duplicate = true;
                break;
            }
        }
        for fd in stale {
            tracing::debug!(fd, after = est_fd, "cleaning up duplicate connection");
            self.peers.remove(&fd);
        }
        if est_is_duplicate {
            tracing::debug!(fd = est_fd, "established connection is itself a duplicate");
            self.peers.remove(&est_fd);
        }

        self.update_addresses()
    }

    fn handle_failed(&mut self, fd: Fd) -> Result<(), Error> {
        let Some(failed) = self.peers.get(&fd) else {
            return Ok(());
        };
        let remote_uuid = failed.remote_uuid();
        let remote_addr = failed.remote_addr().to_string();

        let found_ok = self.peers.iter().any(|(&other_fd, p)| {
            other_fd != fd && p.state() != ProtoState::Failed && p.remote_uuid() == remote_uuid
        });
        if !found_ok && !remote_addr.is_empty() {
            if let Some((_, entry)) = self.addrs.find_mut(&remote_addr) {
                entry.retry_cnt += 1;
                entry.next_reconnect = self.clock.now() + RECONNECT_BACKOFF;
                tracing::debug!(
                    addr = %remote_addr,
                    retry_cnt = entry.retry_cnt,
                    "scheduling reconnect"
                );
            }
        }
        self.peers.remove(&fd);
        self.update_addresses()
    }

    // ── Topology propagation ─────────────────────────────────────────────────

    /// Rebuild the advertised link set from the established peers,
    /// broadcast it, and learn new addresses from what those peers
    /// advertise in return.
    fn update_addresses(&mut self) -> Result<(), Error> {
        let established: Vec<(Fd, NodeId, String)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state() == ProtoState::Ok)
            .map(|(&fd, p)| (fd, p.remote_uuid(), p.remote_addr().to_string()))
            .collect();

        let mut link_map = LinkMap::new();
        let mut duplicates: Vec<Fd> = Vec::new();
        for (fd, uuid, addr) in &established {
            if addr.is_empty() || uuid.is_nil() {
                return Err(Error::Invariant(format!(
                    "established peer fd {fd} with identity ({uuid}, '{addr}'), \
                     local ({}, '{}')",
                    self.my_uuid, self.listen_addr
                )));
            }
            if link_map.contains(uuid) {
                // Establishment-time cleanup should have caught this;
                // drop the later-scanned connection.
                tracing::debug!(fd, uuid = %uuid, "dropping duplicate established entry");
                duplicates.push(*fd);
                continue;
            }
            if self.addrs.get(AddrSet::Remote, addr).is_none() {
                tracing::warn!(addr = %addr, "connection exists but no addr on addr list");
                self.insert_address(AddrSet::Remote, addr, *uuid)?;
            }
            link_map.insert(*uuid, addr.clone());
        }
        for fd in duplicates {
            self.peers.remove(&fd);
        }

        for peer in self
            .peers
            .values_mut()
            .filter(|p| p.state() == ProtoState::Ok)
        {
            peer.send_topology_change(&link_map);
        }

        // Union what the established peers advertise; anything new becomes
        // a pending address with a jittered first dial.
        let advertised: Vec<(NodeId, String)> = self
            .peers
            .values()
            .filter(|p| p.state() == ProtoState::Ok)
            .flat_map(|p| {
                p.link_map()
                    .iter()
                    .map(|(uuid, link)| (*uuid, link.addr.clone()))
            })
            .collect();
        let now = self.clock.now();
        for (uuid, addr) in advertised {
            if uuid == self.my_uuid
                || self.addrs.get(AddrSet::Remote, &addr).is_some()
                || self.addrs.get(AddrSet::Pending, &addr).is_some()
            {
                continue;
            }
            tracing::debug!(uuid = %uuid, addr = %addr, "peer advertises unknown address");
            self.insert_address(AddrSet::Pending, &addr, uuid)?;
            if let Some(entry) = self.addrs.get_mut(AddrSet::Pending, &addr) {
                entry.retry_cnt = self.max_retry_cnt - 60;
                entry.next_reconnect =
                    now + Duration::from_millis(self.rng.gen_range(0..CONNECT_JITTER_MS));
                self.next_check = self.next_check.min(entry.next_reconnect);
            }
        }
        Ok(())
    }

    // ── Reconnect sweep ──────────────────────────────────────────────────────

    fn reconnect(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        let pending: Vec<(String, i32, Instant)> = self
            .addrs
            .pending()
            .iter()
            .map(|(addr, e)| (addr.clone(), e.retry_cnt, e.next_reconnect))
            .collect();
        for (addr, retry_cnt, next_reconnect) in pending {
            if self.is_connected(&addr, NodeId::nil()) {
                continue;
            }
            if retry_cnt > self.max_retry_cnt {
                tracing::debug!(addr = %addr, "forgetting");
                self.addrs.remove(AddrSet::Pending, &addr);
            } else if next_reconnect <= now {
                self.connect_peer(&addr)?;
            }
        }

        let remote: Vec<(String, NodeId, i32, Instant)> = self
            .addrs
            .remote()
            .iter()
            .map(|(addr, e)| (addr.clone(), e.uuid, e.retry_cnt, e.next_reconnect))
            .collect();
        for (addr, uuid, retry_cnt, next_reconnect) in remote {
            if uuid == self.my_uuid {
                return Err(Error::Invariant(format!(
                    "own uuid {uuid} on remote address list ({addr})"
                )));
            }
            if self.is_connected(&addr, uuid) {
                continue;
            }
            if retry_cnt > self.max_retry_cnt {
                tracing::debug!(uuid = %uuid, addr = %addr, "forgetting");
                self.addrs.remove(AddrSet::Remote, &addr);
            } else if next_reconnect <= now {
                if retry_cnt % 30 == 0 {
                    tracing::info!(uuid = %uuid, addr = %addr, attempt = retry_cnt, "reconnecting");
                }
                self.connect_peer(&addr)?;
            }
        }
        Ok(())
    }

    /// One live link per node is the goal: a connection matching either the
    /// address or a learned (non-nil) uuid counts.
    fn is_connected(&self, addr: &str, uuid: NodeId) -> bool {
        self.peers
            .values()
            .any(|p| addr == p.remote_addr() || (!uuid.is_nil() && uuid == p.remote_uuid()))
    }

    fn insert_address(&mut self, set: AddrSet, addr: &str, uuid: NodeId) -> Result<(), Error> {
        self.addrs.insert(set, addr, uuid, self.clock.now())
    }
}
