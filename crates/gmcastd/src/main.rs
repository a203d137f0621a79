//! gmcastd — reference daemon for the GMCast mesh.
//!
//! Wires the sans-IO controller to real sockets: a current-thread tokio
//! runtime carries listener, reader and writer tasks, and every complete
//! datagram funnels through one event channel into `Gmcast::handle_up`, so
//! the controller still sees a strictly serialized world. Datagrams travel
//! over TCP with a u32 length prefix.
//!
//! Lines read from stdin are fanned out to the group; deliveries from
//! other nodes are logged.
//!
//!     gmcastd 'gmcast://seed-host:4567?gmcast.group=demo&gmcast.listen_addr=tcp://0.0.0.0:4567'

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use gmcast::{Fd, Gmcast, Listener, Net, ProtoState, Transport, TransportState};

/// Largest datagram accepted off the wire. The mesh's own frames are tiny;
/// this bounds user payloads.
const MAX_DATAGRAM: usize = 1 << 20;

const STATUS_PERIOD: Duration = Duration::from_secs(10);

type Event = (Fd, Bytes);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let uri = std::env::args()
        .nth(1)
        .context("usage: gmcastd <gmcast-uri>")?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(uri))
}

async fn run(uri: String) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel::<Event>();
    let mut mesh = Gmcast::new(&uri, Box::new(TokioNet::new(events_tx)))?;
    mesh.connect()?;
    tracing::info!(
        uuid = %mesh.my_uuid(),
        listen_addr = mesh.listen_addr(),
        group = mesh.group_name(),
        "gmcastd up"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = tokio::time::interval(STATUS_PERIOD);
    let mut next_wake = mesh.handle_timers()?;

    loop {
        tokio::select! {
            maybe = events.recv() => {
                let Some((fd, dg)) = maybe else { break };
                if let Some(delivery) = mesh.handle_up(fd, &dg)? {
                    tracing::info!(
                        source = %delivery.source,
                        payload = %String::from_utf8_lossy(&delivery.payload),
                        "delivery"
                    );
                }
            }
            maybe = lines.next_line() => {
                match maybe? {
                    Some(line) if !line.is_empty() => mesh.handle_down(line.as_bytes())?,
                    Some(_) => {}
                    None => {
                        tracing::info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            _ = status.tick() => {
                let peers = mesh.peer_info();
                tracing::info!(
                    established = peers.iter().filter(|p| p.state == ProtoState::Ok).count(),
                    connections = peers.len(),
                    known = mesh.address_book().remote().len(),
                    pending = mesh.address_book().pending().len(),
                    "status"
                );
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(next_wake)) => {}
        }
        next_wake = mesh.handle_timers()?;
    }

    mesh.close();
    Ok(())
}

fn strip_tcp(addr: &str) -> io::Result<&str> {
    addr.strip_prefix("tcp://").ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a tcp address: {addr}"),
        )
    })
}

// ── Net implementation ───────────────────────────────────────────────────────

struct TokioNet {
    events: UnboundedSender<Event>,
    next_fd: Rc<Cell<Fd>>,
}

impl TokioNet {
    fn new(events: UnboundedSender<Event>) -> Self {
        Self {
            events,
            next_fd: Rc::new(Cell::new(0)),
        }
    }

    fn alloc_fd(&self) -> Fd {
        let fd = self.next_fd.get() + 1;
        self.next_fd.set(fd);
        fd
    }
}

impl Net for TokioNet {
    fn listen(&mut self, addr: &str) -> io::Result<Box<dyn Listener>> {
        // Synchronous bind so setup errors surface at construction.
        let std_listener = std::net::TcpListener::bind(strip_tcp(addr)?)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        let fd = self.alloc_fd();
        let backlog: Rc<RefCell<VecDeque<TcpStream>>> = Rc::default();
        let task = tokio::task::spawn_local({
            let backlog = backlog.clone();
            let events = self.events.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "inbound connection");
                            backlog.borrow_mut().push_back(stream);
                            if events.send((fd, Bytes::new())).is_err() {
                                return;
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "accept failed"),
                    }
                }
            }
        });

        Ok(Box::new(TokioListener {
            fd,
            backlog,
            events: self.events.clone(),
            next_fd: self.next_fd.clone(),
            task,
        }))
    }

    fn connect(&mut self, addr: &str) -> io::Result<Box<dyn Transport>> {
        let fd = self.alloc_fd();
        let target = strip_tcp(addr)?.to_string();
        let state = Rc::new(Cell::new(TransportState::Connecting));
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Bytes>();

        tokio::task::spawn_local({
            let state = state.clone();
            let events = self.events.clone();
            async move {
                match TcpStream::connect(&target).await {
                    Ok(stream) => {
                        state.set(TransportState::Connected);
                        let _ = events.send((fd, Bytes::new()));
                        spawn_conn_io(stream, outbox_rx, events, fd, state);
                    }
                    Err(err) => {
                        tracing::debug!(addr = %target, error = %err, "connect failed");
                        state.set(TransportState::Closed);
                        let _ = events.send((fd, Bytes::new()));
                    }
                }
            }
        });

        Ok(Box::new(TokioTransport {
            fd,
            state,
            outbox: Some(outbox_tx),
        }))
    }
}

struct TokioListener {
    fd: Fd,
    backlog: Rc<RefCell<VecDeque<TcpStream>>>,
    events: UnboundedSender<Event>,
    next_fd: Rc<Cell<Fd>>,
    task: JoinHandle<()>,
}

impl Listener for TokioListener {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn accept(&mut self) -> io::Result<Box<dyn Transport>> {
        let stream = self
            .backlog
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "empty backlog"))?;

        let fd = self.next_fd.get() + 1;
        self.next_fd.set(fd);
        let state = Rc::new(Cell::new(TransportState::Connected));
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Bytes>();
        spawn_conn_io(stream, outbox_rx, self.events.clone(), fd, state.clone());

        Ok(Box::new(TokioTransport {
            fd,
            state,
            outbox: Some(outbox_tx),
        }))
    }

    fn close(&mut self) {
        self.task.abort();
        self.backlog.borrow_mut().clear();
    }
}

impl Drop for TokioListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ── Per-connection I/O ───────────────────────────────────────────────────────

struct TokioTransport {
    fd: Fd,
    state: Rc<Cell<TransportState>>,
    outbox: Option<UnboundedSender<Bytes>>,
}

impl Transport for TokioTransport {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn send(&mut self, dg: &[u8]) -> io::Result<()> {
        if self.state.get() == TransportState::Closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        // While still connecting, frames queue in the outbox and flush once
        // the writer comes up.
        let outbox = self.outbox.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "transport shut down")
        })?;
        outbox
            .send(Bytes::copy_from_slice(dg))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer gone"))
    }

    fn close(&mut self) {
        self.state.set(TransportState::Closed);
        // Dropping the outbox stops the writer, which drops the socket.
        self.outbox.take();
    }
}

/// Reader and writer tasks for one established stream. The writer ends when
/// the outbox closes; the reader reports frames and, on EOF or error, the
/// transport failure.
fn spawn_conn_io(
    stream: TcpStream,
    mut outbox: UnboundedReceiver<Bytes>,
    events: UnboundedSender<Event>,
    fd: Fd,
    state: Rc<Cell<TransportState>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    tokio::task::spawn_local(async move {
        while let Some(frame) = outbox.recv().await {
            let mut buf = BytesMut::with_capacity(4 + frame.len());
            buf.put_u32(frame.len() as u32);
            buf.put_slice(&frame);
            if let Err(err) = write_half.write_all(&buf).await {
                tracing::debug!(fd, error = %err, "write failed");
                break;
            }
        }
        // write_half drops here, shutting our direction down.
    });

    tokio::task::spawn_local(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if events.send((fd, frame)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::debug!(fd, error = %err, "connection lost");
                    break;
                }
            }
        }
        state.set(TransportState::Closed);
        let _ = events.send((fd, Bytes::new()));
    });
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> io::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_DATAGRAM {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("datagram of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}
