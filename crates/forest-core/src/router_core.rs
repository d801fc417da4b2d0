//! Wires the tables, forwarder, and control handler into running threads
//! (§5): one receive thread per bound interface, a pool of control
//! worker threads fed by a bounded queue, and one drain thread per link
//! pulling from the scheduler.
//!
//! Comtree *construction* (the controller's multi-router path-finding)
//! is out of scope, so this router never originates its own outbound
//! control requests — it only answers them — and carries no outbound
//! retransmission timer. The 30s dedup/pending-leaf retention §5 also
//! names lives in [`crate::control_handler`].

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::address::{ComtreeNum, ForestAddr, PacketType, BUF_SIZ};
use crate::clock::RouterClock;
use crate::config::RouterConfig;
use crate::control_handler::ControlHandler;
use crate::ctlpkt::CtlPktReader;
use crate::forwarder::{encode_sub_unsub, ForwardAction, Forwarder};
use crate::packet_store::{PacketHandle, PacketStore};
use crate::persist;
use crate::tables::Tables;
use crate::wire::Packet;

const DRAIN_TICK: Duration = Duration::from_micros(200);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Running router: tables plus the thread pool driving them. Construct
/// with [`RouterCore::new`], spawn threads with [`RouterCore::start`],
/// and stop with [`RouterCore::shutdown`] followed by [`RouterCore::join`].
pub struct RouterCore {
    tables: Arc<Tables>,
    store: Arc<PacketStore>,
    forwarder: Forwarder,
    control: ControlHandler,
    clock: RouterClock,
    my_addr: ForestAddr,
    sockets: HashMap<u32, Arc<UdpSocket>>,
    shutdown: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    control_tx: Sender<PacketHandle>,
    control_rx: Receiver<PacketHandle>,
    control_threads: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RouterCore {
    pub fn new(config: &RouterConfig) -> anyhow::Result<Self> {
        let tables = Arc::new(Tables::new(config.my_zip, config.packet_log_capacity));
        let store = Arc::new(PacketStore::new(config.max_descriptors, config.max_buffers));

        let ifaces_path = config.ifaces_path();
        if ifaces_path.exists() {
            persist::load_ifaces(&ifaces_path, &tables.ifaces)?;
        } else {
            tracing::info!(path = %ifaces_path.display(), "no persisted ifaces, starting empty");
        }
        let links_path = config.links_path();
        if links_path.exists() {
            persist::load_links(&links_path, &tables.links)?;
        } else {
            tracing::info!(path = %links_path.display(), "no persisted links, starting empty");
        }
        let comtrees_path = config.comtrees_path();
        if comtrees_path.exists() {
            persist::load_comtrees(&comtrees_path, &tables.comtrees)?;
        } else {
            tracing::info!(path = %comtrees_path.display(), "no persisted comtrees, starting empty");
        }
        let routes_path = config.routes_path();
        if routes_path.exists() {
            persist::load_routes(&routes_path, &tables.comtrees, &tables.routes)?;
        } else {
            tracing::info!(path = %routes_path.display(), "no persisted routes, starting empty");
        }

        // Mirror what add_link/add_comtree_link do at runtime: every link
        // needs a scheduler entry, and every comtree-link needs a queue
        // allocated under it before anything can be enqueued.
        for link in tables.links.ids() {
            let rates = tables.links.get(link)?.rates;
            tables.qmanager.add_link(link, rates);
        }
        for comtree in tables.comtrees.ids() {
            for link in tables.comtrees.router_links(comtree)? {
                let info = tables.comtrees.clnk_info(comtree, link)?;
                let qid = tables.qmanager.alloc_q(link, info.rates, i32::MAX as u32, i32::MAX as u32)?;
                tables.comtrees.set_link_qnum(comtree, link, qid)?;
            }
        }

        let mut sockets = HashMap::new();
        for iface in tables.ifaces.ids() {
            let entry = tables.ifaces.get(iface)?;
            let socket = UdpSocket::bind((entry.ip, entry.port))
                .map_err(|e| anyhow::anyhow!("binding iface {iface} to {}:{}: {e}", entry.ip, entry.port))?;
            socket.set_read_timeout(Some(SHUTDOWN_POLL))?;
            sockets.insert(iface, Arc::new(socket));
        }

        let my_addr = crate::address::fadr_from_string(&config.my_adr)
            .ok_or_else(|| anyhow::anyhow!("bad my_adr {:?} in config", config.my_adr))?;

        let clock = RouterClock::new();
        let forwarder = Forwarder::new(tables.clone(), store.clone(), my_addr);
        let control = ControlHandler::new(tables.clone(), store.clone(), clock.clone());
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let (control_tx, control_rx) = bounded(config.control_threads * 64);

        Ok(RouterCore {
            tables,
            store,
            forwarder,
            control,
            clock,
            my_addr,
            sockets,
            shutdown: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            control_tx,
            control_rx,
            control_threads: config.control_threads,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the receive, drain, and control-worker threads. `self` must
    /// already be wrapped in an `Arc` since every thread closure needs a
    /// shared handle back into the router.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut handles = self.handles.lock().unwrap();

        for (&iface, socket) in &self.sockets {
            let this = self.clone();
            let socket = socket.clone();
            let rx = self.shutdown_rx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("forest-recv-{iface}"))
                    .spawn(move || this.receive_loop(iface, socket, rx))?,
            );
        }

        for link in self.tables.links.ids() {
            let this = self.clone();
            let rx = self.shutdown_rx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("forest-drain-{link}"))
                    .spawn(move || this.drain_loop(link, rx))?,
            );
        }

        for i in 0..self.control_threads {
            let this = self.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("forest-ctl-{i}"))
                    .spawn(move || this.control_worker())?,
            );
        }

        tracing::info!(
            ifaces = self.sockets.len(),
            links = self.tables.links.ids().len(),
            control_threads = self.control_threads,
            "router threads started"
        );
        Ok(())
    }

    /// Signal every thread to stop. Dropping the single retained sender
    /// disconnects the shutdown channel, so every `recv_timeout`/
    /// `try_recv` on a cloned receiver observes it on its next poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_tx.lock().unwrap().take();
    }

    pub fn join(&self) {
        for h in self.handles.lock().unwrap().drain(..) {
            let _ = h.join();
        }
        self.store.flush_pending();
    }

    fn receive_loop(self: Arc<Self>, iface: u32, socket: Arc<UdpSocket>, shutdown_rx: Receiver<()>) {
        let mut buf = vec![0u8; BUF_SIZ];
        loop {
            if matches!(shutdown_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }
            match socket.recv_from(&mut buf) {
                Ok((n, SocketAddr::V4(peer))) => self.on_datagram(iface, peer, &buf[..n]),
                Ok((_, SocketAddr::V6(_))) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => tracing::warn!(iface, error = %e, "recv_from failed"),
            }
        }
    }

    fn on_datagram(&self, iface: u32, peer: SocketAddrV4, bytes: &[u8]) {
        let pkt = match Packet::unpack(Bytes::copy_from_slice(bytes)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed datagram");
                return;
            }
        };
        let link = match self.tables.links.lookup_by_addr(*peer.ip(), peer.port()) {
            Some(l) => l,
            None => match self.handle_unconnected(iface, peer, &pkt) {
                Some(l) => l,
                None => return,
            },
        };
        let handle = match self.store.alloc(pkt) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "dropping datagram, packet store exhausted");
                return;
            }
        };
        for action in self.forwarder.process(link, handle) {
            self.apply_action(action);
        }
    }

    /// A datagram from an address with no established link is only
    /// accepted as a CONNECT carrying the nonce it was issued at
    /// `addLink` time; anything else from an unknown peer is dropped.
    fn handle_unconnected(&self, _iface: u32, peer: SocketAddrV4, pkt: &Packet) -> Option<u32> {
        if pkt.header.packet_type() != Some(PacketType::Connect) || pkt.payload.len() < 8 {
            tracing::warn!(%peer, "datagram from unknown peer is not a valid CONNECT");
            return None;
        }
        let nonce = u64::from_be_bytes(pkt.payload[..8].try_into().ok()?);
        let link = self.tables.links.lookup_by_nonce(nonce)?;
        match self.tables.links.connect(link, *peer.ip(), peer.port()) {
            Ok(()) => {
                tracing::info!(link, %peer, "link connected");
                Some(link)
            }
            Err(e) => {
                tracing::warn!(link, error = %e, "connect failed");
                None
            }
        }
    }

    fn apply_action(&self, action: ForwardAction) {
        match action {
            ForwardAction::Enqueue { link, clnk: _, handle } => match self.store.header(handle) {
                Ok(header) => self.enqueue_on_link(header.comtree, link, handle),
                Err(_) => self.store.free(handle),
            },
            ForwardAction::DeliverToControl(handle) => {
                if self.control_tx.try_send(handle).is_err() {
                    tracing::warn!("control queue full, dropping request");
                    self.store.free(handle);
                }
            }
            ForwardAction::PropagateSubscription { comtree, group, join } => {
                self.propagate_subscription(comtree, group, join);
            }
            ForwardAction::DirectReply { link, handle } => self.send_on_link(link, handle),
            ForwardAction::Dropped { handle, reason } => {
                tracing::trace!(reason = %reason, "packet dropped");
                self.store.free(handle);
            }
        }
    }

    /// Feed `handle` into the comtree-link's WDRR queue, freeing it if the
    /// link or its queue has since vanished.
    fn enqueue_on_link(&self, comtree: ComtreeNum, link: u32, handle: PacketHandle) {
        let Ok(header) = self.store.header(handle) else {
            self.store.free(handle);
            return;
        };
        match self.tables.comtrees.clnk_info(comtree, link) {
            Ok(info) => {
                if self.tables.qmanager.enqueue(link, info.qnum, handle, header.length as u32).is_err() {
                    self.store.free(handle);
                }
            }
            Err(_) => self.store.free(handle),
        }
    }

    fn propagate_subscription(&self, comtree: ComtreeNum, group: ForestAddr, join: bool) {
        let Ok(Some(parent)) = self.tables.comtrees.parent_link(comtree) else {
            return;
        };
        let payload = if join {
            encode_sub_unsub(&[group], &[])
        } else {
            encode_sub_unsub(&[], &[group])
        };
        let pkt = Packet::new(PacketType::SubUnsub as u8, 0, comtree, self.my_addr, 0, payload);
        if let Ok(handle) = self.store.alloc(pkt) {
            self.enqueue_on_link(comtree, parent, handle);
        }
    }

    /// Deliver a control request and route its reply back down the same
    /// comtree toward the requester's address (§4.7's "replies travel the
    /// same per-link queues as data").
    fn deliver_to_control(&self, handle: PacketHandle) {
        let header = match self.store.header(handle) {
            Ok(h) => h,
            Err(_) => return,
        };
        let payload = match self.store.payload(handle) {
            Ok(p) => p,
            Err(_) => {
                self.store.free(handle);
                return;
            }
        };
        self.store.free(handle);

        let reader = match CtlPktReader::parse(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed control packet");
                return;
            }
        };
        let reply_payload = self.control.handle(header.src_adr, reader);
        let reply = Packet::new(header.ptype, 0, header.comtree, self.my_addr, header.src_adr, reply_payload);
        if let Ok(reply_handle) = self.store.alloc(reply) {
            self.route_down(header.comtree, header.src_adr, reply_handle);
        }
    }

    /// Find the comtree-link toward `dst_adr`, preferring a directly
    /// attached peer (most control replies target one) and falling back
    /// to the route table.
    fn route_down(&self, comtree: ComtreeNum, dst_adr: ForestAddr, handle: PacketHandle) {
        let link = self.tables.links.lookup_by_peer_adr(dst_adr).or_else(|| {
            let clnk = self.tables.routes.lookup_unicast(comtree, dst_adr)?;
            let row = self.tables.comtrees.row(comtree)?;
            let row = row.lock().unwrap();
            row.router_links().into_iter().find(|&l| row.clnk_num(l) == Some(clnk))
        });
        match link {
            Some(link) => self.enqueue_on_link(comtree, link, handle),
            None => {
                tracing::warn!(comtree, dst_adr, "no route to deliver control reply");
                self.store.free(handle);
            }
        }
    }

    fn drain_loop(self: Arc<Self>, link: u32, shutdown_rx: Receiver<()>) {
        loop {
            if matches!(shutdown_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }
            let now = self.clock.now_ns();
            match self.tables.qmanager.dequeue(link, now) {
                Some((_qid, handle)) => self.send_on_link(link, handle),
                None => thread::sleep(DRAIN_TICK),
            }
        }
    }

    fn send_on_link(&self, link: u32, handle: PacketHandle) {
        let result = (|| -> crate::error::Result<()> {
            let header = self.store.header(handle)?;
            let payload = self.store.payload(handle)?;
            let entry = self.tables.links.get(link)?;
            let socket = self
                .sockets
                .get(&entry.iface)
                .ok_or_else(|| crate::error::RouterError::Internal(format!("iface {} has no bound socket", entry.iface)))?;
            let bytes = Packet { header, payload }.pack();
            let addr = SocketAddrV4::new(entry.peer_ip, entry.peer_port);
            let _ = socket.send_to(&bytes, addr);
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(link, error = %e, "failed to send queued packet");
        }
        self.store.free(handle);
    }

    fn control_worker(self: Arc<Self>) {
        loop {
            match self.control_rx.recv_timeout(SHUTDOWN_POLL) {
                Ok(handle) => self.deliver_to_control(handle),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
