//! Validation, routing, and replication pipeline for data-plane packets
//! (§4.6). Runs on the single receive thread, so flows keep their arrival
//! order through here; WDRR may reorder across flows once packets reach a
//! link's queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::{forest_adr, mcast_adr, ComtreeNum, ForestAddr, PacketType};
use crate::error::{Result, RouterError};
use crate::packet_filter::Direction;
use crate::packet_store::{PacketHandle, PacketStore};
use crate::tables::Tables;
use crate::wire::Packet;

/// What the forwarder decided to do with one packet. Sending/enqueuing the
/// resulting packets onto their links is the caller's job (the scheduler
/// owns the per-link queues `enqueue` feeds).
#[derive(Debug)]
pub enum ForwardAction {
    /// Hand the packet to the named comtree-link's queue.
    Enqueue { link: u32, clnk: u32, handle: PacketHandle },
    /// Packet addressed to this router's control handler.
    DeliverToControl(PacketHandle),
    /// A multicast group's upward-visible subscription state flipped;
    /// caller builds and forwards an aggregated SUB_UNSUB on the parent.
    PropagateSubscription { comtree: ComtreeNum, group: ForestAddr, join: bool },
    /// CONNECT/DISCONNECT admission reply: sent straight back out `link`,
    /// bypassing the comtree-link queue since admission happens before (or
    /// after) the link necessarily belongs to any comtree-link's schedule.
    DirectReply { link: u32, handle: PacketHandle },
    Dropped { handle: PacketHandle, reason: String },
}

pub struct Forwarder {
    tables: Arc<Tables>,
    store: Arc<PacketStore>,
    my_addr: ForestAddr,
    next_log_index: AtomicU64,
}

impl Forwarder {
    pub fn new(tables: Arc<Tables>, store: Arc<PacketStore>, my_addr: ForestAddr) -> Self {
        Forwarder {
            tables,
            store,
            my_addr,
            next_log_index: AtomicU64::new(0),
        }
    }

    fn log_if_matched(&self, link: u32, direction: Direction, header: &crate::wire::PacketHeader, cp_type: Option<u16>) {
        if self.tables.filters.any_match(link, direction, header.comtree, header.src_adr, header.dst_adr, header.ptype, cp_type) {
            self.tables.log.record(crate::packet_filter::LogEntry {
                packet_index: self.next_log_index.fetch_add(1, Ordering::Relaxed),
                direction,
                link,
                timestamp_ns: 0,
            });
        }
    }

    /// Run the §4.6 validation steps 2-4 (step 1, version/length, already
    /// happened in `Packet::unpack`).
    fn validate(&self, link: u32, header: &crate::wire::PacketHeader) -> Result<()> {
        let peer = self.tables.links.get(link)?;
        if !peer.peer_type.is_trusted() && header.src_adr != peer.peer_adr {
            return Err(RouterError::PeerUnreachable(format!(
                "untrusted link {link} spoofed srcAdr {}",
                header.src_adr
            )));
        }
        let comtree_row = self
            .tables
            .comtrees
            .row(header.comtree)
            .ok_or(RouterError::UnknownComtree(header.comtree))?;
        let on_comtree = comtree_row.lock().unwrap().clnk_num(link).is_some();
        if !on_comtree {
            return Err(RouterError::InvalidParameter(format!(
                "link {link} is not a comtree-link of {}",
                header.comtree
            )));
        }
        Ok(())
    }

    /// Process one arriving packet, producing zero or more actions. The
    /// caller is responsible for freeing `handle` once every action that
    /// references it has been consumed (multicast fan-out shares the
    /// buffer via `clone_pkt`, so the original handle is among the
    /// actions rather than freed here).
    pub fn process(&self, arriving_link: u32, handle: PacketHandle) -> Vec<ForwardAction> {
        let header = match self.store.header(handle) {
            Ok(h) => h,
            Err(_) => return vec![ForwardAction::Dropped { handle, reason: "stale handle".into() }],
        };

        self.log_if_matched(arriving_link, Direction::In, &header, None);

        if let Err(e) = self.validate(arriving_link, &header) {
            return vec![ForwardAction::Dropped { handle, reason: e.to_string() }];
        }

        match PacketType::from_u8(header.ptype) {
            Some(PacketType::ClientData) => self.dispatch_data(arriving_link, handle, &header),
            Some(PacketType::SubUnsub) => self.dispatch_sub_unsub(arriving_link, handle, &header),
            Some(PacketType::RteReply) => self.dispatch_rte_reply(arriving_link, handle, &header),
            Some(PacketType::ClientSig) | Some(PacketType::NetSig) => {
                if header.dst_adr == self.my_addr {
                    vec![ForwardAction::DeliverToControl(handle)]
                } else {
                    self.dispatch_data(arriving_link, handle, &header)
                }
            }
            Some(pt @ PacketType::Connect) | Some(pt @ PacketType::Disconnect) => {
                self.dispatch_connect(arriving_link, handle, &header, pt)
            }
            _ => vec![ForwardAction::Dropped { handle, reason: format!("unhandled ptype {}", header.ptype) }],
        }
    }

    /// CONNECT/DISCONNECT: nonce-authenticated link state change. Replies
    /// with the same packet, `ACK_FLAG` set, straight back out the
    /// arriving link. DISCONNECT additionally reverts the link table entry
    /// to its pre-connect binding. Idempotent: replaying the same packet
    /// (same `srcAdr`/comtree/payload nonce) just re-acks and, for
    /// DISCONNECT, no-ops if the link was already reverted.
    fn dispatch_connect(
        &self,
        arriving_link: u32,
        handle: PacketHandle,
        header: &crate::wire::PacketHeader,
        ptype: PacketType,
    ) -> Vec<ForwardAction> {
        if ptype == PacketType::Disconnect {
            let _ = self.tables.links.revert_entry(arriving_link);
        }
        let payload = match self.store.payload(handle) {
            Ok(p) => p,
            Err(_) => return vec![ForwardAction::Dropped { handle, reason: "stale handle".into() }],
        };
        let ack = Packet::new(
            header.ptype,
            header.flags | crate::address::ACK_FLAG,
            header.comtree,
            self.my_addr,
            header.src_adr,
            payload,
        );
        match self.store.alloc(ack) {
            Ok(reply_handle) => {
                self.store.free(handle);
                vec![ForwardAction::DirectReply { link: arriving_link, handle: reply_handle }]
            }
            Err(e) => vec![ForwardAction::Dropped { handle, reason: e.to_string() }],
        }
    }

    fn enqueue_toward(&self, comtree: ComtreeNum, link: u32, handle: PacketHandle) -> ForwardAction {
        let clnk = self
            .tables
            .comtrees
            .row(comtree)
            .and_then(|row| row.lock().unwrap().clnk_num(link));
        match clnk {
            Some(clnk) => ForwardAction::Enqueue { link, clnk, handle },
            None => ForwardAction::Dropped { handle, reason: format!("link {link} left comtree {comtree}") },
        }
    }

    fn dispatch_data(&self, arriving_link: u32, handle: PacketHandle, header: &crate::wire::PacketHeader) -> Vec<ForwardAction> {
        let arriving_clnk = self
            .tables
            .comtrees
            .row(header.comtree)
            .and_then(|r| r.lock().unwrap().clnk_num(arriving_link));

        if mcast_adr(header.dst_adr) {
            let targets = self.tables.routes.lookup_multicast(header.comtree, header.dst_adr);
            let mut actions = Vec::with_capacity(targets.len());
            let mut first = true;
            for clnk in targets {
                if Some(clnk) == arriving_clnk {
                    continue;
                }
                let Ok(info) = self.tables.comtrees.row(header.comtree).unwrap().lock().unwrap().clnk_info(clnk).cloned().ok_or(()) else {
                    continue;
                };
                let out_handle = if first {
                    first = false;
                    handle
                } else {
                    match self.store.clone_pkt(handle) {
                        Ok(h) => h,
                        Err(e) => {
                            actions.push(ForwardAction::Dropped { handle, reason: e.to_string() });
                            continue;
                        }
                    }
                };
                actions.push(ForwardAction::Enqueue { link: info.link, clnk, handle: out_handle });
            }
            if first {
                // nothing consumed the original handle
                actions.push(ForwardAction::Dropped { handle, reason: "no multicast fan-out target".into() });
            }
            return actions;
        }

        match self.tables.routes.lookup_unicast(header.comtree, header.dst_adr) {
            Some(clnk) => {
                let info = self.tables.comtrees.row(header.comtree).unwrap().lock().unwrap().clnk_info(clnk).cloned();
                match info {
                    Some(info) => vec![ForwardAction::Enqueue { link: info.link, clnk, handle }],
                    None => vec![ForwardAction::Dropped { handle, reason: "stale comtree-link".into() }],
                }
            }
            None => self.learn_route(arriving_link, handle, header),
        }
    }

    /// §4.6.1: no matching route. If the sender asked for route-learning,
    /// forward up to the comtree parent and reply downward so the route is
    /// installed for next time.
    fn learn_route(&self, arriving_link: u32, handle: PacketHandle, header: &crate::wire::PacketHeader) -> Vec<ForwardAction> {
        if !header.rte_req() {
            return vec![ForwardAction::Dropped { handle, reason: "no route, no RTE_REQ".into() }];
        }
        let Ok(parent) = self.tables.comtrees.parent_link(header.comtree) else {
            return vec![ForwardAction::Dropped { handle, reason: "unknown comtree".into() }];
        };
        let Some(parent_link) = parent else {
            return vec![ForwardAction::Dropped { handle, reason: "no parent link to learn route through".into() }];
        };

        let reply = Packet::new(
            PacketType::RteReply as u8,
            0,
            header.comtree,
            self.my_addr,
            header.src_adr,
            Bytes::new(),
        );
        let reply_handle = match self.store.alloc(reply) {
            Ok(h) => h,
            Err(e) => return vec![ForwardAction::Dropped { handle, reason: e.to_string() }],
        };

        let mut actions = vec![self.enqueue_toward(header.comtree, arriving_link, reply_handle)];
        actions.push(self.enqueue_toward(header.comtree, parent_link, handle));
        actions
    }

    fn dispatch_rte_reply(&self, arriving_link: u32, handle: PacketHandle, header: &crate::wire::PacketHeader) -> Vec<ForwardAction> {
        let Some(arriving_clnk) = self.tables.comtrees.row(header.comtree).and_then(|r| r.lock().unwrap().clnk_num(arriving_link)) else {
            return vec![ForwardAction::Dropped { handle, reason: "arriving link not in comtree".into() }];
        };
        if let Err(e) = self.tables.routes.set_link(header.comtree, header.src_adr, arriving_clnk) {
            return vec![ForwardAction::Dropped { handle, reason: e.to_string() }];
        }
        if header.dst_adr == self.my_addr {
            return vec![ForwardAction::Dropped { handle, reason: "route-reply reached its originator".into() }];
        }
        let Ok(Some(parent_link)) = self.tables.comtrees.parent_link(header.comtree) else {
            return vec![ForwardAction::Dropped { handle, reason: "no parent link".into() }];
        };
        vec![self.enqueue_toward(header.comtree, parent_link, handle)]
    }

    fn dispatch_sub_unsub(&self, arriving_link: u32, handle: PacketHandle, header: &crate::wire::PacketHeader) -> Vec<ForwardAction> {
        let Some(arriving_clnk) = self.tables.comtrees.row(header.comtree).and_then(|r| r.lock().unwrap().clnk_num(arriving_link)) else {
            return vec![ForwardAction::Dropped { handle, reason: "arriving link not in comtree".into() }];
        };
        let parent_link = self.tables.comtrees.parent_link(header.comtree).ok().flatten();

        let Ok(payload) = self.store.payload(handle) else {
            return vec![ForwardAction::Dropped { handle, reason: "stale handle".into() }];
        };
        let mut actions = Vec::new();
        if let Some((joins, leaves)) = parse_sub_unsub(payload) {
            for group in joins {
                let before = self.non_parent_subscribers(header.comtree, group, parent_link);
                let _ = self.tables.routes.add_link(header.comtree, group, arriving_clnk);
                let after = self.non_parent_subscribers(header.comtree, group, parent_link);
                if before == 0 && after > 0 {
                    actions.push(ForwardAction::PropagateSubscription { comtree: header.comtree, group, join: true });
                }
            }
            for group in leaves {
                let before = self.non_parent_subscribers(header.comtree, group, parent_link);
                let _ = self.tables.routes.remove_link(header.comtree, group, arriving_clnk);
                let after = self.non_parent_subscribers(header.comtree, group, parent_link);
                if before > 0 && after == 0 {
                    actions.push(ForwardAction::PropagateSubscription { comtree: header.comtree, group, join: false });
                }
            }
        }
        self.store.free(handle);
        actions
    }

    fn non_parent_subscribers(&self, comtree: ComtreeNum, group: ForestAddr, parent_link: Option<u32>) -> usize {
        let row = self.tables.comtrees.row(comtree);
        let Some(row) = row else { return 0 };
        let parent_clnk = parent_link.and_then(|l| row.lock().unwrap().clnk_num(l));
        self.tables
            .routes
            .lookup_multicast(comtree, group)
            .into_iter()
            .filter(|clnk| Some(*clnk) != parent_clnk)
            .count()
    }
}

/// `joinCount:u32, joinGroup:i32 * joinCount, leaveCount:u32, leaveGroup:i32
/// * leaveCount`, all big-endian, matching the other length-prefixed
/// integer lists in this protocol.
fn parse_sub_unsub(mut payload: Bytes) -> Option<(Vec<ForestAddr>, Vec<ForestAddr>)> {
    if payload.len() < 4 {
        return None;
    }
    let join_count = payload.get_u32() as usize;
    if payload.len() < join_count * 4 + 4 {
        return None;
    }
    let joins = (0..join_count).map(|_| payload.get_i32()).collect();
    let leave_count = payload.get_u32() as usize;
    if payload.len() < leave_count * 4 {
        return None;
    }
    let leaves = (0..leave_count).map(|_| payload.get_i32()).collect();
    Some((joins, leaves))
}

/// Encodes a SUB_UNSUB payload in the format `parse_sub_unsub` reads.
pub fn encode_sub_unsub(joins: &[ForestAddr], leaves: &[ForestAddr]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + 4 * (joins.len() + leaves.len()));
    buf.put_u32(joins.len() as u32);
    for g in joins {
        buf.put_i32(*g);
    }
    buf.put_u32(leaves.len() as u32);
    for g in leaves {
        buf.put_i32(*g);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeType;
    use std::net::Ipv4Addr;

    fn setup(my_zip: i32) -> (Arc<Tables>, Arc<PacketStore>, Forwarder, u32) {
        let tables = Arc::new(Tables::new(my_zip, 64));
        let store = Arc::new(PacketStore::new(64, 64));
        let link = tables.links.add_entry(1, Ipv4Addr::LOCALHOST, 2000, 1);
        tables.links.connect(link, Ipv4Addr::LOCALHOST, 2000).unwrap();
        tables.links.set_peer_adr(link, forest_adr(my_zip, 1), NodeType::Router).unwrap();
        tables.comtrees.add_comtree(1001).unwrap();
        tables.comtrees.add_link(1001, link, 0, false, false).unwrap();
        let my_addr = forest_adr(my_zip, 0);
        let fwd = Forwarder::new(tables.clone(), store.clone(), my_addr);
        (tables, store, fwd, link)
    }

    #[test]
    fn untrusted_spoofed_source_is_dropped() {
        let (tables, store, fwd, link) = setup(3);
        tables.links.set_peer_adr(link, forest_adr(3, 1), NodeType::Client).unwrap();
        let pkt = Packet::new(PacketType::ClientData as u8, 0, 1001, forest_adr(3, 99), forest_adr(3, 1), Bytes::new());
        let h = store.alloc(pkt).unwrap();
        let actions = fwd.process(link, h);
        assert!(matches!(actions.as_slice(), [ForwardAction::Dropped { .. }]));
    }

    #[test]
    fn unknown_route_without_rte_req_is_dropped() {
        let (_tables, store, fwd, link) = setup(3);
        let pkt = Packet::new(PacketType::ClientData as u8, 0, 1001, forest_adr(3, 1), forest_adr(3, 2), Bytes::new());
        let h = store.alloc(pkt).unwrap();
        let actions = fwd.process(link, h);
        assert!(matches!(actions.as_slice(), [ForwardAction::Dropped { .. }]));
    }

    #[test]
    fn unknown_route_with_rte_req_forwards_to_parent_and_replies() {
        let (tables, store, fwd, link) = setup(3);
        let parent = tables.links.add_entry(1, Ipv4Addr::new(10, 0, 0, 9), 3000, 2);
        tables.links.connect(parent, Ipv4Addr::new(10, 0, 0, 9), 3000).unwrap();
        tables.comtrees.add_link(1001, parent, 0, true, false).unwrap();
        tables.comtrees.set_parent_link(1001, Some(parent)).unwrap();

        let pkt = Packet::new(
            PacketType::ClientData as u8,
            crate::address::RTE_REQ,
            1001,
            forest_adr(3, 1),
            forest_adr(3, 2),
            Bytes::new(),
        );
        let h = store.alloc(pkt).unwrap();
        let actions = fwd.process(link, h);
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().any(|a| matches!(a, ForwardAction::Enqueue { link: l, .. } if *l == link)));
        assert!(actions.iter().any(|a| matches!(a, ForwardAction::Enqueue { link: l, .. } if *l == parent)));
    }

    #[test]
    fn sub_unsub_join_propagates_once_past_parent_only() {
        let (tables, store, fwd, link) = setup(3);
        let parent = tables.links.add_entry(1, Ipv4Addr::new(10, 0, 0, 9), 3000, 2);
        tables.links.connect(parent, Ipv4Addr::new(10, 0, 0, 9), 3000).unwrap();
        tables.comtrees.add_link(1001, parent, 0, true, false).unwrap();
        tables.comtrees.set_parent_link(1001, Some(parent)).unwrap();

        let payload = encode_sub_unsub(&[-500], &[]);
        let pkt = Packet::new(PacketType::SubUnsub as u8, 0, 1001, forest_adr(3, 1), 0, payload);
        let h = store.alloc(pkt).unwrap();
        let actions = fwd.process(link, h);
        assert!(matches!(
            actions.as_slice(),
            [ForwardAction::PropagateSubscription { join: true, group: -500, .. }]
        ));
        let clnk = tables.comtrees.row(1001).unwrap().lock().unwrap().clnk_num(link).unwrap();
        assert_eq!(tables.routes.lookup_multicast(1001, -500), vec![clnk]);
    }

    #[test]
    fn connect_replies_with_ack_flag_set_on_same_link() {
        let (tables, store, fwd, link) = setup(3);
        let peer = forest_adr(3, 1);
        let pkt = Packet::new(PacketType::Connect as u8, 0, 1001, peer, forest_adr(3, 0), Bytes::from_static(b"nonce"));
        let h = store.alloc(pkt).unwrap();
        let actions = fwd.process(link, h);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ForwardAction::DirectReply { link: l, handle } => {
                assert_eq!(*l, link);
                let header = store.header(*handle).unwrap();
                assert!(header.ack());
                assert_eq!(header.ptype, PacketType::Connect as u8);
                assert_eq!(header.src_adr, forest_adr(3, 0));
                assert_eq!(header.dst_adr, peer);
                store.free(*handle);
            }
            other => panic!("expected DirectReply, got a different action: {other:?}"),
        }
        assert!(tables.links.get(link).is_ok(), "connect does not revert the link entry");
    }

    #[test]
    fn disconnect_reverts_link_entry_and_still_acks() {
        let (tables, store, fwd, link) = setup(3);
        let before = tables.links.get(link).unwrap();
        tables.links.connect(link, Ipv4Addr::new(10, 0, 0, 5), 4000).unwrap();
        let reconnected = tables.links.get(link).unwrap();
        assert_ne!(reconnected.peer_port, before.peer_port);

        let pkt = Packet::new(PacketType::Disconnect as u8, 0, 1001, forest_adr(3, 1), forest_adr(3, 0), Bytes::new());
        let h = store.alloc(pkt).unwrap();
        let actions = fwd.process(link, h);
        assert_eq!(actions.len(), 1);
        let ForwardAction::DirectReply { handle, .. } = &actions[0] else {
            panic!("expected DirectReply");
        };
        let header = store.header(*handle).unwrap();
        assert!(header.ack());
        store.free(*handle);

        let reverted = tables.links.get(link).unwrap();
        assert_eq!(reverted.peer_port, before.peer_port, "disconnect reverts the link entry");
    }
}
