//! Parses request control packets, mutates tables under their row locks,
//! and builds reply control packets (§4.7).
//!
//! Comtree *construction* operations (`COMTREE_PATH`, `ADD_BRANCH`,
//! `CONFIRM`, `ABORT`, `PRUNE`, `ADD_NODE`, `DROP_NODE`) are the
//! controller's multi-router path-finding protocol and stay out of scope;
//! this handler only answers the router-local table-mutating requests a
//! controller sends once it has already decided on a comtree's shape.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::address::ForestAddr;
use crate::clock::RouterClock;
use crate::comtree_table::ComtreeNum;
use crate::ctlpkt::{CpMode, CpType, CtlPktReader, CtlPktWriter};
use crate::error::{Result, RouterError};
use crate::packet_filter::{Direction, PacketFilter};
use crate::packet_store::PacketStore;
use crate::rate_spec::RateSpec;
use crate::tables::Tables;

const DEDUP_TTL_NS: u64 = 30_000_000_000;

struct PendingReply {
    reply: Bytes,
    expires_at_ns: u64,
}

pub struct ControlHandler {
    tables: Arc<Tables>,
    store: Arc<PacketStore>,
    clock: RouterClock,
    dedup: Mutex<HashMap<(ForestAddr, u64), PendingReply>>,
}

impl ControlHandler {
    pub fn new(tables: Arc<Tables>, store: Arc<PacketStore>, clock: RouterClock) -> Self {
        ControlHandler {
            tables,
            store,
            clock,
            dedup: Mutex::new(HashMap::new()),
        }
    }

    fn release_queued(&self, handles: Vec<crate::packet_store::PacketHandle>) {
        for h in handles {
            self.store.free(h);
        }
    }

    /// Answer one request, replaying a cached reply if `(src_adr, seqNum)`
    /// was already handled within the dedup window — the idempotence
    /// §4.7 requires for retransmitted requests.
    pub fn handle(&self, src_adr: ForestAddr, mut reader: CtlPktReader) -> Bytes {
        let key = (src_adr, reader.seq_num);
        let now = self.clock.now_ns();
        {
            let mut dedup = self.dedup.lock().unwrap();
            dedup.retain(|_, p| p.expires_at_ns > now);
            if let Some(pending) = dedup.get(&key) {
                return pending.reply.clone();
            }
        }

        let cp_type = reader.cp_type;
        let seq_num = reader.seq_num;
        let writer = match self.dispatch(cp_type, &mut reader) {
            Ok(w) => w,
            Err(e) => {
                let mut w = CtlPktWriter::new(cp_type, CpMode::NegReply, seq_num);
                w.put_string(&e.to_string());
                w
            }
        };
        let reply = writer.finish();
        self.dedup.lock().unwrap().insert(
            key,
            PendingReply {
                reply: reply.clone(),
                expires_at_ns: now + DEDUP_TTL_NS,
            },
        );
        reply
    }

    fn dispatch(&self, cp_type: CpType, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        match cp_type {
            CpType::AddIface => self.add_iface(r),
            CpType::DropIface => self.drop_iface(r),
            CpType::GetIface => self.get_iface(r),
            CpType::ModIface => self.mod_iface(r),
            CpType::GetIfaceSet => self.get_iface_set(r),
            CpType::AddLink => self.add_link(r),
            CpType::DropLink => self.drop_link(r),
            CpType::GetLink => self.get_link(r),
            CpType::ModLink => self.mod_link(r),
            CpType::GetLinkSet => self.get_link_set(r),
            CpType::AddComtree => self.add_comtree(r),
            CpType::DropComtree => self.drop_comtree(r),
            CpType::GetComtree => self.get_comtree(r),
            CpType::ModComtree => self.mod_comtree(r),
            CpType::AddComtreeLink => self.add_comtree_link(r),
            CpType::DropComtreeLink => self.drop_comtree_link(r),
            CpType::ModComtreeLink => self.mod_comtree_link(r),
            CpType::GetComtreeLink => self.get_comtree_link(r),
            CpType::GetComtreeSet => self.get_comtree_set(r),
            CpType::AddRoute => self.add_route(r),
            CpType::DropRoute => self.drop_route(r),
            CpType::GetRoute => self.get_route(r),
            CpType::ModRoute => self.mod_route(r),
            CpType::AddRouteLink => self.add_route_link(r),
            CpType::DropRouteLink => self.drop_route_link(r),
            CpType::GetRouteSet => self.get_route_set(r),
            CpType::AddFilter => self.add_filter(r),
            CpType::DropFilter => self.drop_filter(r),
            CpType::GetFilter => self.get_filter(r),
            CpType::ModFilter => self.mod_filter(r),
            CpType::GetFilterSet => self.get_filter_set(r),
            CpType::EnablePacketLog => self.enable_packet_log(r),
            CpType::GetLoggedPackets => self.get_logged_packets(r),
            CpType::ConfigLeaf => self.config_leaf(r),
            other => Err(RouterError::InvalidParameter(format!("{other:?} is out of scope for this router"))),
        }
    }

    fn reply(&self, cp_type: CpType, seq_num: u64) -> CtlPktWriter {
        CtlPktWriter::new(cp_type, CpMode::PosReply, seq_num)
    }

    /// `fmtAddIface(iface, peerIp, rateSpec, seqNum)` / `xtrAddIfaceReply`
    /// returns `(ip, port)`.
    fn add_iface(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let iface = r.get_u32()?;
        let ip = Ipv4Addr::from(r.get_u32()?);
        let port = r.get_u16()?;
        let rates = r.get_rate_spec()?;
        self.tables.ifaces.add(iface, ip, port, rates.clamp_to_bounds())?;
        let mut w = self.reply(CpType::AddIface, r.seq_num);
        w.put_u32(u32::from(ip)).put_u16(port);
        Ok(w)
    }

    /// `fmtDropIfaceReply` returns the `RateSpec` freed by the removal.
    fn drop_iface(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let iface = r.get_u32()?;
        let entry = self.tables.ifaces.get(iface)?;
        self.tables.ifaces.remove(iface)?;
        let mut w = self.reply(CpType::DropIface, r.seq_num);
        w.put_rate_spec(&entry.rates);
        Ok(w)
    }

    fn get_iface(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let iface = r.get_u32()?;
        let entry = self.tables.ifaces.get(iface)?;
        let mut w = self.reply(CpType::GetIface, r.seq_num);
        w.put_u32(u32::from(entry.ip)).put_u16(entry.port).put_rate_spec(&entry.rates);
        Ok(w)
    }

    fn mod_iface(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let iface = r.get_u32()?;
        let rates = r.get_rate_spec()?;
        self.tables.ifaces.set_rates(iface, rates.clamp_to_bounds())?;
        Ok(self.reply(CpType::ModIface, r.seq_num))
    }

    fn get_iface_set(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let ids = self.tables.ifaces.ids();
        let mut w = self.reply(CpType::GetIfaceSet, r.seq_num);
        w.put_int_vec(&ids.iter().map(|&i| i as i32).collect::<Vec<_>>());
        Ok(w)
    }

    /// `fmtAddLink(peerType, iface, link, peerIp, peerPort, peerAdr, nonce,
    /// seqNum)` / `xtrAddLinkReply` returns `(link, peerAdr)`.
    fn add_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let peer_type_raw = r.get_u16()?;
        let peer_type = crate::address::NodeType::from_u8(peer_type_raw as u8)
            .ok_or_else(|| RouterError::InvalidParameter(format!("bad peer type {peer_type_raw}")))?;
        let iface = r.get_u32()?;
        let peer_ip = Ipv4Addr::from(r.get_u32()?);
        let peer_port = r.get_u16()?;
        let peer_adr = r.get_fadr()?;
        let nonce = r.get_u64()?;

        self.tables.ifaces.get(iface)?;
        let link = self.tables.links.add_entry(iface, peer_ip, peer_port, nonce);
        self.tables.links.set_peer_adr(link, peer_adr, peer_type)?;
        self.tables.qmanager.add_link(link, RateSpec::UNSET);

        let mut w = self.reply(CpType::AddLink, r.seq_num);
        w.put_u32(link).put_fadr(peer_adr);
        Ok(w)
    }

    /// `fmtDropLinkReply` returns the `RateSpec` freed by the removal.
    fn drop_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let link = r.get_u32()?;
        let entry = self.tables.links.remove(link)?;
        for comtree in self.tables.comtrees.comtrees_on_link(link) {
            if let Ok(clnk) = self
                .tables
                .comtrees
                .row(comtree)
                .ok_or(RouterError::UnknownComtree(comtree))
                .and_then(|row| row.lock().unwrap().clnk_num(link).ok_or(RouterError::InvalidParameter("stale clnk".into())))
            {
                self.tables.routes.purge(comtree, clnk);
            }
            let _ = self.tables.comtrees.remove_link(comtree, link);
        }
        let drained = self.tables.qmanager.remove_link(link);
        self.release_queued(drained);
        let mut w = self.reply(CpType::DropLink, r.seq_num);
        w.put_rate_spec(&entry.rates);
        Ok(w)
    }

    fn get_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let link = r.get_u32()?;
        let entry = self.tables.links.get(link)?;
        let mut w = self.reply(CpType::GetLink, r.seq_num);
        w.put_u32(entry.iface)
            .put_fadr(entry.peer_adr)
            .put_rate_spec(&entry.rates);
        Ok(w)
    }

    fn mod_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let link = r.get_u32()?;
        let rates = r.get_rate_spec()?;
        self.tables.links.set_rates(link, rates.clamp_to_bounds())?;
        self.tables.qmanager.set_link_rates(link, rates).ok();
        Ok(self.reply(CpType::ModLink, r.seq_num))
    }

    fn get_link_set(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let ids = self.tables.links.ids();
        let mut w = self.reply(CpType::GetLinkSet, r.seq_num);
        w.put_int_vec(&ids.iter().map(|&i| i as i32).collect::<Vec<_>>());
        Ok(w)
    }

    fn add_comtree(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        self.tables.comtrees.add_comtree(comtree)?;
        Ok(self.reply(CpType::AddComtree, r.seq_num))
    }

    fn drop_comtree(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        for link in self.tables.comtrees.router_links(comtree)? {
            if let Ok(info) = self.tables.comtrees.clnk_info(comtree, link) {
                let drained = self.tables.qmanager.free_q(link, info.qnum);
                self.release_queued(drained);
            }
            if let Some(clnk) = self.tables.comtrees.row(comtree).unwrap().lock().unwrap().clnk_num(link) {
                self.tables.routes.purge(comtree, clnk);
            }
        }
        self.tables.comtrees.remove_comtree(comtree)?;
        Ok(self.reply(CpType::DropComtree, r.seq_num))
    }

    /// `fmtGetComtreeReply` returns `(comtree, linkCount, coreFlag-as-int,
    /// parentLink)`.
    fn get_comtree(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let links = self.tables.comtrees.router_links(comtree)?;
        let core_flag = self.tables.comtrees.is_core_flag(comtree)?;
        let parent = self.tables.comtrees.parent_link(comtree)?.unwrap_or(0);
        let mut w = self.reply(CpType::GetComtree, r.seq_num);
        w.put_u32(comtree).put_u32(links.len() as u32).put_u16(core_flag as u16).put_u32(parent);
        Ok(w)
    }

    fn get_comtree_set(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let ids = self.tables.comtrees.ids();
        let mut w = self.reply(CpType::GetComtreeSet, r.seq_num);
        w.put_int_vec(&ids.iter().map(|&c| c as i32).collect::<Vec<_>>());
        Ok(w)
    }

    fn mod_comtree(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let core_flag = r.get_u16()? != 0;
        let parent = r.get_u32()?;
        self.tables.comtrees.set_core_flag(comtree, core_flag)?;
        self.tables.comtrees.set_parent_link(comtree, if parent == 0 { None } else { Some(parent) })?;
        Ok(self.reply(CpType::ModComtree, r.seq_num))
    }

    /// `is_core` and `is_router` are independent flags: a core link is
    /// always implicitly a router link (§3 invariant), but a router link
    /// need not be on the core path.
    fn add_comtree_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let link = r.get_u32()?;
        let dest = r.get_s32()?;
        let is_core = r.get_u16()? != 0;
        let is_router = r.get_u16()? != 0;
        let rates = r.get_rate_spec()?;
        let clnk = self.tables.comtrees.add_link(comtree, link, dest, is_core, is_router)?;
        self.tables.comtrees.set_link_rates(comtree, link, rates.clamp_to_bounds())?;
        let qid = self.tables.qmanager.alloc_q(link, rates, i32::MAX as u32, i32::MAX as u32)?;
        self.tables.comtrees.set_link_qnum(comtree, link, qid)?;
        let mut w = self.reply(CpType::AddComtreeLink, r.seq_num);
        w.put_u32(clnk).put_u32(qid);
        Ok(w)
    }

    fn get_comtree_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let clnk = r.get_u32()?;
        let info = self.tables.comtrees.clnk_info_by_clnk(comtree, clnk)?;
        let mut w = self.reply(CpType::GetComtreeLink, r.seq_num);
        w.put_u32(info.link).put_s32(info.dest).put_u32(info.qnum).put_rate_spec(&info.rates);
        Ok(w)
    }

    /// `fmtDropComtreeLinkReply` returns the `RateSpec` freed by the
    /// removal.
    fn drop_comtree_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let link = r.get_u32()?;
        let info = self.tables.comtrees.clnk_info(comtree, link)?;
        let clnk = self
            .tables
            .comtrees
            .row(comtree)
            .unwrap()
            .lock()
            .unwrap()
            .clnk_num(link)
            .ok_or(RouterError::InvalidParameter("link not in comtree".into()))?;
        self.tables.routes.purge(comtree, clnk);
        self.tables.comtrees.remove_link(comtree, link)?;
        let freed = self.tables.qmanager.free_q(link, info.qnum);
        self.release_queued(freed);
        let mut w = self.reply(CpType::DropComtreeLink, r.seq_num);
        w.put_rate_spec(&info.rates);
        Ok(w)
    }

    fn mod_comtree_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let link = r.get_u32()?;
        let rates = r.get_rate_spec()?;
        self.tables.comtrees.set_link_rates(comtree, link, rates.clamp_to_bounds())?;
        let info = self.tables.comtrees.clnk_info(comtree, link)?;
        self.tables.qmanager.set_q_rates(link, info.qnum, rates).ok();
        Ok(self.reply(CpType::ModComtreeLink, r.seq_num))
    }

    fn add_route(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let adr = r.get_fadr()?;
        let link = r.get_u32()?;
        let clnk = self
            .tables
            .comtrees
            .row(comtree)
            .ok_or(RouterError::UnknownComtree(comtree))?
            .lock()
            .unwrap()
            .clnk_num(link)
            .ok_or(RouterError::InvalidParameter("link not in comtree".into()))?;
        self.tables.routes.set_link(comtree, adr, clnk)?;
        Ok(self.reply(CpType::AddRoute, r.seq_num))
    }

    fn drop_route(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let adr = r.get_fadr()?;
        self.tables.routes.remove(comtree, adr)?;
        Ok(self.reply(CpType::DropRoute, r.seq_num))
    }

    /// `fmtGetRouteReply` returns `(comtree, address, links)` — `links` is
    /// the single outgoing comtree-link for a unicast route, or the full
    /// fan-out set for a multicast one.
    fn get_route(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let adr = r.get_fadr()?;
        let links: Vec<i32> = if let Some(clnk) = self.tables.routes.lookup_unicast(comtree, adr) {
            vec![clnk as i32]
        } else {
            let clnks = self.tables.routes.lookup_multicast(comtree, adr);
            if clnks.is_empty() {
                return Err(RouterError::UnknownRoute { comtree, address: adr });
            }
            clnks.iter().map(|&c| c as i32).collect()
        };
        let mut w = self.reply(CpType::GetRoute, r.seq_num);
        w.put_u32(comtree).put_fadr(adr).put_int_vec(&links);
        Ok(w)
    }

    /// Replaces a unicast route's outgoing link; same effect as `addRoute`
    /// since `RouteTable::set_link` always overwrites a prior binding.
    fn mod_route(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let adr = r.get_fadr()?;
        let link = r.get_u32()?;
        let clnk = self
            .tables
            .comtrees
            .row(comtree)
            .ok_or(RouterError::UnknownComtree(comtree))?
            .lock()
            .unwrap()
            .clnk_num(link)
            .ok_or(RouterError::InvalidParameter("link not in comtree".into()))?;
        self.tables.routes.set_link(comtree, adr, clnk)?;
        Ok(self.reply(CpType::ModRoute, r.seq_num))
    }

    fn get_route_set(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let ids = self.tables.routes.ids();
        let mut w = self.reply(CpType::GetRouteSet, r.seq_num);
        let flat: Vec<i32> = ids.iter().flat_map(|&(c, a)| [c as i32, a]).collect();
        w.put_int_vec(&flat);
        Ok(w)
    }

    fn add_route_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let adr = r.get_fadr()?;
        let link = r.get_u32()?;
        let clnk = self
            .tables
            .comtrees
            .row(comtree)
            .ok_or(RouterError::UnknownComtree(comtree))?
            .lock()
            .unwrap()
            .clnk_num(link)
            .ok_or(RouterError::InvalidParameter("link not in comtree".into()))?;
        self.tables.routes.add_link(comtree, adr, clnk)?;
        Ok(self.reply(CpType::AddRouteLink, r.seq_num))
    }

    fn drop_route_link(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let comtree: ComtreeNum = r.get_u32()?;
        let adr = r.get_fadr()?;
        let link = r.get_u32()?;
        let clnk = self
            .tables
            .comtrees
            .row(comtree)
            .ok_or(RouterError::UnknownComtree(comtree))?
            .lock()
            .unwrap()
            .clnk_num(link)
            .ok_or(RouterError::InvalidParameter("link not in comtree".into()))?;
        self.tables.routes.remove_link(comtree, adr, clnk)?;
        Ok(self.reply(CpType::DropRouteLink, r.seq_num))
    }

    fn add_filter(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let on = r.get_u16()? != 0;
        let link = r.get_u32()?;
        let direction = r.get_u16()?;
        let comtree: ComtreeNum = r.get_u32()?;
        let idx = self.tables.filters.add(PacketFilter {
            on,
            link: if link == 0 { None } else { Some(link) },
            direction: match direction {
                1 => Some(Direction::In),
                2 => Some(Direction::Out),
                _ => None,
            },
            comtree: if comtree == 0 { None } else { Some(comtree) },
            ..Default::default()
        });
        let mut w = self.reply(CpType::AddFilter, r.seq_num);
        w.put_u32(idx as u32);
        Ok(w)
    }

    fn drop_filter(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let idx = r.get_u32()? as usize;
        self.tables.filters.remove(idx);
        Ok(self.reply(CpType::DropFilter, r.seq_num))
    }

    fn get_filter(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let idx = r.get_u32()? as usize;
        let f = self.tables.filters.get(idx)?;
        let mut w = self.reply(CpType::GetFilter, r.seq_num);
        w.put_u16(f.on as u16)
            .put_u32(f.link.unwrap_or(0))
            .put_u16(match f.direction {
                Some(Direction::In) => 1,
                Some(Direction::Out) => 2,
                None => 0,
            })
            .put_u32(f.comtree.unwrap_or(0));
        Ok(w)
    }

    fn mod_filter(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let idx = r.get_u32()? as usize;
        let on = r.get_u16()? != 0;
        let link = r.get_u32()?;
        let direction = r.get_u16()?;
        let comtree = r.get_u32()?;
        self.tables.filters.set(
            idx,
            PacketFilter {
                on,
                link: if link == 0 { None } else { Some(link) },
                direction: match direction {
                    1 => Some(Direction::In),
                    2 => Some(Direction::Out),
                    _ => None,
                },
                comtree: if comtree == 0 { None } else { Some(comtree) },
                ..Default::default()
            },
        )?;
        Ok(self.reply(CpType::ModFilter, r.seq_num))
    }

    fn get_filter_set(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let ids = self.tables.filters.ids();
        let mut w = self.reply(CpType::GetFilterSet, r.seq_num);
        w.put_int_vec(&ids.iter().map(|&i| i as i32).collect::<Vec<_>>());
        Ok(w)
    }

    fn enable_packet_log(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let enabled = r.get_u16()? != 0;
        self.tables.filters.set_enabled(enabled);
        Ok(self.reply(CpType::EnablePacketLog, r.seq_num))
    }

    fn get_logged_packets(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let entries = self.tables.log.snapshot();
        let mut w = self.reply(CpType::GetLoggedPackets, r.seq_num);
        let flat: Vec<i32> = entries
            .iter()
            .flat_map(|e| [e.packet_index as i32, e.link as i32])
            .collect();
        w.put_int_vec(&flat);
        Ok(w)
    }

    /// `fmtConfigLeaf` carries `(clientAdr, routerAdr, routerIp,
    /// routerPort, nonce)` — the payload the network manager returns in
    /// `CONFIG_LEAF`.
    fn config_leaf(&self, r: &mut CtlPktReader) -> Result<CtlPktWriter> {
        let client_adr = r.get_fadr()?;
        let router_adr = r.get_fadr()?;
        let router_ip = r.get_u32()?;
        let router_port = r.get_u16()?;
        let nonce = r.get_u64()?;
        let mut w = self.reply(CpType::ConfigLeaf, r.seq_num);
        w.put_fadr(client_adr).put_fadr(router_adr).put_u32(router_ip).put_u16(router_port).put_u64(nonce);
        Ok(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ControlHandler {
        ControlHandler::new(Arc::new(Tables::new(3, 16)), Arc::new(PacketStore::new(64, 64)), RouterClock::new())
    }

    #[test]
    fn add_then_drop_iface_round_trips_rates() {
        let h = handler();
        let mut w = CtlPktWriter::new(CpType::AddIface, CpMode::Request, 1);
        w.put_u32(1).put_u32(u32::from(Ipv4Addr::LOCALHOST)).put_u16(2000).put_rate_spec(&RateSpec::uniform(1000));
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::PosReply);

        let mut w = CtlPktWriter::new(CpType::DropIface, CpMode::Request, 2);
        w.put_u32(1);
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let mut r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::PosReply);
        assert_eq!(r.get_rate_spec().unwrap(), RateSpec::uniform(1000).clamp_to_bounds());
    }

    #[test]
    fn retransmitted_request_replays_cached_reply() {
        let h = handler();
        let mut w = CtlPktWriter::new(CpType::AddComtree, CpMode::Request, 9);
        w.put_u32(1001);
        let bytes = w.finish();
        let r1 = h.handle(100, CtlPktReader::parse(bytes.clone()).unwrap());
        // second add_comtree(1001) would normally fail (duplicate); dedup
        // must return the first reply instead of re-running the handler.
        let r2 = h.handle(100, CtlPktReader::parse(bytes).unwrap());
        assert_eq!(r1, r2);
    }

    #[test]
    fn unknown_comtree_on_add_link_is_neg_reply() {
        let h = handler();
        let mut w = CtlPktWriter::new(CpType::AddComtreeLink, CpMode::Request, 1);
        w.put_u32(9999).put_u32(1).put_s32(0).put_u16(0).put_u16(0).put_rate_spec(&RateSpec::uniform(10));
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::NegReply);
    }

    #[test]
    fn get_link_set_lists_every_link() {
        let h = handler();
        let mut w = CtlPktWriter::new(CpType::AddIface, CpMode::Request, 1);
        w.put_u32(1).put_u32(u32::from(Ipv4Addr::LOCALHOST)).put_u16(2000).put_rate_spec(&RateSpec::uniform(1000));
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let mut w = CtlPktWriter::new(CpType::AddLink, CpMode::Request, 2);
        w.put_u16(crate::address::NodeType::Router as u16)
            .put_u32(1)
            .put_u32(u32::from(Ipv4Addr::new(10, 0, 0, 2)))
            .put_u16(3000)
            .put_fadr(crate::address::forest_adr(3, 1))
            .put_u64(42);
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let w = CtlPktWriter::new(CpType::GetLinkSet, CpMode::Request, 3);
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let mut r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::PosReply);
        assert_eq!(r.get_int_vec().unwrap(), vec![1]);
    }

    #[test]
    fn add_route_then_get_route_round_trips_link() {
        let h = handler();
        let mut w = CtlPktWriter::new(CpType::AddComtree, CpMode::Request, 1);
        w.put_u32(1001);
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let mut w = CtlPktWriter::new(CpType::AddComtreeLink, CpMode::Request, 2);
        w.put_u32(1001).put_u32(5).put_s32(0).put_u16(0).put_u16(1).put_rate_spec(&RateSpec::uniform(1000));
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let dst = crate::address::forest_adr(3, 2);
        let mut w = CtlPktWriter::new(CpType::AddRoute, CpMode::Request, 3);
        w.put_u32(1001).put_fadr(dst).put_u32(5);
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let mut w = CtlPktWriter::new(CpType::GetRoute, CpMode::Request, 4);
        w.put_u32(1001).put_fadr(dst);
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let mut r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::PosReply);
        assert_eq!(r.get_u32().unwrap(), 1001);
        assert_eq!(r.get_fadr().unwrap(), dst);
        assert_eq!(r.get_int_vec().unwrap(), vec![1]);

        let mut w = CtlPktWriter::new(CpType::DropRoute, CpMode::Request, 5);
        w.put_u32(1001).put_fadr(dst);
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let mut w = CtlPktWriter::new(CpType::GetRoute, CpMode::Request, 6);
        w.put_u32(1001).put_fadr(dst);
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::NegReply, "route was dropped");
    }

    #[test]
    fn mod_comtree_rejects_non_router_parent_link() {
        let h = handler();
        let mut w = CtlPktWriter::new(CpType::AddComtree, CpMode::Request, 1);
        w.put_u32(1001);
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        // leaf link (is_core=false, is_router=false)
        let mut w = CtlPktWriter::new(CpType::AddComtreeLink, CpMode::Request, 2);
        w.put_u32(1001).put_u32(5).put_s32(0).put_u16(0).put_u16(0).put_rate_spec(&RateSpec::uniform(1000));
        h.handle(100, CtlPktReader::parse(w.finish()).unwrap());

        let mut w = CtlPktWriter::new(CpType::ModComtree, CpMode::Request, 3);
        w.put_u32(1001).put_u16(0).put_u32(5);
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::NegReply, "link 5 is a leaf link, not a router-link");
    }

    #[test]
    fn comtree_path_is_out_of_scope() {
        let h = handler();
        let w = CtlPktWriter::new(CpType::ComtreePath, CpMode::Request, 1);
        let reply = h.handle(100, CtlPktReader::parse(w.finish()).unwrap());
        let r = CtlPktReader::parse(reply).unwrap();
        assert_eq!(r.mode, CpMode::NegReply);
    }
}
