//! Per-link table: peer identity, nonce, rates, counters (§4.2).
//!
//! Before a link connects it is indexed by its nonce; `connect` atomically
//! swaps that index entry for one keyed by `(peerIp, peerPort)`, matching
//! the invariant that exactly one of the two keys names a live link at a
//! time. A second index keyed by peer Forest address serves leaf lookups.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::{ForestAddr, NodeType};
use crate::error::{Result, RouterError};
use crate::rate_spec::RateSpec;

#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub in_bytes: u64,
    pub in_pkts: u64,
    pub out_bytes: u64,
    pub out_pkts: u64,
}

impl LinkStats {
    pub fn count_in(&mut self, len: usize) {
        self.in_bytes += len as u64;
        self.in_pkts += 1;
    }

    pub fn count_out(&mut self, len: usize) {
        self.out_bytes += len as u64;
        self.out_pkts += 1;
    }
}

#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub link: u32,
    pub iface: u32,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub peer_type: NodeType,
    pub peer_adr: ForestAddr,
    pub connected: bool,
    pub nonce: u64,
    pub rates: RateSpec,
    pub avail_rates: RateSpec,
    pub stats: LinkStats,
    prev_ip: Option<Ipv4Addr>,
    prev_port: Option<u16>,
}

fn hashkey(ip: Ipv4Addr, port: u16) -> u64 {
    (u32::from(ip) as u64) << 32 | port as u64
}

pub struct LinkTable {
    rows: Mutex<HashMap<u32, Arc<Mutex<LinkEntry>>>>,
    primary: Mutex<HashMap<u64, u32>>,
    by_peer_adr: Mutex<HashMap<ForestAddr, u32>>,
    next_id: AtomicU32,
}

impl LinkTable {
    pub fn new() -> Self {
        LinkTable {
            rows: Mutex::new(HashMap::new()),
            primary: Mutex::new(HashMap::new()),
            by_peer_adr: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Reserve a "not yet connected" link, addressable by `nonce` until
    /// `connect` is called.
    pub fn add_entry(&self, iface: u32, peer_ip: Ipv4Addr, peer_port: u16, nonce: u64) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = LinkEntry {
            link: id,
            iface,
            peer_ip,
            peer_port,
            peer_type: NodeType::Undef,
            peer_adr: 0,
            connected: false,
            nonce,
            rates: RateSpec::UNSET,
            avail_rates: RateSpec::UNSET,
            stats: LinkStats::default(),
            prev_ip: None,
            prev_port: None,
        };
        self.rows.lock().unwrap().insert(id, Arc::new(Mutex::new(entry)));
        self.primary.lock().unwrap().insert(nonce, id);
        id
    }

    pub fn row(&self, link: u32) -> Option<Arc<Mutex<LinkEntry>>> {
        self.rows.lock().unwrap().get(&link).cloned()
    }

    pub fn get(&self, link: u32) -> Result<LinkEntry> {
        self.row(link)
            .map(|r| r.lock().unwrap().clone())
            .ok_or(RouterError::InvalidParameter(format!("no such link {link}")))
    }

    pub fn set_rates(&self, link: u32, rates: RateSpec) -> Result<()> {
        let row = self.row(link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        row.lock().unwrap().rates = rates;
        Ok(())
    }

    pub fn set_peer_adr(&self, link: u32, adr: ForestAddr, peer_type: NodeType) -> Result<()> {
        let row = self.row(link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        {
            let mut e = row.lock().unwrap();
            e.peer_adr = adr;
            e.peer_type = peer_type;
        }
        if !peer_type.is_trusted() || peer_type == NodeType::Client || peer_type == NodeType::Server {
            self.by_peer_adr.lock().unwrap().insert(adr, link);
        }
        Ok(())
    }

    /// Bind the link's actual peer endpoint, swapping its primary index
    /// entry from `nonce` to `(peerIp, peerPort)`.
    pub fn connect(&self, link: u32, peer_ip: Ipv4Addr, peer_port: u16) -> Result<()> {
        let row = self.row(link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let mut primary = self.primary.lock().unwrap();
        let mut e = row.lock().unwrap();
        primary.remove(&e.nonce);
        e.peer_ip = peer_ip;
        e.peer_port = peer_port;
        e.connected = true;
        primary.insert(hashkey(peer_ip, peer_port), link);
        Ok(())
    }

    /// Swap the `(ip,port)` binding while keeping the same link id,
    /// remembering the previous binding so `revert_entry` can undo it.
    pub fn remap_entry(&self, link: u32, new_ip: Ipv4Addr, new_port: u16) -> Result<()> {
        let row = self.row(link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let mut primary = self.primary.lock().unwrap();
        let mut e = row.lock().unwrap();
        primary.remove(&hashkey(e.peer_ip, e.peer_port));
        e.prev_ip = Some(e.peer_ip);
        e.prev_port = Some(e.peer_port);
        e.peer_ip = new_ip;
        e.peer_port = new_port;
        primary.insert(hashkey(new_ip, new_port), link);
        Ok(())
    }

    pub fn revert_entry(&self, link: u32) -> Result<()> {
        let row = self.row(link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let mut primary = self.primary.lock().unwrap();
        let mut e = row.lock().unwrap();
        let (prev_ip, prev_port) = match (e.prev_ip, e.prev_port) {
            (Some(ip), Some(port)) => (ip, port),
            _ => return Err(RouterError::InvalidParameter("no prior binding to revert to".into())),
        };
        primary.remove(&hashkey(e.peer_ip, e.peer_port));
        e.peer_ip = prev_ip;
        e.peer_port = prev_port;
        e.prev_ip = None;
        e.prev_port = None;
        primary.insert(hashkey(prev_ip, prev_port), link);
        Ok(())
    }

    pub fn remove(&self, link: u32) -> Result<LinkEntry> {
        let row = self
            .rows
            .lock()
            .unwrap()
            .remove(&link)
            .ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let e = row.lock().unwrap().clone();
        let mut primary = self.primary.lock().unwrap();
        if e.connected {
            primary.remove(&hashkey(e.peer_ip, e.peer_port));
        } else {
            primary.remove(&e.nonce);
        }
        self.by_peer_adr.lock().unwrap().remove(&e.peer_adr);
        Ok(e)
    }

    pub fn lookup_by_addr(&self, ip: Ipv4Addr, port: u16) -> Option<u32> {
        self.primary.lock().unwrap().get(&hashkey(ip, port)).copied()
    }

    pub fn lookup_by_nonce(&self, nonce: u64) -> Option<u32> {
        self.primary.lock().unwrap().get(&nonce).copied()
    }

    pub fn lookup_by_peer_adr(&self, adr: ForestAddr) -> Option<u32> {
        self.by_peer_adr.lock().unwrap().get(&adr).copied()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.rows.lock().unwrap().keys().copied().collect()
    }

    pub fn links_on_iface(&self, iface: u32) -> Vec<u32> {
        self.rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.lock().unwrap().iface == iface)
            .map(|r| r.lock().unwrap().link)
            .collect()
    }
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_swaps_index_key() {
        let t = LinkTable::new();
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let link = t.add_entry(1, peer, 23456, 0x0123456789abcdef);
        assert_eq!(t.lookup_by_nonce(0x0123456789abcdef), Some(link));
        assert_eq!(t.lookup_by_addr(peer, 23456), None);

        t.connect(link, peer, 23456).unwrap();
        assert_eq!(t.lookup_by_nonce(0x0123456789abcdef), None);
        assert_eq!(t.lookup_by_addr(peer, 23456), Some(link));
        assert!(t.get(link).unwrap().connected);
    }

    #[test]
    fn remap_then_revert_restores_binding() {
        let t = LinkTable::new();
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let link = t.add_entry(1, peer, 1000, 1);
        t.connect(link, peer, 1000).unwrap();

        let new_peer = Ipv4Addr::new(10, 0, 0, 3);
        t.remap_entry(link, new_peer, 2000).unwrap();
        assert_eq!(t.lookup_by_addr(new_peer, 2000), Some(link));
        assert_eq!(t.lookup_by_addr(peer, 1000), None);

        t.revert_entry(link).unwrap();
        assert_eq!(t.lookup_by_addr(peer, 1000), Some(link));
        assert_eq!(t.lookup_by_addr(new_peer, 2000), None);
    }

    #[test]
    fn remove_clears_all_indices() {
        let t = LinkTable::new();
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let link = t.add_entry(1, peer, 1000, 42);
        t.connect(link, peer, 1000).unwrap();
        t.remove(link).unwrap();
        assert_eq!(t.lookup_by_addr(peer, 1000), None);
        assert!(t.get(link).is_err());
    }
}
