//! Packet filters and the bounded packet log they feed (§4.6, §4.7
//! `addFilter`/`getLoggedPackets`/`enablePacketLog`).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::address::{ComtreeNum, ForestAddr};
use crate::error::{Result, RouterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A single filter rule; `None` on any field means "match any value" for
/// that field.
#[derive(Debug, Clone, Default)]
pub struct PacketFilter {
    pub on: bool,
    pub link: Option<u32>,
    pub direction: Option<Direction>,
    pub comtree: Option<ComtreeNum>,
    pub src_adr: Option<ForestAddr>,
    pub dst_adr: Option<ForestAddr>,
    pub ptype: Option<u8>,
    pub cp_type: Option<u16>,
}

impl PacketFilter {
    #[allow(clippy::too_many_arguments)]
    pub fn matches(
        &self,
        link: u32,
        direction: Direction,
        comtree: ComtreeNum,
        src_adr: ForestAddr,
        dst_adr: ForestAddr,
        ptype: u8,
        cp_type: Option<u16>,
    ) -> bool {
        self.on
            && self.link.map_or(true, |l| l == link)
            && self.direction.map_or(true, |d| d == direction)
            && self.comtree.map_or(true, |c| c == comtree)
            && self.src_adr.map_or(true, |a| a == src_adr)
            && self.dst_adr.map_or(true, |a| a == dst_adr)
            && self.ptype.map_or(true, |t| t == ptype)
            && self.cp_type.map_or(true, |t| Some(t) == cp_type)
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub packet_index: u64,
    pub direction: Direction,
    pub link: u32,
    pub timestamp_ns: u64,
}

/// Fixed-capacity circular log of filter-matched packets.
pub struct PacketLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl PacketLog {
    pub fn new(capacity: usize) -> Self {
        PacketLog {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

pub struct FilterSet {
    filters: Mutex<Vec<PacketFilter>>,
    enabled: std::sync::atomic::AtomicBool,
}

impl FilterSet {
    pub fn new() -> Self {
        FilterSet {
            filters: Mutex::new(Vec::new()),
            enabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn add(&self, filter: PacketFilter) -> usize {
        let mut filters = self.filters.lock().unwrap();
        filters.push(filter);
        filters.len() - 1
    }

    pub fn remove(&self, idx: usize) {
        let mut filters = self.filters.lock().unwrap();
        if idx < filters.len() {
            filters.remove(idx);
        }
    }

    pub fn get(&self, idx: usize) -> Result<PacketFilter> {
        self.filters
            .lock()
            .unwrap()
            .get(idx)
            .cloned()
            .ok_or(RouterError::InvalidParameter(format!("no such filter {idx}")))
    }

    pub fn set(&self, idx: usize, filter: PacketFilter) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        let slot = filters
            .get_mut(idx)
            .ok_or(RouterError::InvalidParameter(format!("no such filter {idx}")))?;
        *slot = filter;
        Ok(())
    }

    pub fn ids(&self) -> Vec<usize> {
        (0..self.filters.lock().unwrap().len()).collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn any_match(
        &self,
        link: u32,
        direction: Direction,
        comtree: ComtreeNum,
        src_adr: ForestAddr,
        dst_adr: ForestAddr,
        ptype: u8,
        cp_type: Option<u16>,
    ) -> bool {
        if !self.enabled.load(std::sync::atomic::Ordering::Relaxed) {
            return false;
        }
        self.filters
            .lock()
            .unwrap()
            .iter()
            .any(|f| f.matches(link, direction, comtree, src_adr, dst_adr, ptype, cp_type))
    }
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::new()
    }
}
