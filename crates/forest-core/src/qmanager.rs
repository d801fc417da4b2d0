//! Per-link WDRR scheduler with packet-rate pacing (§4.5).
//!
//! Each link owns a set of queues; each queue has its own per-byte delay
//! and minimum inter-packet spacing derived from its configured rate.
//! Enqueue computes a packet's virtual finish time; dequeue serves the
//! queue with the smallest eligible finish time and advances the link's
//! virtual clock.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::{Result, RouterError};
use crate::packet_store::PacketHandle;
use crate::rate_spec::RateSpec;

pub type QueueId = u32;

/// `nsPerByte = 8e9 / max(bitRateBps, 1)`.
fn ns_per_byte(bit_rate_bps: i32) -> u64 {
    8_000_000_000u64 / (bit_rate_bps.max(1) as u64)
}

/// `minDelta = 1e9 / max(pktRateBps, 1)`.
fn min_delta(pkt_rate: i32) -> u64 {
    1_000_000_000u64 / (pkt_rate.max(1) as u64)
}

struct QueueState {
    ns_per_byte: u64,
    min_delta: u64,
    pkt_limit: u32,
    byte_limit: u32,
    pkt_count: u32,
    byte_count: u32,
    vft: u64,
    packets: VecDeque<(u64, PacketHandle, u32)>,
    active: bool,
}

impl QueueState {
    fn new(rates: &RateSpec, pkt_limit: u32, byte_limit: u32) -> Self {
        QueueState {
            ns_per_byte: ns_per_byte(rates.bit_down),
            min_delta: min_delta(rates.pkt_down),
            pkt_limit,
            byte_limit,
            pkt_count: 0,
            byte_count: 0,
            vft: 0,
            packets: VecDeque::new(),
            active: false,
        }
    }
}

struct LinkSched {
    ns_per_byte: u64,
    min_delta: u64,
    vt: u64,
    avg_pkt_time: u64,
    queues: HashMap<QueueId, QueueState>,
    active: BinaryHeap<Reverse<(u64, QueueId)>>,
    next_qid: QueueId,
    free_qids: Vec<QueueId>,
}

impl LinkSched {
    fn new(rates: &RateSpec) -> Self {
        LinkSched {
            ns_per_byte: ns_per_byte(rates.bit_down),
            min_delta: min_delta(rates.pkt_down),
            vt: 0,
            avg_pkt_time: 0,
            queues: HashMap::new(),
            active: BinaryHeap::new(),
            next_qid: 1,
            free_qids: Vec::new(),
        }
    }

    fn alloc_q(&mut self, rates: &RateSpec, pkt_limit: u32, byte_limit: u32) -> QueueId {
        let qid = self.free_qids.pop().unwrap_or_else(|| {
            let id = self.next_qid;
            self.next_qid += 1;
            id
        });
        self.queues.insert(qid, QueueState::new(rates, pkt_limit, byte_limit));
        qid
    }

    fn free_q(&mut self, qid: QueueId) -> Vec<PacketHandle> {
        let drained = self
            .queues
            .remove(&qid)
            .map(|q| q.packets.into_iter().map(|(_, h, _)| h).collect())
            .unwrap_or_default();
        self.free_qids.push(qid);
        drained
    }
}

pub struct QuManager {
    links: Mutex<HashMap<u32, LinkSched>>,
}

impl QuManager {
    pub fn new() -> Self {
        QuManager { links: Mutex::new(HashMap::new()) }
    }

    pub fn add_link(&self, link: u32, rates: RateSpec) {
        self.links.lock().unwrap().insert(link, LinkSched::new(&rates));
    }

    pub fn remove_link(&self, link: u32) -> Vec<PacketHandle> {
        let Some(sched) = self.links.lock().unwrap().remove(&link) else {
            return Vec::new();
        };
        sched.queues.into_values().flat_map(|q| q.packets.into_iter().map(|(_, h, _)| h)).collect()
    }

    pub fn set_link_rates(&self, link: u32, rates: RateSpec) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        let sched = links.get_mut(&link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        sched.ns_per_byte = ns_per_byte(rates.bit_down);
        sched.min_delta = min_delta(rates.pkt_down);
        Ok(())
    }

    pub fn alloc_q(&self, link: u32, rates: RateSpec, pkt_limit: u32, byte_limit: u32) -> Result<QueueId> {
        let mut links = self.links.lock().unwrap();
        let sched = links.get_mut(&link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        Ok(sched.alloc_q(&rates, pkt_limit, byte_limit))
    }

    /// Free a queue, returning the packets it still held so the caller can
    /// release them back to the packet store.
    pub fn free_q(&self, link: u32, qid: QueueId) -> Vec<PacketHandle> {
        let mut links = self.links.lock().unwrap();
        links.get_mut(&link).map(|s| s.free_q(qid)).unwrap_or_default()
    }

    pub fn set_q_rates(&self, link: u32, qid: QueueId, rates: RateSpec) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        let sched = links.get_mut(&link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let q = sched.queues.get_mut(&qid).ok_or(RouterError::InvalidParameter(format!("no such queue {qid}")))?;
        q.ns_per_byte = ns_per_byte(rates.bit_down);
        q.min_delta = min_delta(rates.pkt_down);
        Ok(())
    }

    pub fn set_q_limits(&self, link: u32, qid: QueueId, pkt_limit: u32, byte_limit: u32) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        let sched = links.get_mut(&link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let q = sched.queues.get_mut(&qid).ok_or(RouterError::InvalidParameter(format!("no such queue {qid}")))?;
        q.pkt_limit = pkt_limit;
        q.byte_limit = byte_limit;
        Ok(())
    }

    /// Admit `packet` (`bytes` long) into queue `qid` on `link`, computing
    /// its virtual finish time. Rejects if the queue's packet or byte
    /// count is already at its limit.
    pub fn enqueue(&self, link: u32, qid: QueueId, packet: PacketHandle, bytes: u32) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        let sched = links.get_mut(&link).ok_or(RouterError::InvalidParameter(format!("no such link {link}")))?;
        let link_vt = sched.vt;
        let q = sched.queues.get_mut(&qid).ok_or(RouterError::InvalidParameter(format!("no such queue {qid}")))?;
        if q.pkt_count >= q.pkt_limit || q.byte_count >= q.byte_limit {
            return Err(RouterError::CapacityExceeded {
                requested: RateSpec::uniform(bytes as i32),
                available: RateSpec::uniform((q.byte_limit - q.byte_count) as i32),
            });
        }
        let delay = (q.ns_per_byte * bytes as u64).max(q.min_delta);
        let vft = link_vt.max(q.vft + delay);
        q.vft = vft;
        q.pkt_count += 1;
        q.byte_count += bytes;
        q.packets.push_back((vft, packet, bytes));
        if !q.active {
            q.active = true;
            sched.active.push(Reverse((vft, qid)));
        }
        Ok(())
    }

    /// Serve the earliest eligible queue on `link` at time `now_ns`, if
    /// any. Advances the link's virtual clock on success.
    pub fn dequeue(&self, link: u32, now_ns: u64) -> Option<(QueueId, PacketHandle)> {
        let mut links = self.links.lock().unwrap();
        let sched = links.get_mut(&link)?;
        let Reverse((key, qid)) = *sched.active.peek()?;
        if key > now_ns {
            return None;
        }
        sched.active.pop();
        let link_ns_per_byte = sched.ns_per_byte;
        let link_min_delta = sched.min_delta;
        let q = sched.queues.get_mut(&qid)?;
        let (vft, handle, bytes) = q.packets.pop_front()?;
        debug_assert_eq!(vft, key);
        q.pkt_count -= 1;
        q.byte_count -= bytes;
        let served_delay = (link_ns_per_byte * bytes as u64).max(link_min_delta);
        sched.vt = key + served_delay;
        sched.avg_pkt_time = (sched.avg_pkt_time + served_delay) / 2;
        if let Some((next_vft, _, _)) = q.packets.front() {
            sched.active.push(Reverse((*next_vft, qid)));
        } else {
            q.active = false;
        }
        Some((qid, handle))
    }
}

impl Default for QuManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::packet_store::PacketStore;
    use crate::wire::Packet;

    fn handle(store: &PacketStore) -> PacketHandle {
        store.alloc(Packet::new(1, 0, 1, 10, 20, Bytes::from_static(b"x"))).unwrap()
    }

    #[test]
    fn fifo_within_single_queue() {
        let store = PacketStore::new(16, 16);
        let qm = QuManager::new();
        qm.add_link(1, RateSpec::uniform(1_000_000));
        let qid = qm.alloc_q(1, RateSpec::uniform(1_000_000), 100, 100_000).unwrap();
        let h1 = handle(&store);
        let h2 = handle(&store);
        qm.enqueue(1, qid, h1, 100).unwrap();
        qm.enqueue(1, qid, h2, 100).unwrap();
        let (_, first) = qm.dequeue(1, u64::MAX).unwrap();
        assert_eq!(first, h1);
        let (_, second) = qm.dequeue(1, u64::MAX).unwrap();
        assert_eq!(second, h2);
        assert!(qm.dequeue(1, u64::MAX).is_none());
    }

    #[test]
    fn dequeue_respects_eligibility_time() {
        let store = PacketStore::new(16, 16);
        let qm = QuManager::new();
        qm.add_link(1, RateSpec::uniform(20));
        let qid = qm.alloc_q(1, RateSpec::uniform(20), 100, 100_000).unwrap();
        qm.enqueue(1, qid, handle(&store), 1000).unwrap();
        assert!(qm.dequeue(1, 0).is_none(), "packet not yet eligible at time 0");
        assert!(qm.dequeue(1, u64::MAX).is_some());
    }

    #[test]
    fn enqueue_rejects_past_packet_limit() {
        let store = PacketStore::new(16, 16);
        let qm = QuManager::new();
        qm.add_link(1, RateSpec::uniform(1_000_000));
        let qid = qm.alloc_q(1, RateSpec::uniform(1_000_000), 1, 100_000).unwrap();
        qm.enqueue(1, qid, handle(&store), 10).unwrap();
        assert!(qm.enqueue(1, qid, handle(&store), 10).is_err());
    }

    #[test]
    fn free_q_drains_remaining_packets() {
        let store = PacketStore::new(16, 16);
        let qm = QuManager::new();
        qm.add_link(1, RateSpec::uniform(1_000_000));
        let qid = qm.alloc_q(1, RateSpec::uniform(1_000_000), 100, 100_000).unwrap();
        let h = handle(&store);
        qm.enqueue(1, qid, h, 10).unwrap();
        let drained = qm.free_q(1, qid);
        assert_eq!(drained, vec![h]);
    }

    /// §8: vft/vt must be monotonically non-decreasing across a mixed-rate
    /// sequence of enqueues/dequeues spanning several queues on one link.
    #[test]
    fn vft_and_vt_are_monotonic_across_mixed_rate_queues() {
        let store = PacketStore::new(64, 64);
        let qm = QuManager::new();
        qm.add_link(1, RateSpec::uniform(1_000_000));
        let fast = qm.alloc_q(1, RateSpec::uniform(2_000_000), 1000, 1_000_000).unwrap();
        let slow = qm.alloc_q(1, RateSpec::uniform(100_000), 1000, 1_000_000).unwrap();
        let mut last_vt = 0u64;
        let sizes = [64u32, 1400, 200, 900, 40, 1500, 300];
        for (i, &sz) in sizes.iter().enumerate() {
            let qid = if i % 2 == 0 { fast } else { slow };
            qm.enqueue(1, qid, handle(&store), sz).unwrap();
        }
        let mut served = 0;
        while let Some((qid, h)) = qm.dequeue(1, u64::MAX) {
            served += 1;
            store.free(h);
            let vt = {
                let links = qm.links.lock().unwrap();
                links.get(&1).unwrap().vt
            };
            assert!(vt >= last_vt, "link vt went backwards: {vt} < {last_vt}");
            last_vt = vt;
            let _ = qid;
        }
        assert_eq!(served, sizes.len());
    }
}
