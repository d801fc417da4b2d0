//! Per-packet processing latency benchmarks for forest-core.
//!
//! Measures latency contributions of the hot-path components:
//! - Packet pack/unpack (various payload sizes)
//! - Forwarder dispatch for a unicast hit
//! - Packet store alloc / zero-copy clone
//! - WDRR queue enqueue/dequeue
//!
//! Run with: cargo bench --package forest-core

use std::net::Ipv4Addr;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use forest_core::address::{forest_adr, NodeType, PacketType};
use forest_core::forwarder::Forwarder;
use forest_core::packet_store::PacketStore;
use forest_core::qmanager::QuManager;
use forest_core::rate_spec::RateSpec;
use forest_core::tables::Tables;
use forest_core::wire::Packet;

// ─── Packet ──────────────────────────────────────────────────────────────

fn bench_packet_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_pack");

    for size in [0, 64, 512, 1200] {
        let pkt = Packet::new(
            PacketType::ClientData as u8,
            0,
            1001,
            forest_adr(3, 1),
            forest_adr(3, 2),
            Bytes::from(vec![0xab; size]),
        );
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| black_box(black_box(&pkt).pack()));
        });
    }

    group.finish();
}

fn bench_packet_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_unpack");

    for size in [0, 64, 512, 1200] {
        let pkt = Packet::new(
            PacketType::ClientData as u8,
            0,
            1001,
            forest_adr(3, 1),
            forest_adr(3, 2),
            Bytes::from(vec![0xab; size]),
        );
        let encoded = pkt.pack();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| black_box(Packet::unpack(encoded.clone())));
        });
    }

    group.finish();
}

// ─── Packet store ────────────────────────────────────────────────────────

fn bench_store_alloc_free(c: &mut Criterion) {
    c.bench_function("store_alloc_free", |b| {
        let store = PacketStore::new(1 << 14, 1 << 14);
        b.iter(|| {
            let pkt = Packet::new(PacketType::ClientData as u8, 0, 1001, 1, 2, Bytes::from_static(b"x"));
            let h = store.alloc(pkt).unwrap();
            black_box(h);
            store.free(h);
        });
        store.flush_pending();
    });
}

fn bench_store_clone_pkt(c: &mut Criterion) {
    c.bench_function("store_clone_pkt_fanout4", |b| {
        let store = PacketStore::new(1 << 14, 1 << 14);
        b.iter(|| {
            let pkt = Packet::new(PacketType::ClientData as u8, 0, 1001, 1, 2, Bytes::from(vec![0xab; 512]));
            let h0 = store.alloc(pkt).unwrap();
            let clones: Vec<_> = (0..3).map(|_| store.clone_pkt(h0).unwrap()).collect();
            black_box(&clones);
            store.free(h0);
            for h in clones {
                store.free(h);
            }
        });
        store.flush_pending();
    });
}

// ─── Forwarder ───────────────────────────────────────────────────────────

fn setup_unicast_forwarder() -> (std::sync::Arc<Tables>, std::sync::Arc<PacketStore>, Forwarder, u32) {
    let tables = std::sync::Arc::new(Tables::new(3, 64));
    let store = std::sync::Arc::new(PacketStore::new(1 << 14, 1 << 14));
    let in_link = tables.links.add_entry(1, Ipv4Addr::LOCALHOST, 2000, 1);
    tables.links.connect(in_link, Ipv4Addr::LOCALHOST, 2000).unwrap();
    tables.links.set_peer_adr(in_link, forest_adr(3, 1), NodeType::Router).unwrap();
    let out_link = tables.links.add_entry(1, Ipv4Addr::new(10, 0, 0, 9), 2001, 2);
    tables.links.connect(out_link, Ipv4Addr::new(10, 0, 0, 9), 2001).unwrap();
    tables.links.set_peer_adr(out_link, forest_adr(3, 2), NodeType::Router).unwrap();

    tables.comtrees.add_comtree(1001).unwrap();
    tables.comtrees.add_link(1001, in_link, 0, false, false).unwrap();
    tables.comtrees.add_link(1001, out_link, 0, false, false).unwrap();
    tables.routes.set_link(1001, forest_adr(3, 2), tables.comtrees.row(1001).unwrap().lock().unwrap().clnk_num(out_link).unwrap()).unwrap();

    let my_addr = forest_adr(3, 0);
    let fwd = Forwarder::new(tables.clone(), store.clone(), my_addr);
    (tables, store, fwd, in_link)
}

fn bench_forwarder_unicast_hit(c: &mut Criterion) {
    let (_tables, store, fwd, in_link) = setup_unicast_forwarder();
    c.bench_function("forwarder_unicast_hit", |b| {
        b.iter(|| {
            let pkt = Packet::new(PacketType::ClientData as u8, 0, 1001, forest_adr(3, 1), forest_adr(3, 2), Bytes::from_static(b"payload"));
            let h = store.alloc(pkt).unwrap();
            let actions = fwd.process(in_link, h);
            black_box(&actions);
            for a in actions {
                if let forest_core::forwarder::ForwardAction::Enqueue { handle, .. } = a {
                    store.free(handle);
                }
            }
        });
    });
    store.flush_pending();
}

// ─── WDRR scheduler ──────────────────────────────────────────────────────

fn bench_qmanager_enqueue_dequeue(c: &mut Criterion) {
    c.bench_function("qmanager_enqueue_dequeue_1200B", |b| {
        let store = PacketStore::new(1 << 14, 1 << 14);
        let qm = QuManager::new();
        qm.add_link(1, RateSpec::uniform(900_000));
        let qid = qm.alloc_q(1, RateSpec::uniform(900_000), i32::MAX as u32, i32::MAX as u32).unwrap();

        b.iter(|| {
            let pkt = Packet::new(PacketType::ClientData as u8, 0, 1001, 1, 2, Bytes::from(vec![0xab; 1200]));
            let h = store.alloc(pkt).unwrap();
            qm.enqueue(1, qid, h, 1200).unwrap();
            let served = qm.dequeue(1, u64::MAX);
            black_box(&served);
            if let Some((_, handle)) = served {
                store.free(handle);
            }
        });
        store.flush_pending();
    });
}

criterion_group!(
    benches,
    bench_packet_pack,
    bench_packet_unpack,
    bench_store_alloc_free,
    bench_store_clone_pkt,
    bench_forwarder_unicast_hit,
    bench_qmanager_enqueue_dequeue,
);
criterion_main!(benches);
