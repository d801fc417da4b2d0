//! # forest-core
//!
//! Forest overlay router data plane: a fixed-format binary wire protocol,
//! per-comtree spanning-tree forwarding, and per-link WDRR scheduling.
//!
//! ## Crate structure
//!
//! - [`address`] — Forest address encoding, node/packet type codes, constants
//! - [`wire`] — 20-byte packet header and pack/unpack
//! - [`ctlpkt`] — Control packet (tag, length, value) body codec
//! - [`rate_spec`] — Four-way bit/packet rate allocation arithmetic
//! - [`error`] — Router-internal error type
//! - [`clock`] — Nanosecond monotonic clock
//! - [`packet_store`] — Reference-counted packet buffer pool
//! - [`iface_table`] — Per-interface table
//! - [`link_table`] — Per-link table and peer address indices
//! - [`comtree_table`] — Per-comtree spanning-tree membership
//! - [`route_table`] — (comtree, address) forwarding table
//! - [`qmanager`] — Per-link WDRR scheduler
//! - [`packet_filter`] — Packet filters and the bounded packet log
//! - [`tables`] — Aggregates the tables above behind one handle
//! - [`forwarder`] — Validation and routing pipeline for data-plane packets
//! - [`control_handler`] — Control-packet request/reply handling
//! - [`config`] — Router configuration
//! - [`persist`] — Loaders for the persisted text config files
//! - [`router_core`] — Ties the tables, forwarder, and control handler into
//!   running I/O threads

pub mod address;
pub mod clock;
pub mod comtree_table;
pub mod config;
pub mod control_handler;
pub mod ctlpkt;
pub mod error;
pub mod forwarder;
pub mod iface_table;
pub mod link_table;
pub mod packet_filter;
pub mod packet_store;
pub mod persist;
pub mod qmanager;
pub mod rate_spec;
pub mod route_table;
pub mod router_core;
pub mod tables;
pub mod wire;
