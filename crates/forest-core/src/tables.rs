//! Aggregates the per-router tables behind a single handle so the
//! forwarder, control handler, and I/O threads can share them without each
//! wiring up its own set of `Arc`s.

use crate::comtree_table::ComtreeTable;
use crate::iface_table::IfaceTable;
use crate::link_table::LinkTable;
use crate::packet_filter::{FilterSet, PacketLog};
use crate::qmanager::QuManager;
use crate::route_table::RouteTable;

pub struct Tables {
    pub ifaces: IfaceTable,
    pub links: LinkTable,
    pub comtrees: ComtreeTable,
    pub routes: RouteTable,
    pub qmanager: QuManager,
    pub filters: FilterSet,
    pub log: PacketLog,
}

impl Tables {
    pub fn new(my_zip: i32, log_capacity: usize) -> Self {
        Tables {
            ifaces: IfaceTable::new(),
            links: LinkTable::new(),
            comtrees: ComtreeTable::new(),
            routes: RouteTable::new(my_zip),
            qmanager: QuManager::new(),
            filters: FilterSet::new(),
            log: PacketLog::new(log_capacity),
        }
    }
}
