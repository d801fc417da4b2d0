//! Per-interface table: bound IP/port and admitted rate-spec (§2, §4.7
//! `addIface`/`dropIface`/`modIface`).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::error::{Result, RouterError};
use crate::rate_spec::RateSpec;

#[derive(Debug, Clone)]
pub struct IfaceEntry {
    pub iface: u32,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub rates: RateSpec,
    pub avail_rates: RateSpec,
}

pub struct IfaceTable {
    rows: Mutex<HashMap<u32, Arc<Mutex<IfaceEntry>>>>,
}

impl IfaceTable {
    pub fn new() -> Self {
        IfaceTable {
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, iface: u32, ip: Ipv4Addr, port: u16, rates: RateSpec) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&iface) {
            return Err(RouterError::DuplicateId(format!("iface {iface}")));
        }
        if rows.values().any(|e| {
            let e = e.lock().unwrap();
            e.ip == ip && e.port == port
        }) {
            return Err(RouterError::DuplicateId(format!("{ip}:{port}")));
        }
        rows.insert(
            iface,
            Arc::new(Mutex::new(IfaceEntry {
                iface,
                ip,
                port,
                rates,
                avail_rates: rates,
            })),
        );
        Ok(())
    }

    pub fn remove(&self, iface: u32) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .remove(&iface)
            .map(|_| ())
            .ok_or(RouterError::InvalidParameter(format!("no such iface {iface}")))
    }

    pub fn row(&self, iface: u32) -> Option<Arc<Mutex<IfaceEntry>>> {
        self.rows.lock().unwrap().get(&iface).cloned()
    }

    pub fn get(&self, iface: u32) -> Result<IfaceEntry> {
        self.row(iface)
            .map(|r| r.lock().unwrap().clone())
            .ok_or(RouterError::InvalidParameter(format!("no such iface {iface}")))
    }

    pub fn set_rates(&self, iface: u32, rates: RateSpec) -> Result<()> {
        let row = self
            .row(iface)
            .ok_or(RouterError::InvalidParameter(format!("no such iface {iface}")))?;
        let mut e = row.lock().unwrap();
        e.rates = rates;
        Ok(())
    }

    /// Reserve `requested` out of an interface's available rate, failing if
    /// it would exceed what's left.
    pub fn reserve(&self, iface: u32, requested: &RateSpec) -> Result<()> {
        let row = self
            .row(iface)
            .ok_or(RouterError::InvalidParameter(format!("no such iface {iface}")))?;
        let mut e = row.lock().unwrap();
        if !requested.leq(&e.avail_rates) {
            return Err(RouterError::CapacityExceeded {
                requested: *requested,
                available: e.avail_rates,
            });
        }
        e.avail_rates = e.avail_rates.subtract(requested);
        Ok(())
    }

    pub fn release(&self, iface: u32, freed: &RateSpec) {
        if let Some(row) = self.row(iface) {
            let mut e = row.lock().unwrap();
            e.avail_rates = e.avail_rates.add(freed);
        }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.rows.lock().unwrap().keys().copied().collect()
    }
}

impl Default for IfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_duplicate_rejected() {
        let t = IfaceTable::new();
        t.add(1, Ipv4Addr::LOCALHOST, 1111, RateSpec::uniform(1000)).unwrap();
        assert!(t.add(1, Ipv4Addr::LOCALHOST, 2222, RateSpec::uniform(1000)).is_err());
    }

    #[test]
    fn reserve_respects_available_rate() {
        let t = IfaceTable::new();
        t.add(1, Ipv4Addr::LOCALHOST, 1111, RateSpec::uniform(1000)).unwrap();
        t.reserve(1, &RateSpec::uniform(400)).unwrap();
        assert!(t.reserve(1, &RateSpec::uniform(700)).is_err());
        t.release(1, &RateSpec::uniform(400));
        t.reserve(1, &RateSpec::uniform(700)).unwrap();
    }
}
