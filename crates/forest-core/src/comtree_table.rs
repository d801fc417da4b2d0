//! Per-comtree table: spanning-tree membership, parent link, and the
//! comtree-link-number indirection used to key per-link queues (§4.3).
//!
//! Each link a comtree runs over is given a small per-comtree "comtree-link
//! number" (clnk) distinct from its global link id; `ClnkInfo` hangs off
//! that number rather than the link id directly, matching the reference
//! table's indirection (`ComtreeTable.h`'s `clMap`/`validClnk`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Result, RouterError};
use crate::rate_spec::RateSpec;

pub type ComtreeNum = crate::address::ComtreeNum;
pub type ComtreeLinkNum = u32;

#[derive(Debug, Clone)]
pub struct ClnkInfo {
    pub link: u32,
    pub dest: i32,
    pub qnum: u32,
    pub rates: RateSpec,
}

#[derive(Debug, Clone)]
pub struct ComtreeEntry {
    pub comtree: ComtreeNum,
    pub core_flag: bool,
    pub parent_link: Option<u32>,
    clnks: HashMap<ComtreeLinkNum, ClnkInfo>,
    link_to_clnk: HashMap<u32, ComtreeLinkNum>,
    core_links: HashSet<u32>,
    router_links: HashSet<u32>,
    next_clnk: ComtreeLinkNum,
}

impl ComtreeEntry {
    fn new(comtree: ComtreeNum) -> Self {
        ComtreeEntry {
            comtree,
            core_flag: false,
            parent_link: None,
            clnks: HashMap::new(),
            link_to_clnk: HashMap::new(),
            core_links: HashSet::new(),
            router_links: HashSet::new(),
            next_clnk: 1,
        }
    }

    pub fn valid_clnk(&self, clnk: ComtreeLinkNum) -> bool {
        self.clnks.contains_key(&clnk)
    }

    pub fn clnk_num(&self, link: u32) -> Option<ComtreeLinkNum> {
        self.link_to_clnk.get(&link).copied()
    }

    pub fn clnk_info(&self, clnk: ComtreeLinkNum) -> Option<&ClnkInfo> {
        self.clnks.get(&clnk)
    }

    /// Comtree-links to other routers — a subset of `link_to_clnk`'s keys.
    /// A core link is always a router link; matches the original's separate
    /// `rtrLinks`/`coreLinks` `Dlist`s (`ComtreeTable.h`), where every
    /// member of `coreLinks` is also a member of `rtrLinks`.
    pub fn router_links(&self) -> Vec<u32> {
        self.router_links.iter().copied().collect()
    }

    pub fn core_links(&self) -> Vec<u32> {
        self.core_links.iter().copied().collect()
    }

    fn add_link(&mut self, link: u32, dest: i32) -> ComtreeLinkNum {
        if let Some(&clnk) = self.link_to_clnk.get(&link) {
            return clnk;
        }
        let clnk = self.next_clnk;
        self.next_clnk += 1;
        self.link_to_clnk.insert(link, clnk);
        self.clnks.insert(
            clnk,
            ClnkInfo {
                link,
                dest,
                qnum: 0,
                rates: RateSpec::UNSET,
            },
        );
        clnk
    }

    fn remove_link(&mut self, link: u32) {
        if let Some(clnk) = self.link_to_clnk.remove(&link) {
            self.clnks.remove(&clnk);
        }
        self.core_links.remove(&link);
        self.router_links.remove(&link);
        if self.parent_link == Some(link) {
            self.parent_link = None;
        }
    }
}

pub struct ComtreeTable {
    rows: Mutex<HashMap<ComtreeNum, Arc<Mutex<ComtreeEntry>>>>,
}

impl ComtreeTable {
    pub fn new() -> Self {
        ComtreeTable { rows: Mutex::new(HashMap::new()) }
    }

    pub fn add_comtree(&self, comtree: ComtreeNum) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&comtree) {
            return Err(RouterError::DuplicateId(format!("comtree {comtree}")));
        }
        rows.insert(comtree, Arc::new(Mutex::new(ComtreeEntry::new(comtree))));
        Ok(())
    }

    pub fn row(&self, comtree: ComtreeNum) -> Option<Arc<Mutex<ComtreeEntry>>> {
        self.rows.lock().unwrap().get(&comtree).cloned()
    }

    fn require_row(&self, comtree: ComtreeNum) -> Result<Arc<Mutex<ComtreeEntry>>> {
        self.row(comtree).ok_or(RouterError::UnknownComtree(comtree))
    }

    pub fn remove_comtree(&self, comtree: ComtreeNum) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .remove(&comtree)
            .map(|_| ())
            .ok_or(RouterError::UnknownComtree(comtree))
    }

    pub fn set_core_flag(&self, comtree: ComtreeNum, is_core: bool) -> Result<()> {
        let row = self.require_row(comtree)?;
        row.lock().unwrap().core_flag = is_core;
        Ok(())
    }

    /// Sets the comtree's parent link. `link` must already be a router-link
    /// of the comtree (§3 invariant; original `modComtree` semantics).
    pub fn set_parent_link(&self, comtree: ComtreeNum, link: Option<u32>) -> Result<()> {
        let row = self.require_row(comtree)?;
        let mut e = row.lock().unwrap();
        if let Some(l) = link {
            if !e.router_links.contains(&l) {
                return Err(RouterError::InvalidParameter(format!(
                    "link {l} is not a router-link of comtree {comtree}"
                )));
            }
        }
        e.parent_link = link;
        Ok(())
    }

    /// Add `link` to the comtree, allocating it a comtree-link number.
    /// `is_core` marks the link as being on the comtree's core path;
    /// `is_router` marks it as going to another router rather than a leaf
    /// client. A core link is always a router link.
    pub fn add_link(&self, comtree: ComtreeNum, link: u32, dest: i32, is_core: bool, is_router: bool) -> Result<ComtreeLinkNum> {
        let row = self.require_row(comtree)?;
        let mut e = row.lock().unwrap();
        let clnk = e.add_link(link, dest);
        if is_core {
            e.core_links.insert(link);
            e.router_links.insert(link);
        } else if is_router {
            e.router_links.insert(link);
        }
        Ok(clnk)
    }

    pub fn remove_link(&self, comtree: ComtreeNum, link: u32) -> Result<()> {
        let row = self.require_row(comtree)?;
        row.lock().unwrap().remove_link(link);
        Ok(())
    }

    pub fn set_link_rates(&self, comtree: ComtreeNum, link: u32, rates: RateSpec) -> Result<()> {
        let row = self.require_row(comtree)?;
        let mut e = row.lock().unwrap();
        let clnk = e.clnk_num(link).ok_or(RouterError::InvalidParameter(format!(
            "link {link} not in comtree {comtree}"
        )))?;
        e.clnks.get_mut(&clnk).unwrap().rates = rates;
        Ok(())
    }

    pub fn set_link_qnum(&self, comtree: ComtreeNum, link: u32, qnum: u32) -> Result<()> {
        let row = self.require_row(comtree)?;
        let mut e = row.lock().unwrap();
        let clnk = e.clnk_num(link).ok_or(RouterError::InvalidParameter(format!(
            "link {link} not in comtree {comtree}"
        )))?;
        e.clnks.get_mut(&clnk).unwrap().qnum = qnum;
        Ok(())
    }

    pub fn clnk_info(&self, comtree: ComtreeNum, link: u32) -> Result<ClnkInfo> {
        let row = self.require_row(comtree)?;
        let e = row.lock().unwrap();
        let clnk = e.clnk_num(link).ok_or(RouterError::InvalidParameter(format!(
            "link {link} not in comtree {comtree}"
        )))?;
        Ok(e.clnk_info(clnk).unwrap().clone())
    }

    /// Look up a comtree-link's info by its comtree-link number directly,
    /// rather than by the underlying link id.
    pub fn clnk_info_by_clnk(&self, comtree: ComtreeNum, clnk: ComtreeLinkNum) -> Result<ClnkInfo> {
        let row = self.require_row(comtree)?;
        let e = row.lock().unwrap();
        e.clnk_info(clnk)
            .cloned()
            .ok_or(RouterError::InvalidParameter(format!("no such comtree-link {clnk} in comtree {comtree}")))
    }

    pub fn is_core_flag(&self, comtree: ComtreeNum) -> Result<bool> {
        Ok(self.require_row(comtree)?.lock().unwrap().core_flag)
    }

    pub fn parent_link(&self, comtree: ComtreeNum) -> Result<Option<u32>> {
        Ok(self.require_row(comtree)?.lock().unwrap().parent_link)
    }

    pub fn router_links(&self, comtree: ComtreeNum) -> Result<Vec<u32>> {
        Ok(self.require_row(comtree)?.lock().unwrap().router_links())
    }

    pub fn core_links(&self, comtree: ComtreeNum) -> Result<Vec<u32>> {
        Ok(self.require_row(comtree)?.lock().unwrap().core_links())
    }

    /// Every link any comtree currently runs over — purged when that link
    /// is removed from the link table.
    pub fn comtrees_on_link(&self, link: u32) -> Vec<ComtreeNum> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.lock().unwrap().link_to_clnk.contains_key(&link))
            .map(|(&c, _)| c)
            .collect()
    }

    pub fn ids(&self) -> Vec<ComtreeNum> {
        self.rows.lock().unwrap().keys().copied().collect()
    }
}

impl Default for ComtreeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_link_allocates_stable_clnk() {
        let t = ComtreeTable::new();
        t.add_comtree(1001).unwrap();
        let clnk1 = t.add_link(1001, 5, 0, false, false).unwrap();
        let clnk2 = t.add_link(1001, 5, 0, false, false).unwrap();
        assert_eq!(clnk1, clnk2, "re-adding an existing link keeps its comtree-link number");
    }

    #[test]
    fn remove_link_clears_parent() {
        let t = ComtreeTable::new();
        t.add_comtree(1001).unwrap();
        t.add_link(1001, 5, 0, false, true).unwrap();
        t.set_parent_link(1001, Some(5)).unwrap();
        t.remove_link(1001, 5).unwrap();
        assert_eq!(t.parent_link(1001).unwrap(), None);
        assert!(t.clnk_info(1001, 5).is_err());
    }

    #[test]
    fn core_and_router_links_tracked_separately_from_leaf_links() {
        let t = ComtreeTable::new();
        t.add_comtree(1001).unwrap();
        t.add_link(1001, 1, 0, true, false).unwrap(); // core link, implicitly a router link
        t.add_link(1001, 2, 0, false, true).unwrap(); // router-only link
        t.add_link(1001, 3, 0, false, false).unwrap(); // leaf link
        assert_eq!(t.core_links(1001).unwrap(), vec![1]);
        let mut router_links = t.router_links(1001).unwrap();
        router_links.sort();
        assert_eq!(router_links, vec![1, 2]);
    }

    #[test]
    fn unknown_comtree_is_rejected() {
        let t = ComtreeTable::new();
        assert!(matches!(t.add_link(9999, 1, 0, false, false), Err(RouterError::UnknownComtree(9999))));
    }

    #[test]
    fn set_parent_link_rejects_non_router_link() {
        let t = ComtreeTable::new();
        t.add_comtree(1001).unwrap();
        t.add_link(1001, 5, 0, false, false).unwrap();
        assert!(t.set_parent_link(1001, Some(5)).is_err(), "leaf link cannot become the parent link");
        t.add_link(1001, 6, 0, false, true).unwrap();
        assert!(t.set_parent_link(1001, Some(6)).is_ok());
    }
}
