//! (comtree, address) → outgoing comtree-link(s) forwarding table (§4.6).
//!
//! A unicast route names exactly one comtree-link; a multicast route names
//! a set (the fan-out list for that group within the comtree). Routing keys
//! collapse the address's local part to zero when the address belongs to a
//! foreign zip code — this router only ever routes on zip code for traffic
//! leaving its own zip, matching the reference key function `rmKey`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::address::{mcast_adr, zip_code, ComtreeNum, ForestAddr};
use crate::comtree_table::ComtreeLinkNum;
use crate::error::{Result, RouterError};

/// Routing key: collapses the local part away for foreign-zip unicast
/// addresses, since this router only has zip-granularity knowledge of
/// those. Same-zip unicast and all multicast addresses route on the full
/// address.
fn route_key(comtree: ComtreeNum, adr: ForestAddr, my_zip: i32) -> (ComtreeNum, ForestAddr) {
    if !mcast_adr(adr) && zip_code(adr) != my_zip {
        (comtree, crate::address::forest_adr(zip_code(adr), 0))
    } else {
        (comtree, adr)
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Unicast(ComtreeLinkNum),
    Multicast(HashSet<ComtreeLinkNum>),
}

pub struct RouteTable {
    my_zip: i32,
    routes: Mutex<HashMap<(ComtreeNum, ForestAddr), Binding>>,
    /// secondary index: (comtree, comtree-link) -> routing keys that use it,
    /// so a link removal can purge every affected route.
    by_clnk: Mutex<HashMap<(ComtreeNum, ComtreeLinkNum), HashSet<ForestAddr>>>,
}

impl RouteTable {
    pub fn new(my_zip: i32) -> Self {
        RouteTable {
            my_zip,
            routes: Mutex::new(HashMap::new()),
            by_clnk: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, comtree: ComtreeNum, key_adr: ForestAddr, clnk: ComtreeLinkNum) {
        self.by_clnk
            .lock()
            .unwrap()
            .entry((comtree, clnk))
            .or_default()
            .insert(key_adr);
    }

    fn untrack(&self, comtree: ComtreeNum, key_adr: ForestAddr, clnk: ComtreeLinkNum) {
        if let Some(set) = self.by_clnk.lock().unwrap().get_mut(&(comtree, clnk)) {
            set.remove(&key_adr);
        }
    }

    /// Set (replacing any prior binding) the single outgoing comtree-link
    /// for a unicast route.
    pub fn set_link(&self, comtree: ComtreeNum, adr: ForestAddr, clnk: ComtreeLinkNum) -> Result<()> {
        if mcast_adr(adr) {
            return Err(RouterError::InvalidParameter("set_link is for unicast routes".into()));
        }
        let (comtree, key_adr) = route_key(comtree, adr, self.my_zip);
        let mut routes = self.routes.lock().unwrap();
        if let Some(Binding::Unicast(old)) = routes.get(&(comtree, key_adr)) {
            self.untrack(comtree, key_adr, *old);
        }
        routes.insert((comtree, key_adr), Binding::Unicast(clnk));
        drop(routes);
        self.track(comtree, key_adr, clnk);
        Ok(())
    }

    /// Add `clnk` to a multicast route's fan-out set, creating the route if
    /// it doesn't exist.
    pub fn add_link(&self, comtree: ComtreeNum, adr: ForestAddr, clnk: ComtreeLinkNum) -> Result<()> {
        if !mcast_adr(adr) {
            return Err(RouterError::InvalidParameter("add_link is for multicast routes".into()));
        }
        let (comtree, key_adr) = route_key(comtree, adr, self.my_zip);
        let mut routes = self.routes.lock().unwrap();
        match routes.entry((comtree, key_adr)) {
            std::collections::hash_map::Entry::Occupied(mut o) => match o.get_mut() {
                Binding::Multicast(set) => {
                    set.insert(clnk);
                }
                Binding::Unicast(_) => return Err(RouterError::InvalidParameter("address already bound unicast".into())),
            },
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Binding::Multicast(HashSet::from([clnk])));
            }
        }
        drop(routes);
        self.track(comtree, key_adr, clnk);
        Ok(())
    }

    /// Remove `clnk` from a multicast route's fan-out set. The route is
    /// deleted once its fan-out set becomes empty.
    pub fn remove_link(&self, comtree: ComtreeNum, adr: ForestAddr, clnk: ComtreeLinkNum) -> Result<()> {
        let (comtree, key_adr) = route_key(comtree, adr, self.my_zip);
        let mut routes = self.routes.lock().unwrap();
        let empty = match routes.get_mut(&(comtree, key_adr)) {
            Some(Binding::Multicast(set)) => {
                set.remove(&clnk);
                set.is_empty()
            }
            Some(Binding::Unicast(l)) if *l == clnk => true,
            _ => return Err(RouterError::UnknownRoute { comtree, address: adr }),
        };
        if empty {
            routes.remove(&(comtree, key_adr));
        }
        drop(routes);
        self.untrack(comtree, key_adr, clnk);
        Ok(())
    }

    /// Remove whichever route (unicast or multicast) is bound to `adr`,
    /// regardless of its current fan-out.
    pub fn remove(&self, comtree: ComtreeNum, adr: ForestAddr) -> Result<()> {
        let (comtree, key_adr) = route_key(comtree, adr, self.my_zip);
        let mut routes = self.routes.lock().unwrap();
        let binding = routes
            .remove(&(comtree, key_adr))
            .ok_or(RouterError::UnknownRoute { comtree, address: adr })?;
        drop(routes);
        match binding {
            Binding::Unicast(l) => self.untrack(comtree, key_adr, l),
            Binding::Multicast(set) => {
                for l in set {
                    self.untrack(comtree, key_adr, l);
                }
            }
        }
        Ok(())
    }

    /// Every `(comtree, address)` key currently bound to a route.
    pub fn ids(&self) -> Vec<(ComtreeNum, ForestAddr)> {
        self.routes.lock().unwrap().keys().copied().collect()
    }

    pub fn lookup_unicast(&self, comtree: ComtreeNum, adr: ForestAddr) -> Option<ComtreeLinkNum> {
        let (comtree, key_adr) = route_key(comtree, adr, self.my_zip);
        match self.routes.lock().unwrap().get(&(comtree, key_adr)) {
            Some(Binding::Unicast(l)) => Some(*l),
            _ => None,
        }
    }

    pub fn lookup_multicast(&self, comtree: ComtreeNum, adr: ForestAddr) -> Vec<ComtreeLinkNum> {
        let (comtree, key_adr) = route_key(comtree, adr, self.my_zip);
        match self.routes.lock().unwrap().get(&(comtree, key_adr)) {
            Some(Binding::Multicast(set)) => set.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Purge every route referencing `clnk` in `comtree` — used when a link
    /// is pulled out of a comtree or torn down entirely.
    pub fn purge(&self, comtree: ComtreeNum, clnk: ComtreeLinkNum) {
        let keys: Vec<ForestAddr> = self
            .by_clnk
            .lock()
            .unwrap()
            .remove(&(comtree, clnk))
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        let mut routes = self.routes.lock().unwrap();
        for key_adr in keys {
            let empty = match routes.get_mut(&(comtree, key_adr)) {
                Some(Binding::Multicast(set)) => {
                    set.remove(&clnk);
                    set.is_empty()
                }
                Some(Binding::Unicast(l)) if *l == clnk => true,
                _ => false,
            };
            if empty {
                routes.remove(&(comtree, key_adr));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::forest_adr;

    #[test]
    fn foreign_zip_unicast_collapses_local_part() {
        let t = RouteTable::new(3);
        let foreign = forest_adr(7, 99);
        t.set_link(1001, foreign, 4).unwrap();
        assert_eq!(t.lookup_unicast(1001, foreign), Some(4));
        assert_eq!(t.lookup_unicast(1001, forest_adr(7, 1)), Some(4), "any local part in the same foreign zip hits the same route");
    }

    #[test]
    fn same_zip_unicast_keeps_local_part() {
        let t = RouteTable::new(3);
        let a = forest_adr(3, 10);
        let b = forest_adr(3, 11);
        t.set_link(1001, a, 4).unwrap();
        assert_eq!(t.lookup_unicast(1001, a), Some(4));
        assert_eq!(t.lookup_unicast(1001, b), None);
    }

    #[test]
    fn multicast_route_auto_deletes_when_empty() {
        let t = RouteTable::new(3);
        let grp = -500;
        t.add_link(1001, grp, 1).unwrap();
        t.add_link(1001, grp, 2).unwrap();
        t.remove_link(1001, grp, 1).unwrap();
        assert_eq!(t.lookup_multicast(1001, grp), vec![2]);
        t.remove_link(1001, grp, 2).unwrap();
        assert!(t.lookup_multicast(1001, grp).is_empty());
        assert!(t.remove_link(1001, grp, 2).is_err(), "route is gone, not just empty");
    }

    #[test]
    fn purge_clears_multicast_and_unicast() {
        let t = RouteTable::new(3);
        let grp = -500;
        t.add_link(1001, grp, 9).unwrap();
        t.set_link(1001, forest_adr(3, 1), 9).unwrap();
        t.purge(1001, 9);
        assert!(t.lookup_multicast(1001, grp).is_empty());
        assert_eq!(t.lookup_unicast(1001, forest_adr(3, 1)), None);
    }

    #[test]
    fn remove_drops_whichever_binding_kind_is_present() {
        let t = RouteTable::new(3);
        let a = forest_adr(3, 10);
        t.set_link(1001, a, 4).unwrap();
        t.remove(1001, a).unwrap();
        assert_eq!(t.lookup_unicast(1001, a), None);
        assert!(t.remove(1001, a).is_err(), "route is already gone");

        let grp = -500;
        t.add_link(1001, grp, 1).unwrap();
        t.add_link(1001, grp, 2).unwrap();
        t.remove(1001, grp).unwrap();
        assert!(t.lookup_multicast(1001, grp).is_empty());
    }

    #[test]
    fn ids_lists_every_bound_route() {
        let t = RouteTable::new(3);
        t.set_link(1001, forest_adr(3, 1), 4).unwrap();
        t.add_link(1002, -500, 1).unwrap();
        let mut ids = t.ids();
        ids.sort();
        let mut expected = vec![(1001, forest_adr(3, 1)), (1002, -500)];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
