//! Loaders for the four persisted text config files (§6). Line-oriented,
//! `#` starts a comment, blank lines ignored. A malformed record is an
//! initialization failure — these run once at startup before any socket
//! is bound.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{anyhow, Context};

use crate::address::{fadr_from_string, NodeType};
use crate::comtree_table::ComtreeTable;
use crate::iface_table::IfaceTable;
use crate::link_table::LinkTable;
use crate::rate_spec::RateSpec;
use crate::route_table::RouteTable;

fn lines(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .collect())
}

fn field<'a>(fields: &'a [String], i: usize, path: &Path) -> anyhow::Result<&'a str> {
    fields
        .get(i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{}: missing field {i}", path.display()))
}

/// `iface# ip port bitRateUp bitRateDown pktRateUp pktRateDown`
pub fn load_ifaces(path: &Path, table: &IfaceTable) -> anyhow::Result<()> {
    for fields in lines(path)? {
        let iface: u32 = field(&fields, 0, path)?.parse()?;
        let ip: Ipv4Addr = field(&fields, 1, path)?.parse()?;
        let port: u16 = field(&fields, 2, path)?.parse()?;
        let rates = RateSpec::new(
            field(&fields, 3, path)?.parse()?,
            field(&fields, 4, path)?.parse()?,
            field(&fields, 5, path)?.parse()?,
            field(&fields, 6, path)?.parse()?,
        );
        table.add(iface, ip, port, rates).map_err(|e| anyhow!("{}: {e}", path.display()))?;
    }
    Ok(())
}

/// `link# iface# peerIp peerPort peerType peerAdr bitRateUp bitRateDown
/// pktRateUp pktRateDown`. Trusted peers are connected immediately since
/// their endpoint is known statically; others wait for the runtime
/// nonce handshake.
pub fn load_links(path: &Path, table: &LinkTable) -> anyhow::Result<()> {
    for fields in lines(path)? {
        let declared_link: u32 = field(&fields, 0, path)?.parse()?;
        let iface: u32 = field(&fields, 1, path)?.parse()?;
        let peer_ip: Ipv4Addr = field(&fields, 2, path)?.parse()?;
        let peer_port: u16 = field(&fields, 3, path)?.parse()?;
        let peer_type = NodeType::from_u8(field(&fields, 4, path)?.parse()?)
            .ok_or_else(|| anyhow!("{}: bad peer type", path.display()))?;
        let peer_adr = fadr_from_string(field(&fields, 5, path)?)
            .ok_or_else(|| anyhow!("{}: bad peer address", path.display()))?;
        let rates = RateSpec::new(
            field(&fields, 6, path)?.parse()?,
            field(&fields, 7, path)?.parse()?,
            field(&fields, 8, path)?.parse()?,
            field(&fields, 9, path)?.parse()?,
        );

        let nonce = rand::random::<u64>();
        let link = table.add_entry(iface, peer_ip, peer_port, nonce);
        if link != declared_link {
            return Err(anyhow!(
                "{}: link numbers must be sequential starting at 1 (expected {declared_link}, got {link})",
                path.display()
            ));
        }
        table.set_rates(link, rates)?;
        table.set_peer_adr(link, peer_adr, peer_type)?;
        if peer_type.is_trusted() {
            table.connect(link, peer_ip, peer_port)?;
        }
    }
    Ok(())
}

/// `comtree# coreFlag parentLink link1[*|+] [dest,bitUp,bitDown,pktUp,pktDown] ...`
pub fn load_comtrees(path: &Path, table: &ComtreeTable) -> anyhow::Result<()> {
    for fields in lines(path)? {
        let comtree: u32 = field(&fields, 0, path)?.parse()?;
        let core_flag: bool = field(&fields, 1, path)?.parse()?;
        let parent_link: u32 = field(&fields, 2, path)?.parse()?;

        table.add_comtree(comtree).map_err(|e| anyhow!("{}: {e}", path.display()))?;
        table.set_core_flag(comtree, core_flag)?;

        let mut i = 3;
        while i < fields.len() {
            let token = &fields[i];
            let is_core = token.ends_with('*');
            let is_router = is_core || token.ends_with('+');
            let link: u32 = token.trim_end_matches(['*', '+']).parse()?;
            let dest = if i + 1 < fields.len() && fields[i + 1].starts_with('[') {
                let spec = fields[i + 1].trim_start_matches('[').trim_end_matches(']');
                let parts: Vec<&str> = spec.split(',').collect();
                let dest: i32 = parts.first().copied().unwrap_or("0").parse().unwrap_or(0);
                if parts.len() == 5 {
                    let rates = RateSpec::new(
                        parts[1].parse().unwrap_or(0),
                        parts[2].parse().unwrap_or(0),
                        parts[3].parse().unwrap_or(0),
                        parts[4].parse().unwrap_or(0),
                    );
                    table.add_link(comtree, link, dest, is_core, is_router)?;
                    table.set_link_rates(comtree, link, rates)?;
                    i += 2;
                    continue;
                }
                i += 2;
                dest
            } else {
                i += 1;
                0
            };
            table.add_link(comtree, link, dest, is_core, is_router)?;
        }
        if parent_link != 0 {
            table.set_parent_link(comtree, Some(parent_link))?;
        }
    }
    Ok(())
}

/// `comtree# address link1 link2 ...` — global link numbers, translated
/// to comtree-link numbers via the comtree's own table.
pub fn load_routes(path: &Path, comtrees: &ComtreeTable, routes: &RouteTable) -> anyhow::Result<()> {
    for fields in lines(path)? {
        let comtree: u32 = field(&fields, 0, path)?.parse()?;
        let adr = fadr_from_string(field(&fields, 1, path)?)
            .ok_or_else(|| anyhow!("{}: bad route address", path.display()))?;
        let links: Vec<u32> = fields[2..].iter().map(|s| s.parse()).collect::<Result<_, _>>()?;
        let row = comtrees.row(comtree).ok_or_else(|| anyhow!("{}: unknown comtree {comtree}", path.display()))?;
        let clnks: Vec<u32> = links
            .iter()
            .map(|&l| {
                row.lock()
                    .unwrap()
                    .clnk_num(l)
                    .ok_or_else(|| anyhow!("{}: link {l} not in comtree {comtree}", path.display()))
            })
            .collect::<anyhow::Result<_>>()?;

        if crate::address::mcast_adr(adr) {
            for clnk in clnks {
                routes.add_link(comtree, adr, clnk)?;
            }
        } else {
            let clnk = *clnks.first().ok_or_else(|| anyhow!("{}: unicast route needs exactly one link", path.display()))?;
            routes.set_link(comtree, adr, clnk)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tmp(contents: &str) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(contents)
    }

    mod tempfile_path {
        use std::io::Write;
        pub struct TempFile {
            pub path: std::path::PathBuf,
        }
        impl TempFile {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!("forest-core-test-{}.txt", std::process::id()));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(contents.as_bytes()).unwrap();
                TempFile { path }
            }
        }
        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn loads_ifaces_skipping_comments_and_blanks() {
        let f = write_tmp("# comment\n\n1 127.0.0.1 30001 1000 1000 100 100\n");
        let table = IfaceTable::new();
        load_ifaces(&f.path, &table).unwrap();
        let e = table.get(1).unwrap();
        assert_eq!(e.port, 30001);
        assert_eq!(e.rates, RateSpec::new(1000, 1000, 100, 100));
    }

    #[test]
    fn rejects_out_of_order_link_numbers() {
        let f = write_tmp("2 1 127.0.0.1 30000 101 1.1 1000 1000 100 100\n");
        let table = LinkTable::new();
        assert!(load_links(&f.path, &table).is_err());
    }

    #[test]
    fn loads_comtree_with_core_and_router_links() {
        let f = write_tmp("1001 true 0 1* 2+\n");
        let table = ComtreeTable::new();
        load_comtrees(&f.path, &table).unwrap();
        assert_eq!(table.core_links(1001).unwrap(), vec![1]);
        let mut router_links = table.router_links(1001).unwrap();
        router_links.sort();
        assert_eq!(router_links, vec![1, 2]);
    }
}
