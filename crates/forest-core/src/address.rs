//! Forest address encoding, node/packet type codes, and protocol constants.
//!
//! Mirrors the numeric layout of the reference implementation so that this
//! router can interoperate with anything else speaking the wire format.

/// A Forest address: positive values are unicast `(zip, local)` pairs,
/// negative values are multicast groups, zero is the null address.
pub type ForestAddr = i32;

/// A comtree number.
pub type ComtreeNum = u32;

pub const FOREST_VERSION: u8 = 1;
pub const HDR_LENG: usize = 20;
pub const OVERHEAD: usize = 24;
pub const MAX_PAYLOAD: usize = 1500 - HDR_LENG;
pub const BUF_SIZ: usize = 1600;

pub const RTE_REQ: u8 = 0x01;
pub const ACK_FLAG: u8 = 0x02;

pub const NM_PORT: u16 = 30120;
pub const CC_PORT: u16 = 30121;
pub const CM_PORT: u16 = 30122;
pub const ROUTER_PORT: u16 = 30123;

pub const MAXINTF: usize = 20;
pub const MAXLNK: usize = 1000;

pub const MIN_BIT_RATE: i32 = 20;
pub const MAX_BIT_RATE: i32 = 900_000;
pub const MIN_PKT_RATE: i32 = 10;
pub const MAX_PKT_RATE: i32 = 450_000;

pub const CLIENT_CON_COMT: ComtreeNum = 1;
pub const CLIENT_SIG_COMT: ComtreeNum = 2;
pub const NET_SIG_COMT: ComtreeNum = 100;

/// Node type of a link's peer. Ordering matters: `peerType >= TRUSTED`
/// is the "trusted peer" test used by packet validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum NodeType {
    Undef = 0,
    Client = 1,
    Server = 2,
    Trusted = 100,
    Router = 101,
    Controller = 102,
}

impl NodeType {
    pub fn is_trusted(self) -> bool {
        self >= NodeType::Trusted
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => NodeType::Undef,
            1 => NodeType::Client,
            2 => NodeType::Server,
            100 => NodeType::Trusted,
            101 => NodeType::Router,
            102 => NodeType::Controller,
            _ => return None,
        })
    }
}

/// Forest packet type, carried in the wire header's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ClientData = 1,
    SubUnsub = 2,
    ClientSig = 10,
    Connect = 11,
    Disconnect = 12,
    NetSig = 100,
    RteReply = 101,
    RtrCtl = 200,
    VoqStatus = 201,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => PacketType::ClientData,
            2 => PacketType::SubUnsub,
            10 => PacketType::ClientSig,
            11 => PacketType::Connect,
            12 => PacketType::Disconnect,
            100 => PacketType::NetSig,
            101 => PacketType::RteReply,
            200 => PacketType::RtrCtl,
            201 => PacketType::VoqStatus,
            _ => return None,
        })
    }
}

/// `zip = (adr >> 16) & 0x7fff`
pub fn zip_code(adr: ForestAddr) -> i32 {
    (adr >> 16) & 0x7fff
}

/// `local = adr & 0xffff`
pub fn local_adr(adr: ForestAddr) -> i32 {
    adr & 0xffff
}

pub fn forest_adr(zip: i32, local: i32) -> ForestAddr {
    ((zip & 0x7fff) << 16) | (local & 0xffff)
}

/// True for the all-zero null address, or a unicast address whose zip and
/// local parts are both nonzero.
pub fn valid_ucast_adr(adr: ForestAddr) -> bool {
    if adr == 0 {
        return true;
    }
    adr > 0 && zip_code(adr) != 0 && local_adr(adr) != 0
}

pub fn mcast_adr(adr: ForestAddr) -> bool {
    adr < 0
}

pub fn fadr_to_string(adr: ForestAddr) -> String {
    if mcast_adr(adr) {
        adr.to_string()
    } else {
        format!("{}.{}", zip_code(adr), local_adr(adr))
    }
}

pub fn fadr_from_string(s: &str) -> Option<ForestAddr> {
    if let Some(rest) = s.strip_prefix('-') {
        let n: i32 = rest.parse().ok()?;
        return Some(-n);
    }
    let mut parts = s.splitn(2, '.');
    let zip: i32 = parts.next()?.parse().ok()?;
    let local: i32 = parts.next()?.parse().ok()?;
    Some(forest_adr(zip, local))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_unicast_string() {
        let a = forest_adr(3, 42);
        assert_eq!(fadr_to_string(a), "3.42");
        assert_eq!(fadr_from_string("3.42"), Some(a));
    }

    #[test]
    fn multicast_is_negative() {
        assert!(mcast_adr(-100));
        assert!(!mcast_adr(100));
        assert_eq!(fadr_from_string("-100"), Some(-100));
    }

    #[test]
    fn null_address_is_valid() {
        assert!(valid_ucast_adr(0));
    }

    #[test]
    fn zero_half_is_invalid() {
        assert!(!valid_ucast_adr(forest_adr(0, 5)));
        assert!(!valid_ucast_adr(forest_adr(5, 0)));
    }

    #[test]
    fn trusted_ordering() {
        assert!(NodeType::Router.is_trusted());
        assert!(NodeType::Trusted.is_trusted());
        assert!(!NodeType::Client.is_trusted());
    }
}
