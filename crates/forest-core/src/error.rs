//! Typed error surface for the router's internal APIs (§7).
//!
//! The data plane never surfaces these: the forwarder converts them into a
//! silent drop plus a counter increment. The control handler is the only
//! place that converts one into a NEG_REPLY control packet.

use thiserror::Error;

use crate::address::ComtreeNum;
use crate::rate_spec::RateSpec;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown comtree {0}")]
    UnknownComtree(ComtreeNum),

    #[error("unknown route for comtree {comtree} address {address}")]
    UnknownRoute { comtree: ComtreeNum, address: i32 },

    #[error("capacity exceeded: requested {requested:?}, available {available:?}")]
    CapacityExceeded {
        requested: RateSpec,
        available: RateSpec,
    },

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("packet store exhausted")]
    OutOfPackets,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;
