//! Rate specification and its arithmetic, used throughout the available-rate
//! bookkeeping for interfaces, links, and comtree-links.

use serde::{Deserialize, Serialize};

/// Four-tuple of provisioned rates: bits/sec and packets/sec, each split by
/// direction relative to this router ("up" = towards this router, "down" =
/// away from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateSpec {
    pub bit_up: i32,
    pub bit_down: i32,
    pub pkt_up: i32,
    pub pkt_down: i32,
}

impl RateSpec {
    /// Sentinel "unset" spec, matching the source's default constructor.
    pub const UNSET: RateSpec = RateSpec {
        bit_up: -1,
        bit_down: 0,
        pkt_up: 0,
        pkt_down: 0,
    };

    pub fn new(bit_up: i32, bit_down: i32, pkt_up: i32, pkt_down: i32) -> Self {
        RateSpec {
            bit_up,
            bit_down,
            pkt_up,
            pkt_down,
        }
    }

    /// Uniform rate in all four fields.
    pub fn uniform(r: i32) -> Self {
        RateSpec::new(r, r, r, r)
    }

    pub fn is_set(&self) -> bool {
        self.bit_up != -1
    }

    pub fn is_zero(&self) -> bool {
        self.bit_up == 0 && self.bit_down == 0 && self.pkt_up == 0 && self.pkt_down == 0
    }

    /// Swap up/down for both bit and packet rate — used when a link's
    /// configured rate, defined from the peer's perspective, is translated
    /// to this router's perspective.
    pub fn flip(&self) -> Self {
        RateSpec {
            bit_up: self.bit_down,
            bit_down: self.bit_up,
            pkt_up: self.pkt_down,
            pkt_down: self.pkt_up,
        }
    }

    pub fn add(&self, other: &RateSpec) -> Self {
        RateSpec {
            bit_up: self.bit_up + other.bit_up,
            bit_down: self.bit_down + other.bit_down,
            pkt_up: self.pkt_up + other.pkt_up,
            pkt_down: self.pkt_down + other.pkt_down,
        }
    }

    pub fn subtract(&self, other: &RateSpec) -> Self {
        RateSpec {
            bit_up: self.bit_up - other.bit_up,
            bit_down: self.bit_down - other.bit_down,
            pkt_up: self.pkt_up - other.pkt_up,
            pkt_down: self.pkt_down - other.pkt_down,
        }
    }

    pub fn negate(&self) -> Self {
        RateSpec {
            bit_up: -self.bit_up,
            bit_down: -self.bit_down,
            pkt_up: -self.pkt_up,
            pkt_down: -self.pkt_down,
        }
    }

    pub fn scale(&self, factor: f64) -> Self {
        RateSpec {
            bit_up: (self.bit_up as f64 * factor) as i32,
            bit_down: (self.bit_down as f64 * factor) as i32,
            pkt_up: (self.pkt_up as f64 * factor) as i32,
            pkt_down: (self.pkt_down as f64 * factor) as i32,
        }
    }

    /// True if every field of `self` is ≤ the corresponding field of `other`.
    pub fn leq(&self, other: &RateSpec) -> bool {
        self.bit_up <= other.bit_up
            && self.bit_down <= other.bit_down
            && self.pkt_up <= other.pkt_up
            && self.pkt_down <= other.pkt_down
    }

    /// Clamp each rate into the protocol-wide bounds from §3.
    pub fn clamp_to_bounds(&self) -> Self {
        use crate::address::{MAX_BIT_RATE, MAX_PKT_RATE, MIN_BIT_RATE, MIN_PKT_RATE};
        RateSpec {
            bit_up: self.bit_up.clamp(MIN_BIT_RATE, MAX_BIT_RATE),
            bit_down: self.bit_down.clamp(MIN_BIT_RATE, MAX_BIT_RATE),
            pkt_up: self.pkt_up.clamp(MIN_PKT_RATE, MAX_PKT_RATE),
            pkt_down: self.pkt_down.clamp(MIN_PKT_RATE, MAX_PKT_RATE),
        }
    }
}
