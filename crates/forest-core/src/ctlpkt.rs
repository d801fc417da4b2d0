//! Control packet header and (tag, length, value) body, carried in the
//! payload of CLIENT_SIG / NET_SIG packets.
//!
//! The tag codes and control-packet type codes below are fixed by the
//! original implementation and reproduced here (ambiguity resolved by
//! reading the original in preference to guessing) so this router's control
//! protocol is byte-compatible with anything else that speaks it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::ForestAddr;
use crate::error::{Result, RouterError};
use crate::rate_spec::RateSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CpMode {
    Undef = 0,
    Request = 1,
    PosReply = 2,
    NegReply = 3,
    NoReply = 4,
}

impl CpMode {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => CpMode::Undef,
            1 => CpMode::Request,
            2 => CpMode::PosReply,
            3 => CpMode::NegReply,
            4 => CpMode::NoReply,
            _ => return None,
        })
    }
}

/// Control packet type codes, carried forward from the original
/// implementation's `CtlPkt::CpType` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CpType {
    Undef = 0,
    JoinComtree = 10,
    LeaveComtree = 11,
    AddIface = 30,
    DropIface = 31,
    GetIface = 32,
    ModIface = 33,
    GetIfaceSet = 34,
    AddLink = 40,
    DropLink = 41,
    GetLink = 42,
    ModLink = 43,
    GetLinkSet = 44,
    AddComtree = 50,
    DropComtree = 51,
    GetComtree = 52,
    ModComtree = 53,
    AddComtreeLink = 54,
    DropComtreeLink = 55,
    ModComtreeLink = 56,
    GetComtreeLink = 57,
    GetComtreeSet = 58,
    AddRoute = 70,
    DropRoute = 71,
    GetRoute = 72,
    ModRoute = 73,
    AddRouteLink = 74,
    DropRouteLink = 75,
    GetRouteSet = 76,
    AddFilter = 80,
    DropFilter = 81,
    GetFilter = 82,
    ModFilter = 83,
    GetFilterSet = 84,
    GetLoggedPackets = 85,
    EnablePacketLog = 86,
    NewSession = 100,
    ClientConnect = 101,
    ClientDisconnect = 102,
    CancelSession = 103,
    SetLeafRange = 110,
    ConfigLeaf = 111,
    BootRouter = 120,
    BootComplete = 121,
    BootAbort = 122,
    BootLeaf = 123,
    ComtreePath = 130,
    AddBranch = 131,
    Confirm = 132,
    Abort = 133,
    Prune = 134,
    AddNode = 135,
    DropNode = 136,
}

impl CpType {
    pub fn from_u16(v: u16) -> Option<Self> {
        use CpType::*;
        Some(match v {
            0 => Undef,
            10 => JoinComtree,
            11 => LeaveComtree,
            30 => AddIface,
            31 => DropIface,
            32 => GetIface,
            33 => ModIface,
            34 => GetIfaceSet,
            40 => AddLink,
            41 => DropLink,
            42 => GetLink,
            43 => ModLink,
            44 => GetLinkSet,
            50 => AddComtree,
            51 => DropComtree,
            52 => GetComtree,
            53 => ModComtree,
            54 => AddComtreeLink,
            55 => DropComtreeLink,
            56 => ModComtreeLink,
            57 => GetComtreeLink,
            58 => GetComtreeSet,
            70 => AddRoute,
            71 => DropRoute,
            72 => GetRoute,
            73 => ModRoute,
            74 => AddRouteLink,
            75 => DropRouteLink,
            76 => GetRouteSet,
            80 => AddFilter,
            81 => DropFilter,
            82 => GetFilter,
            83 => ModFilter,
            84 => GetFilterSet,
            85 => GetLoggedPackets,
            86 => EnablePacketLog,
            100 => NewSession,
            101 => ClientConnect,
            102 => ClientDisconnect,
            103 => CancelSession,
            110 => SetLeafRange,
            111 => ConfigLeaf,
            120 => BootRouter,
            121 => BootComplete,
            122 => BootAbort,
            123 => BootLeaf,
            130 => ComtreePath,
            131 => AddBranch,
            132 => Confirm,
            133 => Abort,
            134 => Prune,
            135 => AddNode,
            136 => DropNode,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum Tag {
    S16 = 1,
    U16 = 2,
    S32 = 3,
    U32 = 4,
    S64 = 5,
    U64 = 6,
    RateSpec = 7,
    AttrString = 8,
    IntVec = 9,
}

/// Builds a control packet body: base header (type, mode, seqNum) followed
/// by a sequence of (tag, length, value) tuples.
pub struct CtlPktWriter {
    buf: BytesMut,
}

impl CtlPktWriter {
    pub fn new(cp_type: CpType, mode: CpMode, seq_num: u64) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(cp_type as u16);
        buf.put_u16(mode as u16);
        buf.put_u64(seq_num);
        CtlPktWriter { buf }
    }

    pub fn put_s16(&mut self, x: i16) -> &mut Self {
        self.buf.put_u16(Tag::S16 as u16);
        self.buf.put_u16(2);
        self.buf.put_i16(x);
        self
    }

    pub fn put_u16(&mut self, x: u16) -> &mut Self {
        self.buf.put_u16(Tag::U16 as u16);
        self.buf.put_u16(2);
        self.buf.put_u16(x);
        self
    }

    pub fn put_s32(&mut self, x: i32) -> &mut Self {
        self.buf.put_u16(Tag::S32 as u16);
        self.buf.put_u16(4);
        self.buf.put_i32(x);
        self
    }

    pub fn put_u32(&mut self, x: u32) -> &mut Self {
        self.buf.put_u16(Tag::U32 as u16);
        self.buf.put_u16(4);
        self.buf.put_u32(x);
        self
    }

    pub fn put_s64(&mut self, x: i64) -> &mut Self {
        self.buf.put_u16(Tag::S64 as u16);
        self.buf.put_u16(8);
        self.buf.put_i64(x);
        self
    }

    pub fn put_u64(&mut self, x: u64) -> &mut Self {
        self.buf.put_u16(Tag::U64 as u16);
        self.buf.put_u16(8);
        self.buf.put_u64(x);
        self
    }

    pub fn put_fadr(&mut self, x: ForestAddr) -> &mut Self {
        self.put_s32(x)
    }

    pub fn put_rate_spec(&mut self, rs: &RateSpec) -> &mut Self {
        self.buf.put_u16(Tag::RateSpec as u16);
        self.buf.put_u16(16);
        self.buf.put_i32(rs.bit_up);
        self.buf.put_i32(rs.bit_down);
        self.buf.put_i32(rs.pkt_up);
        self.buf.put_i32(rs.pkt_down);
        self
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.buf.put_u16(Tag::AttrString as u16);
        self.buf.put_u16(s.len() as u16);
        self.buf.put_slice(s.as_bytes());
        self
    }

    pub fn put_int_vec(&mut self, v: &[i32]) -> &mut Self {
        self.buf.put_u16(Tag::IntVec as u16);
        self.buf.put_u16((v.len() * 4) as u16);
        for x in v {
            self.buf.put_i32(*x);
        }
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads a control packet body written by `CtlPktWriter`.
pub struct CtlPktReader {
    buf: Bytes,
    pub cp_type: CpType,
    pub mode: CpMode,
    pub seq_num: u64,
}

impl CtlPktReader {
    pub fn parse(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(RouterError::MalformedPacket("control packet too short".into()));
        }
        let cp_type_raw = bytes.get_u16();
        let mode_raw = bytes.get_u16();
        let seq_num = bytes.get_u64();
        let cp_type = CpType::from_u16(cp_type_raw)
            .ok_or_else(|| RouterError::MalformedPacket(format!("unknown cp type {cp_type_raw}")))?;
        let mode = CpMode::from_u16(mode_raw)
            .ok_or_else(|| RouterError::MalformedPacket(format!("unknown cp mode {mode_raw}")))?;
        Ok(CtlPktReader {
            buf: bytes,
            cp_type,
            mode,
            seq_num,
        })
    }

    fn take_tagged(&mut self, expect: Tag) -> Result<Bytes> {
        if self.buf.len() < 4 {
            return Err(RouterError::MalformedPacket("truncated attribute".into()));
        }
        let tag = self.buf.get_u16();
        let len = self.buf.get_u16() as usize;
        if tag != expect as u16 {
            return Err(RouterError::MalformedPacket(format!(
                "expected tag {}, got {}",
                expect as u16, tag
            )));
        }
        if self.buf.len() < len {
            return Err(RouterError::MalformedPacket("attribute length overruns body".into()));
        }
        Ok(self.buf.split_to(len))
    }

    pub fn get_s16(&mut self) -> Result<i16> {
        let mut v = self.take_tagged(Tag::S16)?;
        if v.len() != 2 {
            return Err(RouterError::MalformedPacket("bad s16 length".into()));
        }
        Ok(v.get_i16())
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let mut v = self.take_tagged(Tag::U16)?;
        if v.len() != 2 {
            return Err(RouterError::MalformedPacket("bad u16 length".into()));
        }
        Ok(v.get_u16())
    }

    pub fn get_s32(&mut self) -> Result<i32> {
        let mut v = self.take_tagged(Tag::S32)?;
        if v.len() != 4 {
            return Err(RouterError::MalformedPacket("bad s32 length".into()));
        }
        Ok(v.get_i32())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut v = self.take_tagged(Tag::U32)?;
        if v.len() != 4 {
            return Err(RouterError::MalformedPacket("bad u32 length".into()));
        }
        Ok(v.get_u32())
    }

    pub fn get_s64(&mut self) -> Result<i64> {
        let mut v = self.take_tagged(Tag::S64)?;
        if v.len() != 8 {
            return Err(RouterError::MalformedPacket("bad s64 length".into()));
        }
        Ok(v.get_i64())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut v = self.take_tagged(Tag::U64)?;
        if v.len() != 8 {
            return Err(RouterError::MalformedPacket("bad u64 length".into()));
        }
        Ok(v.get_u64())
    }

    pub fn get_fadr(&mut self) -> Result<ForestAddr> {
        self.get_s32()
    }

    pub fn get_rate_spec(&mut self) -> Result<RateSpec> {
        let mut v = self.take_tagged(Tag::RateSpec)?;
        if v.len() != 16 {
            return Err(RouterError::MalformedPacket("bad RateSpec length".into()));
        }
        Ok(RateSpec {
            bit_up: v.get_i32(),
            bit_down: v.get_i32(),
            pkt_up: v.get_i32(),
            pkt_down: v.get_i32(),
        })
    }

    pub fn get_string(&mut self) -> Result<String> {
        let v = self.take_tagged(Tag::AttrString)?;
        String::from_utf8(v.to_vec()).map_err(|e| RouterError::MalformedPacket(e.to_string()))
    }

    /// Reads the `intVec` tag correctly — the original extractor for this
    /// type checks the wrong tag code; this implementation checks `IntVec`
    /// as documented.
    pub fn get_int_vec(&mut self) -> Result<Vec<i32>> {
        let mut v = self.take_tagged(Tag::IntVec)?;
        if v.len() % 4 != 0 {
            return Err(RouterError::MalformedPacket("bad int-vector length".into()));
        }
        let mut out = Vec::with_capacity(v.len() / 4);
        while v.has_remaining() {
            out.push(v.get_i32());
        }
        Ok(out)
    }

    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }
}
