//! Forest packet wire format: a fixed 20-byte header (five big-endian `u32`
//! words) followed by up to 1480 bytes of payload.
//!
//! Word layout: `version:4 | length:12 | type:8 | flags:8`, `comtree`,
//! `srcAdr`, `dstAdr`, `checksum` (reserved for a header checksum; unused by
//! this router, since Forest's wire format carries no cryptographic
//! integrity — see the non-goals).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::{ForestAddr, ComtreeNum, PacketType, FOREST_VERSION, HDR_LENG, MAX_PAYLOAD};
use crate::error::{Result, RouterError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub length: u16,
    pub ptype: u8,
    pub flags: u8,
    pub comtree: ComtreeNum,
    pub src_adr: ForestAddr,
    pub dst_adr: ForestAddr,
    pub checksum: u32,
}

impl PacketHeader {
    pub fn rte_req(&self) -> bool {
        self.flags & crate::address::RTE_REQ != 0
    }

    pub fn ack(&self) -> bool {
        self.flags & crate::address::ACK_FLAG != 0
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.ptype)
    }
}

/// A Forest packet: decoded header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(
        ptype: u8,
        flags: u8,
        comtree: ComtreeNum,
        src_adr: ForestAddr,
        dst_adr: ForestAddr,
        payload: Bytes,
    ) -> Self {
        let length = (HDR_LENG + payload.len()) as u16;
        Packet {
            header: PacketHeader {
                version: FOREST_VERSION,
                length,
                ptype,
                flags,
                comtree,
                src_adr,
                dst_adr,
                checksum: 0,
            },
            payload,
        }
    }

    /// Pack the header and payload into wire bytes.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HDR_LENG + self.payload.len());
        let word0 = ((self.header.version as u32 & 0xf) << 28)
            | ((self.header.length as u32 & 0xfff) << 16)
            | ((self.header.ptype as u32) << 8)
            | (self.header.flags as u32);
        buf.put_u32(word0);
        buf.put_u32(self.header.comtree);
        buf.put_i32(self.header.src_adr);
        buf.put_i32(self.header.dst_adr);
        buf.put_u32(self.header.checksum);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Unpack wire bytes into a packet, validating version/length per §4.6
    /// step 1. `length` must be within `[HDR_LENG, HDR_LENG + MAX_PAYLOAD]`
    /// and must match the actual buffer length.
    pub fn unpack(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < HDR_LENG {
            return Err(RouterError::MalformedPacket("shorter than header".into()));
        }
        let word0 = bytes.get_u32();
        let version = ((word0 >> 28) & 0xf) as u8;
        let length = ((word0 >> 16) & 0xfff) as u16;
        let ptype = ((word0 >> 8) & 0xff) as u8;
        let flags = (word0 & 0xff) as u8;
        let comtree = bytes.get_u32();
        let src_adr = bytes.get_i32();
        let dst_adr = bytes.get_i32();
        let checksum = bytes.get_u32();

        if version != FOREST_VERSION {
            return Err(RouterError::MalformedPacket(format!(
                "bad version {version}"
            )));
        }
        let total_len = length as usize;
        if total_len < HDR_LENG || total_len > HDR_LENG + MAX_PAYLOAD {
            return Err(RouterError::MalformedPacket(format!(
                "length {total_len} out of range"
            )));
        }
        if total_len != HDR_LENG + bytes.len() {
            return Err(RouterError::MalformedPacket(
                "length field does not match buffer size".into(),
            ));
        }

        Ok(Packet {
            header: PacketHeader {
                version,
                length,
                ptype,
                flags,
                comtree,
                src_adr,
                dst_adr,
                checksum,
            },
            payload: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let p = Packet::new(1, 0, 5, 0x00010001, 0x00020002, Bytes::from_static(b"hello"));
        let bytes = p.pack();
        let back = Packet::unpack(bytes.clone()).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.pack(), bytes);
    }

    #[test]
    fn zero_length_payload_accepted() {
        let p = Packet::new(1, 0, 1, 0, 0, Bytes::new());
        let bytes = p.pack();
        let back = Packet::unpack(bytes).unwrap();
        assert!(back.payload.is_empty());
    }

    #[test]
    fn oversized_length_rejected() {
        let mut p = Packet::new(1, 0, 1, 0, 0, Bytes::from(vec![0u8; 10]));
        p.header.length = (HDR_LENG + MAX_PAYLOAD + 1) as u16;
        let bytes = p.pack();
        assert!(Packet::unpack(bytes).is_err());
    }

    #[test]
    fn bad_version_rejected() {
        let mut p = Packet::new(1, 0, 1, 0, 0, Bytes::new());
        p.header.version = 2;
        let bytes = p.pack();
        assert!(Packet::unpack(bytes).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary_valid_packets(
            ptype in 0u8..=255,
            flags in 0u8..=255,
            comtree in any::<u32>(),
            src in any::<i32>(),
            dst in any::<i32>(),
            payload_len in 0usize..200,
        ) {
            let payload = vec![0xabu8; payload_len];
            let p = Packet::new(ptype, flags, comtree, src, dst, Bytes::from(payload));
            let bytes = p.pack();
            let back = Packet::unpack(bytes.clone()).unwrap();
            prop_assert_eq!(back.pack(), bytes);
        }
    }
}
