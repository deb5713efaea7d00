//! Wire framing and the shared, refcounted message buffer.
//!
//! The 16-byte `real_hdr` and per-type payload layouts are the
//! cross-host wire contract; the exact field order and sizes are taken
//! from `original_source/controller/const.hpp`.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::MessageError;

pub const HDR_LEN: usize = 16;
pub const SYN_LEN: usize = HDR_LEN + 4 + 4 + 2; // cli_id, svr_id, cli_port
pub const SYNACK_LEN: usize = HDR_LEN + 2; // cli_port
pub const PAYLOAD_PREFIX_LEN: usize = HDR_LEN + 4 + 4; // src_id, dst_id

/// Offset of the BGP type byte within a PAYLOAD frame's opaque tail, per
/// the `BGP_TYPE(buf)` macro in `const.hpp` (offset 18 from frame start,
/// i.e. byte 2 of the opaque BGP bytes that follow `src_id`/`dst_id`).
pub const BGP_TYPE_OFFSET: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum MsgType {
    Syn = 1,
    SynAck = 2,
    Payload = 3,
    Ack = 4,
    EndOfStage = 5,
    KeepBusy = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BgpType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
}

/// Refcounted, growable framed byte buffer. Cheap to clone: clones share
/// the backing allocation, mirroring the original's `shared_ptr<Message>`.
#[derive(Debug, Clone)]
pub struct Message(Arc<MessageInner>);

#[derive(Debug)]
struct MessageInner {
    data: Vec<u8>,
}

impl Message {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Message(Arc::new(MessageInner { data }))
    }

    pub fn with_capacity(cap: usize) -> MessageBuilder {
        MessageBuilder { data: Vec::with_capacity(cap) }
    }

    pub fn data(&self) -> &[u8] {
        &self.0.data
    }

    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    pub fn header(&self) -> Result<Header, MessageError> {
        Header::parse(&self.0.data)
    }

    /// Returns the BGP type byte for a PAYLOAD frame, if present.
    pub fn bgp_type(&self) -> Option<u8> {
        self.0.data.get(BGP_TYPE_OFFSET).copied()
    }

    /// Produces a copy of this message with the header's `seq` field
    /// overwritten — used to stamp a replay sequence number without
    /// disturbing other shared handles to the original bytes.
    pub fn with_seq(&self, seq: i64) -> Message {
        let mut data = self.0.data.clone();
        data[8..16].copy_from_slice(&seq.to_le_bytes());
        Message::from_bytes(data)
    }
}

/// Growable builder, mirroring the original `Message::alloc_tail` growth
/// discipline (reserve ahead, extend in place, never shrink).
pub struct MessageBuilder {
    data: Vec<u8>,
}

impl MessageBuilder {
    pub fn alloc_tail(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn build(self) -> Message {
        Message::from_bytes(self.data)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub msg_type: i32,
    pub msg_len: i32,
    pub seq: i64,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Header, MessageError> {
        if buf.len() < HDR_LEN {
            return Err(MessageError::TooShort { len: buf.len(), min: HDR_LEN });
        }
        let msg_type = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let msg_len = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let seq = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok(Header { msg_type, msg_len, seq })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.msg_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.msg_len.to_le_bytes());
        out[8..16].copy_from_slice(&self.seq.to_le_bytes());
    }

    pub fn kind(&self) -> Result<MsgType, MessageError> {
        MsgType::try_from(self.msg_type).map_err(|_| MessageError::UnknownType(self.msg_type))
    }
}

pub fn build_syn(cli_id: i32, svr_id: i32, cli_port: u16) -> Message {
    let mut b = Message::with_capacity(SYN_LEN);
    let hdr = Header { msg_type: MsgType::Syn.into(), msg_len: SYN_LEN as i32, seq: 0 };
    let buf = b.alloc_tail(SYN_LEN);
    hdr.write(&mut buf[..HDR_LEN]);
    buf[HDR_LEN..HDR_LEN + 4].copy_from_slice(&cli_id.to_le_bytes());
    buf[HDR_LEN + 4..HDR_LEN + 8].copy_from_slice(&svr_id.to_le_bytes());
    buf[HDR_LEN + 8..HDR_LEN + 10].copy_from_slice(&cli_port.to_le_bytes());
    b.build()
}

pub fn build_synack(cli_port: u16) -> Message {
    let mut b = Message::with_capacity(SYNACK_LEN);
    let hdr = Header { msg_type: MsgType::SynAck.into(), msg_len: SYNACK_LEN as i32, seq: 0 };
    let buf = b.alloc_tail(SYNACK_LEN);
    hdr.write(&mut buf[..HDR_LEN]);
    buf[HDR_LEN..HDR_LEN + 2].copy_from_slice(&cli_port.to_le_bytes());
    b.build()
}

pub fn build_payload(src_id: i32, dst_id: i32, opaque: &[u8]) -> Message {
    let total = PAYLOAD_PREFIX_LEN + opaque.len();
    let mut b = Message::with_capacity(total);
    let hdr = Header { msg_type: MsgType::Payload.into(), msg_len: total as i32, seq: 0 };
    let buf = b.alloc_tail(total);
    hdr.write(&mut buf[..HDR_LEN]);
    buf[HDR_LEN..HDR_LEN + 4].copy_from_slice(&src_id.to_le_bytes());
    buf[HDR_LEN + 4..HDR_LEN + 8].copy_from_slice(&dst_id.to_le_bytes());
    buf[PAYLOAD_PREFIX_LEN..].copy_from_slice(opaque);
    b.build()
}

pub fn build_end_of_stage(stage: i64) -> Message {
    let mut b = Message::with_capacity(HDR_LEN);
    let hdr = Header { msg_type: MsgType::EndOfStage.into(), msg_len: HDR_LEN as i32, seq: stage };
    let buf = b.alloc_tail(HDR_LEN);
    hdr.write(buf);
    b.build()
}

pub fn build_keepbusy() -> Message {
    let mut b = Message::with_capacity(HDR_LEN);
    let hdr = Header { msg_type: MsgType::KeepBusy.into(), msg_len: HDR_LEN as i32, seq: 0 };
    let buf = b.alloc_tail(HDR_LEN);
    hdr.write(buf);
    b.build()
}

/// PAYLOAD's `src_id`/`dst_id` fields, read without caring who built the
/// frame. Panics if called on a non-PAYLOAD message — callers must check
/// `Header::kind()` first.
pub fn payload_ids(msg: &Message) -> (i32, i32) {
    let data = msg.data();
    let src = i32::from_le_bytes(data[HDR_LEN..HDR_LEN + 4].try_into().unwrap());
    let dst = i32::from_le_bytes(data[HDR_LEN + 4..HDR_LEN + 8].try_into().unwrap());
    (src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let msg = build_payload(1, 2, &[0u8; 19]);
        let hdr = msg.header().unwrap();
        assert_eq!(hdr.kind().unwrap(), MsgType::Payload);
        assert_eq!(hdr.msg_len as usize, msg.len());
    }

    #[test]
    fn synack_zero_port_means_rejected() {
        let msg = build_synack(0);
        let data = msg.data();
        let port = u16::from_le_bytes(data[HDR_LEN..HDR_LEN + 2].try_into().unwrap());
        assert_eq!(port, 0);
    }

    #[test]
    fn bgp_type_offset_reads_payload_byte() {
        let mut opaque = vec![0u8; 19];
        opaque[2] = BgpType::Keepalive.into();
        let msg = build_payload(1, 2, &opaque);
        assert_eq!(msg.bgp_type(), Some(BgpType::Keepalive.into()));
    }

    #[test]
    fn with_seq_does_not_mutate_original_shared_handle() {
        let msg = build_payload(1, 2, &[]);
        let clone = msg.clone();
        let stamped = msg.with_seq(42);
        assert_eq!(stamped.header().unwrap().seq, 42);
        assert_eq!(clone.header().unwrap().seq, 0);
    }

    #[test]
    fn too_short_buffer_is_rejected() {
        let msg = Message::from_bytes(vec![0u8; 4]);
        assert!(matches!(msg.header(), Err(MessageError::TooShort { .. })));
    }
}
