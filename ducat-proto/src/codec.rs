//! Building and parsing link packets.

use crate::buf::Buf;
use crate::header::{Header, ProtoState, Variant, MAX_PACKET};

/// Wire-level violations detected while building or parsing packets.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// The length field is below the header size or above [`MAX_PACKET`].
    #[error("frame length {0} outside valid range")]
    BadLength(usize),

    /// A payload too large to fit in a single packet.
    #[error("payload of {0} bytes exceeds the maximum packet size")]
    Oversize(usize),

    /// A decimal payload that does not parse as an unsigned integer.
    #[error("malformed decimal payload")]
    BadUint,
}

/// Allocates an empty packet buffer with header room reserved.
pub fn packet_buf(variant: Variant, payload_cap: usize) -> Buf {
    let hs = variant.header_size();
    let mut bp = Buf::new(hs + payload_cap);
    bp.reserve_head(hs);
    bp
}

/// Writes the packet header in front of the payload already in `bp`,
/// rewinding the head cursor. The length field counts the header itself.
pub fn push_header(bp: &mut Buf, ps: &ProtoState, typ: u8) {
    let hs = ps.header_size();
    let total = bp.count() + hs;
    debug_assert!(total <= MAX_PACKET);

    let mut hdr = [0u8; 6];
    hdr[0] = typ;
    hdr[1] = 0;
    hdr[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    if let Variant::Mux = ps.variant {
        hdr[4..6].copy_from_slice(&ps.xid.to_be_bytes());
    }
    bp.push_head(&hdr[..hs]);
}

/// Builds a complete packet from a payload slice.
pub fn build_packet(ps: &ProtoState, typ: u8, payload: &[u8]) -> Result<Buf, ProtoError> {
    if payload.len() > ps.variant.max_payload() {
        return Err(ProtoError::Oversize(payload.len()));
    }
    let mut bp = packet_buf(ps.variant, payload.len());
    bp.append(payload);
    push_header(&mut bp, ps, typ);
    Ok(bp)
}

/// Builds a packet whose payload is the decimal rendering of `value`
/// followed by a terminating NUL, as the status and size replies use.
pub fn build_uint_packet(ps: &ProtoState, typ: u8, value: u32) -> Buf {
    let text = value.to_string();
    let mut bp = packet_buf(ps.variant, text.len() + 1);
    bp.append(text.as_bytes());
    bp.append(&[0]);
    push_header(&mut bp, ps, typ);
    bp
}

/// Decodes a header from the front of `bytes`.
///
/// Returns `Ok(None)` when fewer than header-size bytes are available.
/// The length field must satisfy `header_size <= len <= MAX_PACKET`;
/// anything else is a protocol error and the caller must tear down the
/// link.
pub fn parse_header(variant: Variant, bytes: &[u8]) -> Result<Option<Header>, ProtoError> {
    let hs = variant.header_size();
    if bytes.len() < hs {
        return Ok(None);
    }
    let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if len < hs || len > MAX_PACKET {
        return Err(ProtoError::BadLength(len));
    }
    let xid = match variant {
        Variant::Plain => 0,
        Variant::Mux => u16::from_be_bytes([bytes[4], bytes[5]]),
    };
    Ok(Some(Header {
        typ: bytes[0],
        len: len as u16,
        xid,
    }))
}

/// Extracts one complete frame from the front of a receive buffer.
///
/// Returns `Ok(None)` while the frame is still incomplete; the buffer is
/// not advanced on either an incomplete frame or an error.
pub fn take_frame(bp: &mut Buf, variant: Variant) -> Result<Option<(Header, Vec<u8>)>, ProtoError> {
    let Some(hdr) = parse_header(variant, bp.head_slice())? else {
        return Ok(None);
    };
    let total = hdr.len as usize;
    if bp.count() < total {
        return Ok(None);
    }
    let payload = bp.head_slice()[variant.header_size()..total].to_vec();
    bp.consume(total);
    Ok(Some((hdr, payload)))
}

/// Parses a decimal ASCII payload terminated by NUL (or end of payload).
pub fn parse_uint(payload: &[u8]) -> Result<u32, ProtoError> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    let text = std::str::from_utf8(&payload[..end]).map_err(|_| ProtoError::BadUint)?;
    text.parse::<u32>().map_err(|_| ProtoError::BadUint)
}
