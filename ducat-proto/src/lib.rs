//! Wire framing for the ducat link protocol.
//!
//! Every packet on the link is `{type:u8, pad:u8, len:u16be}` followed by
//! the payload, where `len` counts the header itself. Multiplexed links
//! extend the header with a big-endian `xid` that routes the packet to its
//! owning transaction. The framing is suitable for any reliable byte
//! stream (virtio-serial, serial line, TCP).

mod buf;
pub mod codec;
mod header;

pub use buf::Buf;
pub use codec::ProtoError;
pub use header::{ptype, Header, ProtoState, Variant, MAX_PACKET};
