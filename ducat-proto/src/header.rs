//! Packet header layout and the per-link protocol state.

/// Largest packet permitted on the wire, header included.
pub const MAX_PACKET: usize = 32768;

/// Packet type bytes. For data packets the type doubles as the channel id.
pub mod ptype {
    /// Command request, payload `"<user> <shell command>\0"`.
    pub const COMMAND: u8 = b'c';
    /// Inject request, payload `"<user> <size> <path>\0"`.
    pub const INJECT: u8 = b'i';
    /// Extract request, payload `"<user> <path>\0"`.
    pub const EXTRACT: u8 = b'e';
    /// Quit-server request, no payload.
    pub const QUIT: u8 = b'q';
    /// Interrupt request, no payload.
    pub const INTERRUPT: u8 = b'I';
    /// Stdin data.
    pub const STDIN: u8 = b'0';
    /// Stdout data.
    pub const STDOUT: u8 = b'1';
    /// Stderr data.
    pub const STDERR: u8 = b'2';
    /// File data chunk.
    pub const DATA: u8 = b'd';
    /// File size reply, decimal ASCII + NUL.
    pub const SIZE: u8 = b's';
    /// EOF on a stream, no payload.
    pub const EOF: u8 = b'E';
    /// Major status, decimal ASCII + NUL.
    pub const MAJOR: u8 = b'M';
    /// Minor status, decimal ASCII + NUL.
    pub const MINOR: u8 = b'm';
    /// Timeout notification, no payload.
    pub const TIMEOUT: u8 = b'T';
}

/// Header layout used on a link, fixed for the link's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// 4-byte header `{type, pad, len:u16be}`; one transaction per link.
    Plain,
    /// 6-byte header with a trailing `xid:u16be` for demultiplexing.
    Mux,
}

impl Variant {
    /// Size in bytes of the on-wire header.
    pub const fn header_size(self) -> usize {
        match self {
            Variant::Plain => 4,
            Variant::Mux => 6,
        }
    }

    /// Largest payload that fits in one packet.
    pub const fn max_payload(self) -> usize {
        MAX_PACKET - self.header_size()
    }
}

/// Everything needed to stamp or match a packet for one transaction on
/// one link: the header variant and the transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoState {
    /// Header layout of the link this state belongs to.
    pub variant: Variant,
    /// Transaction id; always 0 on plain links.
    pub xid: u16,
}

impl ProtoState {
    /// Creates the state for one transaction.
    pub fn new(variant: Variant, xid: u16) -> Self {
        Self { variant, xid }
    }

    /// State for a plain, single-transaction link.
    pub fn plain() -> Self {
        Self::new(Variant::Plain, 0)
    }

    /// Header size of the link this state belongs to.
    pub fn header_size(&self) -> usize {
        self.variant.header_size()
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Packet type byte.
    pub typ: u8,
    /// Total packet length, header included.
    pub len: u16,
    /// Transaction id; 0 on plain links.
    pub xid: u16,
}

impl Header {
    /// Payload length for a link using `variant`.
    pub fn payload_len(&self, variant: Variant) -> usize {
        self.len as usize - variant.header_size()
    }
}
