//! Transaction channels: adaptors between a local descriptor and a link
//! packet type.
//!
//! A *sink* receives payload from the link and writes it to the local
//! descriptor; a *source* reads from the local descriptor and forwards
//! each chunk as a typed packet. The channel id is the packet type byte
//! used on the wire for that direction.

use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use ducat_proto::{Buf, MAX_PACKET};

use crate::sock::{Mode, Sock};
use crate::transaction::ChannelHook;

/// How long a sink is given to drain when the link signals stream EOF.
/// Sinks are local files and pipes, so this is generous.
const EOF_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Direction of a channel relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The link delivers data; we write it locally.
    Sink,
    /// We read locally and transmit onto the link.
    Source,
}

/// One sink or source owned by a transaction.
pub struct Channel {
    id: u8,
    direction: Direction,
    sock: Option<Sock>,
    plugged: bool,
    on_read_eof: Option<ChannelHook>,
    on_write_eof: Option<ChannelHook>,
}

impl Channel {
    pub(crate) fn new(fd: OwnedFd, id: u8, direction: Direction) -> io::Result<Self> {
        let mode = match direction {
            Direction::Sink => Mode::WriteOnly,
            Direction::Source => Mode::ReadOnly,
        };
        Ok(Self {
            id,
            direction,
            sock: Some(Sock::new(fd, mode)?),
            plugged: false,
            on_read_eof: None,
            on_write_eof: None,
        })
    }

    /// The packet type byte this channel maps to.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Sink or source.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// A plugged source is withheld from polling until unplugged.
    pub fn is_plugged(&self) -> bool {
        self.plugged
    }

    /// Plugs or unplugs a source.
    pub fn set_plugged(&mut self, plugged: bool) {
        self.plugged = plugged;
    }

    /// Installs the one-shot hook fired when the local descriptor
    /// reaches EOF (sources).
    pub fn set_on_read_eof(&mut self, hook: ChannelHook) {
        self.on_read_eof = Some(hook);
    }

    /// Installs the one-shot hook fired when the link signals EOF for
    /// this stream (sinks).
    pub fn set_on_write_eof(&mut self, hook: ChannelHook) {
        self.on_write_eof = Some(hook);
    }

    pub(crate) fn has_write_eof_hook(&self) -> bool {
        self.on_write_eof.is_some()
    }

    pub(crate) fn take_write_eof_hook(&mut self) -> Option<ChannelHook> {
        self.on_write_eof.take()
    }

    /// True once the local descriptor has reached EOF.
    pub fn is_read_eof(&self) -> bool {
        self.sock.as_ref().is_some_and(Sock::is_read_eof)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.sock.as_ref().is_some_and(Sock::is_dead)
    }

    pub(crate) fn mark_dead(&mut self) {
        if let Some(sock) = self.sock.as_mut() {
            sock.mark_dead();
        }
    }

    /// Detaches and returns the underlying socket. A detached sink
    /// silently discards all further data.
    pub fn detach(&mut self) -> Option<Sock> {
        self.sock.take()
    }

    /// Clones `payload` into the sink's send queue. Detached sinks
    /// discard the data without error.
    pub fn write_data(&mut self, payload: &[u8]) {
        let Some(sock) = self.sock.as_mut() else {
            return;
        };
        tracing::debug!("writing {} bytes to local sink '{}'", payload.len(), self.id as char);
        sock.queue_xmit_cloned(payload);
    }

    /// Synchronously drains the sink's send queue.
    pub fn flush(&mut self, timeout: Duration) -> io::Result<()> {
        match self.sock.as_mut() {
            Some(sock) => sock.flush(timeout),
            None => Ok(()),
        }
    }

    /// Drains what is queued and shuts down the write side. Used when
    /// the link reports EOF for the stream feeding this sink.
    pub fn write_eof(&mut self) {
        if let Some(sock) = self.sock.as_mut() {
            if let Err(err) = sock.flush(EOF_FLUSH_TIMEOUT) {
                tracing::warn!("sink '{}' flush on EOF failed: {}", self.id as char, err);
            }
            sock.shutdown_write();
        }
    }

    /// Posts a receive buffer if this channel may read, then fills `pfd`.
    ///
    /// Sinks never post (their socket is read-EOF from construction), and
    /// a plugged source stays silent until unplugged.
    pub(crate) fn fill_poll(&mut self, pfd: &mut libc::pollfd, header_size: usize) -> bool {
        let Some(sock) = self.sock.as_mut() else {
            return false;
        };
        if sock.is_dead() {
            return false;
        }
        if !self.plugged && !sock.is_read_eof() && sock.recvbuf().is_none() {
            // Reserve header room so the payload can be framed in place.
            let mut bp = Buf::new(MAX_PACKET);
            bp.reserve_head(header_size);
            sock.post_recvbuf(bp);
        }
        sock.fill_poll(pfd)
    }

    pub(crate) fn sock_doio(&mut self) -> io::Result<()> {
        match self.sock.as_mut() {
            Some(sock) => sock.doio(),
            None => Ok(()),
        }
    }

    /// Takes the receive buffer if it holds data ready to forward.
    pub(crate) fn take_forward_buf(&mut self) -> Option<Buf> {
        let sock = self.sock.as_mut()?;
        match sock.recvbuf() {
            Some(bp) if bp.count() > 0 => sock.take_recvbuf(),
            _ => None,
        }
    }

    /// Takes the read-EOF hook once the local descriptor is exhausted.
    pub(crate) fn take_read_eof_hook(&mut self) -> Option<ChannelHook> {
        if self.is_read_eof() {
            self.on_read_eof.take()
        } else {
            None
        }
    }
}
