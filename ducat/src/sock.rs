//! Non-blocking descriptor wrapper with a single posted receive buffer
//! and a FIFO send queue.
//!
//! A [`Sock`] owns its descriptor and performs all I/O non-blocking;
//! `EAGAIN`/`EINTR` are normal flow. Reads fill the one posted receive
//! buffer incrementally across [`doio`](Sock::doio) calls; writes drain
//! the send queue in FIFO order. A fatal errno marks the operation
//! failed and is kept for the caller, who must [`mark_dead`](Sock::mark_dead).

#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use ducat_proto::Buf;

/// Send-queue high watermark. Once this many bytes are queued, producers
/// feeding the socket should pause until the queue drains.
pub const XMIT_HIGH_WATER: usize = 64 * 1024;

/// Access mode of the wrapped descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read side only; the send queue is never used.
    ReadOnly,
    /// Write side only; read-EOF is set at construction so a receive
    /// buffer is never posted.
    WriteOnly,
    /// Both directions (the usual state of a link socket).
    ReadWrite,
}

/// A non-blocking descriptor with buffered, queued I/O.
#[derive(Debug)]
pub struct Sock {
    fd: OwnedFd,
    recvbuf: Option<Buf>,
    xmit_queue: VecDeque<Buf>,
    high_water: usize,
    read_eof: bool,
    write_eof: bool,
    dead: bool,
    last_errno: Option<i32>,
}

impl Sock {
    /// Takes ownership of `fd` and puts it into non-blocking mode.
    pub fn new(fd: OwnedFd, mode: Mode) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd,
            recvbuf: None,
            xmit_queue: VecDeque::new(),
            high_water: XMIT_HIGH_WATER,
            read_eof: matches!(mode, Mode::WriteOnly),
            write_eof: matches!(mode, Mode::ReadOnly),
            dead: false,
            last_errno: None,
        })
    }

    /// Overrides the send-queue high watermark.
    pub fn set_high_water(&mut self, bytes: usize) {
        self.high_water = bytes;
    }

    /// The raw descriptor, for poll bookkeeping.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Posts the receive buffer. At most one may be posted at a time.
    pub fn post_recvbuf(&mut self, bp: Buf) {
        debug_assert!(self.recvbuf.is_none(), "receive buffer already posted");
        self.recvbuf = Some(bp);
    }

    /// The posted receive buffer, if any.
    pub fn recvbuf(&self) -> Option<&Buf> {
        self.recvbuf.as_ref()
    }

    /// Mutable access to the posted receive buffer, for in-place parsing.
    pub fn recvbuf_mut(&mut self) -> Option<&mut Buf> {
        self.recvbuf.as_mut()
    }

    /// Removes and returns the posted receive buffer.
    pub fn take_recvbuf(&mut self) -> Option<Buf> {
        self.recvbuf.take()
    }

    /// Appends an owned buffer to the send queue. Empty buffers and
    /// writes to a dead or write-shutdown socket are discarded.
    pub fn queue_xmit(&mut self, bp: Buf) {
        if bp.count() == 0 || self.dead || self.write_eof {
            return;
        }
        self.xmit_queue.push_back(bp);
    }

    /// Clones a transient payload into the send queue.
    pub fn queue_xmit_cloned(&mut self, payload: &[u8]) {
        if !payload.is_empty() {
            self.queue_xmit(Buf::from_slice(payload));
        }
    }

    /// Total bytes waiting in the send queue.
    pub fn xmit_queue_bytes(&self) -> usize {
        self.xmit_queue.iter().map(Buf::count).sum()
    }

    /// True while the send queue is below the high watermark.
    pub fn xmit_queue_allowed(&self) -> bool {
        self.xmit_queue_bytes() < self.high_water
    }

    /// True when nothing is waiting to be sent.
    pub fn xmit_queue_empty(&self) -> bool {
        self.xmit_queue.is_empty()
    }

    /// Fills `pfd` with the events this socket currently cares about.
    /// Returns false (slot unused) when there is nothing to wait for.
    pub fn fill_poll(&self, pfd: &mut libc::pollfd) -> bool {
        let mut events: libc::c_short = 0;
        if !self.dead {
            if self.recvbuf.is_some() && !self.read_eof {
                events |= libc::POLLIN;
            }
            if !self.xmit_queue.is_empty() && !self.write_eof {
                events |= libc::POLLOUT;
            }
        }
        if events == 0 {
            return false;
        }
        pfd.fd = self.fd.as_raw_fd();
        pfd.events = events;
        pfd.revents = 0;
        true
    }

    /// One round of non-blocking I/O: a single read into the posted
    /// receive buffer plus a drain pass over the send queue.
    ///
    /// On a fatal error the errno is recorded and returned; the caller
    /// must [`mark_dead`](Sock::mark_dead) the socket.
    pub fn doio(&mut self) -> io::Result<()> {
        if self.dead {
            return Ok(());
        }
        self.recv_once()?;
        self.send_queued()?;
        Ok(())
    }

    fn recv_once(&mut self) -> io::Result<()> {
        if self.read_eof {
            return Ok(());
        }
        let fd = self.fd.as_raw_fd();
        let Some(bp) = self.recvbuf.as_mut() else {
            return Ok(());
        };
        let room = bp.tail_slice_mut();
        if room.is_empty() {
            return Ok(());
        }
        // SAFETY: room is a valid writable region of the posted receive
        // buffer and fd is owned by this Sock.
        let n = unsafe { libc::read(fd, room.as_mut_ptr().cast(), room.len()) };
        if n > 0 {
            bp.advance_tail(n as usize);
            tracing::trace!("fd {}: received {} bytes", fd, n);
        } else if n == 0 {
            tracing::debug!("fd {}: EOF on read", fd);
            self.read_eof = true;
        } else {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock && err.kind() != io::ErrorKind::Interrupted {
                self.last_errno = err.raw_os_error();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Writes queued buffers until the queue is empty or the descriptor
    /// would block. Returns the number of bytes written.
    pub fn send_queued(&mut self) -> io::Result<usize> {
        let fd = self.fd.as_raw_fd();
        let mut total = 0;
        while let Some(bp) = self.xmit_queue.front_mut() {
            if bp.count() == 0 {
                self.xmit_queue.pop_front();
                continue;
            }
            let data = bp.head_slice();
            // SAFETY: data points into the queued buffer and fd is owned
            // by this Sock.
            let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.last_errno = err.raw_os_error();
                return Err(err);
            }
            bp.consume(n as usize);
            total += n as usize;
            if bp.count() == 0 {
                self.xmit_queue.pop_front();
            }
        }
        if total > 0 {
            tracing::trace!("fd {}: sent {} bytes", fd, total);
        }
        Ok(total)
    }

    /// Synchronously drains the send queue, waiting for writability with
    /// `poll` between passes. Fails with `TimedOut` once `timeout` has
    /// elapsed with data still queued.
    pub fn flush(&mut self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.xmit_queue.is_empty() {
            self.send_queued()?;
            if self.xmit_queue.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !poll_single(self.raw_fd(), libc::POLLOUT, remaining)? {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "send queue did not drain",
                ));
            }
        }
        Ok(())
    }

    /// Shuts down the write side. Pending queued data is given one last
    /// non-blocking drain pass; `ENOTSOCK` from pipes and files is fine.
    pub fn shutdown_write(&mut self) {
        let _ = self.send_queued();
        self.write_eof = true;
        // SAFETY: fd is owned by this Sock.
        unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) };
    }

    /// Marks the socket unusable. All further I/O becomes a no-op.
    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// True once the socket has been marked dead.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// True once the read side has seen EOF.
    pub fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    /// True once the write side has been shut down.
    pub fn is_write_eof(&self) -> bool {
        self.write_eof
    }

    /// The errno of the last fatal I/O error, if any.
    pub fn last_errno(&self) -> Option<i32> {
        self.last_errno
    }
}

/// An unused pollfd slot.
pub(crate) fn blank_pollfd() -> libc::pollfd {
    libc::pollfd {
        fd: -1,
        events: 0,
        revents: 0,
    }
}

/// Polls a single descriptor for `events`, bounded by `timeout`.
/// Returns whether the descriptor became ready.
pub(crate) fn poll_single(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        // SAFETY: pfd is a valid pollfd struct and the timeout bounds the wait.
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned, open descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn sock_pair() -> (Sock, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let sock = Sock::new(OwnedFd::from(a), Mode::ReadWrite).unwrap();
        (sock, b)
    }

    #[test]
    fn queued_buffers_drain_in_fifo_order() {
        let (mut sock, mut peer) = sock_pair();
        sock.queue_xmit(Buf::from_slice(b"first "));
        sock.queue_xmit(Buf::from_slice(b"second"));
        assert_eq!(sock.xmit_queue_bytes(), 12);

        sock.doio().unwrap();
        assert!(sock.xmit_queue_empty());

        let mut got = [0u8; 12];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"first second");
    }

    #[test]
    fn read_fills_posted_buffer_and_detects_eof() {
        let (mut sock, mut peer) = sock_pair();
        sock.post_recvbuf(Buf::new(64));

        peer.write_all(b"ping").unwrap();
        sock.doio().unwrap();
        assert_eq!(sock.recvbuf().unwrap().head_slice(), b"ping");
        assert!(!sock.is_read_eof());

        drop(peer);
        sock.doio().unwrap();
        assert!(sock.is_read_eof());
    }

    #[test]
    fn write_only_socket_starts_at_read_eof() {
        let (a, _b) = UnixStream::pair().unwrap();
        let sock = Sock::new(OwnedFd::from(a), Mode::WriteOnly).unwrap();
        assert!(sock.is_read_eof());

        let mut pfd = blank_pollfd();
        assert!(!sock.fill_poll(&mut pfd));
    }

    #[test]
    fn high_watermark_gates_the_queue() {
        let (mut sock, _peer) = sock_pair();
        sock.set_high_water(16);
        assert!(sock.xmit_queue_allowed());

        sock.queue_xmit(Buf::from_slice(&[0u8; 16]));
        assert!(!sock.xmit_queue_allowed());
    }

    #[test]
    fn fill_poll_reflects_pending_work() {
        let (mut sock, _peer) = sock_pair();
        let mut pfd = blank_pollfd();
        assert!(!sock.fill_poll(&mut pfd));

        sock.post_recvbuf(Buf::new(16));
        assert!(sock.fill_poll(&mut pfd));
        assert_eq!(pfd.events, libc::POLLIN);

        sock.queue_xmit(Buf::from_slice(b"x"));
        assert!(sock.fill_poll(&mut pfd));
        assert_eq!(pfd.events, libc::POLLIN | libc::POLLOUT);
    }

    #[test]
    fn dead_socket_refuses_io_and_poll() {
        let (mut sock, _peer) = sock_pair();
        sock.queue_xmit(Buf::from_slice(b"x"));
        sock.mark_dead();

        let mut pfd = blank_pollfd();
        assert!(!sock.fill_poll(&mut pfd));
        sock.doio().unwrap();
        assert_eq!(sock.xmit_queue_bytes(), 1);
    }

    #[test]
    fn flush_drains_synchronously() {
        let (mut sock, mut peer) = sock_pair();
        sock.queue_xmit(Buf::from_slice(&vec![7u8; 4096]));
        sock.flush(Duration::from_secs(5)).unwrap();
        assert!(sock.xmit_queue_empty());

        let mut got = vec![0u8; 4096];
        peer.read_exact(&mut got).unwrap();
        assert!(got.iter().all(|&b| b == 7));
    }

    #[test]
    fn queue_after_shutdown_write_is_discarded() {
        let (mut sock, _peer) = sock_pair();
        sock.shutdown_write();
        sock.queue_xmit(Buf::from_slice(b"late"));
        assert!(sock.xmit_queue_empty());
    }
}
