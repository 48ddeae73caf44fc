//! Per-request transaction state machine.
//!
//! A transaction owns its sink and source channels, routes inbound
//! packets onto them, multiplexes their bytes onto the shared link, and
//! enforces the two-word terminal status protocol: exactly one major
//! status followed by exactly one minor status, after which the
//! transaction is done and late packets are dropped.
//!
//! The link socket is owned by the connection, never by a transaction;
//! every operation that touches it takes `link: &mut Sock` from the
//! caller, so a transaction cannot close or outlive the link.

use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use ducat_proto::{codec, ptype, Header, ProtoState};

use crate::channel::{Channel, Direction};
use crate::sock::Sock;

/// One-shot hook fired on a channel event (source read-EOF, sink
/// write-EOF). Consumed when it fires.
pub type ChannelHook = Box<dyn FnOnce(&mut Transaction, &mut Sock)>;

/// Type-specific behavior a transaction kind installs: a send hook run
/// once per I/O round, and a receiver for packets no sink claimed.
pub trait TxHandler {
    /// Called after channel I/O each round, with the link available for
    /// queueing packets.
    fn on_send(&mut self, _tx: &mut Transaction, _link: &mut Sock) {}

    /// Called for an inbound packet that no sink claimed.
    fn on_packet(&mut self, tx: &mut Transaction, link: &mut Sock, hdr: &Header, payload: &[u8]);
}

/// What a transaction is doing on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    /// Run a shell command.
    Command,
    /// Send a file to the remote side.
    Inject,
    /// Fetch a file from the remote side.
    Extract,
    /// Anything else, tagged with its request type byte.
    Other(u8),
}

/// Lifecycle phase, derived from the status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    /// Created, no channels attached yet.
    New,
    /// Channels attached, exchanging data.
    Live,
    /// Major status sent, minor still outstanding.
    HalfDone,
    /// Both statuses sent (or the transaction was failed out).
    Done,
}

/// The two-word terminal status: `major` is the server-side outcome,
/// `minor` the command or payload outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Server-side outcome (0 = the request could be served).
    pub major: u32,
    /// Command or payload outcome (exit code, transfer result).
    pub minor: u32,
}

/// How a client-side transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The remote side delivered its two-word status.
    Done(Status),
    /// The remote side reported a timeout for this transaction.
    TimedOut,
}

/// One multiplexed request on a link.
pub struct Transaction {
    ps: ProtoState,
    kind: TxKind,
    sinks: Vec<Channel>,
    sources: Vec<Channel>,
    major_sent: bool,
    minor_sent: bool,
    done: bool,
    handler: Option<Box<dyn TxHandler>>,
    outcome: Option<Outcome>,
}

impl Transaction {
    /// Creates a transaction for the given protocol state and kind.
    pub fn new(ps: ProtoState, kind: TxKind) -> Self {
        let tx = Self {
            ps,
            kind,
            sinks: Vec::new(),
            sources: Vec::new(),
            major_sent: false,
            minor_sent: false,
            done: false,
            handler: None,
            outcome: None,
        };
        tracing::debug!("{}: created new transaction", tx.describe());
        tx
    }

    /// The transaction id used for demultiplexing.
    pub fn xid(&self) -> u16 {
        self.ps.xid
    }

    /// The protocol state packets of this transaction are stamped with.
    pub fn ps(&self) -> ProtoState {
        self.ps
    }

    /// The request kind.
    pub fn kind(&self) -> TxKind {
        self.kind
    }

    /// True once the terminal status has been exchanged.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The recorded outcome, if a client-side handler has set one.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Consumes the transaction, yielding its outcome.
    pub fn into_outcome(self) -> Option<Outcome> {
        self.outcome
    }

    /// Records the outcome and completes the transaction.
    pub fn set_outcome(&mut self, outcome: Outcome) {
        tracing::debug!("{}: outcome {:?}", self.describe(), outcome);
        self.outcome = Some(outcome);
        self.done = true;
    }

    /// Installs the type-specific handler.
    pub fn set_handler(&mut self, handler: Box<dyn TxHandler>) {
        self.handler = Some(handler);
    }

    /// Short human-readable tag, e.g. `"command/7"`.
    pub fn describe(&self) -> String {
        let name = match self.kind {
            TxKind::Command => "command",
            TxKind::Inject => "inject",
            TxKind::Extract => "extract",
            TxKind::Other(t) => return format!("trans-type-{}/{}", t as char, self.ps.xid),
        };
        format!("{}/{}", name, self.ps.xid)
    }

    /// Derived lifecycle phase.
    pub fn phase(&self) -> TxPhase {
        if self.done {
            TxPhase::Done
        } else if self.major_sent {
            TxPhase::HalfDone
        } else if self.sinks.is_empty() && self.sources.is_empty() {
            TxPhase::New
        } else {
            TxPhase::Live
        }
    }

    /// Number of attached channels, sinks and sources together.
    pub fn num_channels(&self) -> usize {
        self.sinks.len() + self.sources.len()
    }

    /// Attaches a local sink: link payload of type `id` will be written
    /// to `fd`. The descriptor is put into non-blocking mode. The
    /// returned reference is only for configuring callbacks; ownership
    /// stays with the transaction.
    pub fn attach_local_sink(&mut self, fd: OwnedFd, id: u8) -> io::Result<&mut Channel> {
        tracing::debug!("{}: attach sink '{}'", self.describe(), id as char);
        let idx = self.sinks.len();
        self.sinks.push(Channel::new(fd, id, Direction::Sink)?);
        Ok(&mut self.sinks[idx])
    }

    /// Attaches a local source: bytes read from `fd` are forwarded as
    /// packets of type `id`.
    pub fn attach_local_source(&mut self, fd: OwnedFd, id: u8) -> io::Result<&mut Channel> {
        tracing::debug!("{}: attach source '{}'", self.describe(), id as char);
        let idx = self.sources.len();
        self.sources.push(Channel::new(fd, id, Direction::Source)?);
        Ok(&mut self.sources[idx])
    }

    /// Removes all sinks with the given id, or every sink when `id` is 0.
    pub fn close_sink(&mut self, id: u8) {
        tracing::debug!("{}: close sink '{}'", self.describe(), if id == 0 { '-' } else { id as char });
        self.sinks.retain(|ch| id != 0 && ch.id() != id);
    }

    /// Removes all sources with the given id, or every source when `id` is 0.
    pub fn close_source(&mut self, id: u8) {
        tracing::debug!("{}: close source '{}'", self.describe(), if id == 0 { '-' } else { id as char });
        self.sources.retain(|ch| id != 0 && ch.id() != id);
    }

    /// The sink mapped to `id`, if any (linear scan).
    pub fn find_sink(&mut self, id: u8) -> Option<&mut Channel> {
        self.sinks.iter_mut().find(|ch| ch.id() == id)
    }

    /// The source mapped to `id`, if any (linear scan).
    pub fn find_source(&mut self, id: u8) -> Option<&mut Channel> {
        self.sources.iter_mut().find(|ch| ch.id() == id)
    }

    /// Plugs or unplugs the source mapped to `id`.
    pub fn set_plugged(&mut self, id: u8, plugged: bool) {
        if let Some(src) = self.find_source(id) {
            src.set_plugged(plugged);
        }
    }

    /// Collects pollfd slots for every channel that has work pending.
    ///
    /// Sinks are always polled; sources only while `link_allowed` is
    /// true, i.e. the link's send queue is below its high watermark.
    pub fn fill_poll(&mut self, pfds: &mut Vec<libc::pollfd>, link_allowed: bool) -> usize {
        let hs = self.ps.header_size();
        let mut nfds = 0;

        for sink in &mut self.sinks {
            let mut pfd = crate::sock::blank_pollfd();
            if sink.fill_poll(&mut pfd, hs) {
                pfds.push(pfd);
                nfds += 1;
            }
        }

        // If the link's send queue is already bursting, refrain from
        // reading more source data until some of it has drained.
        if link_allowed {
            for source in &mut self.sources {
                let mut pfd = crate::sock::blank_pollfd();
                if source.fill_poll(&mut pfd, hs) {
                    pfds.push(pfd);
                    nfds += 1;
                }
            }
        }

        nfds
    }

    /// One I/O round over all channels: sinks first, then sources, then
    /// the send hook. Sources are purged after the hook so it can still
    /// observe a read-EOF and emit a terminating packet.
    pub fn doio(&mut self, link: &mut Sock) {
        for idx in 0..self.sinks.len() {
            self.channel_doio(Direction::Sink, idx, link);
        }
        self.sinks.retain(|ch| !ch.is_dead());

        for idx in 0..self.sources.len() {
            self.channel_doio(Direction::Source, idx, link);
        }

        self.run_send_hook(link);
        self.sources.retain(|ch| !ch.is_dead());
    }

    fn channel_doio(&mut self, dir: Direction, idx: usize, link: &mut Sock) {
        let ps = self.ps;
        let list = match dir {
            Direction::Sink => &mut self.sinks,
            Direction::Source => &mut self.sources,
        };
        let ch = &mut list[idx];
        let id = ch.id();

        if let Err(err) = ch.sock_doio() {
            let errno = err.raw_os_error().unwrap_or(libc::EIO);
            ch.mark_dead();
            tracing::debug!("{}: I/O error on channel '{}': {}", self.describe(), id as char, err);
            self.fail(link, errno as u32);
            return;
        }

        // Only source channels ever have a receive buffer posted; frame
        // whatever arrived and queue it onto the link.
        if let Some(mut bp) = ch.take_forward_buf() {
            codec::push_header(&mut bp, &ps, id);
            link.queue_xmit(bp);
        }

        if let Some(hook) = ch.take_read_eof_hook() {
            tracing::debug!("{}: EOF on channel '{}'", self.describe(), id as char);
            hook(self, link);
        }
    }

    fn run_send_hook(&mut self, link: &mut Sock) {
        if let Some(mut handler) = self.handler.take() {
            handler.on_send(self, link);
            if self.handler.is_none() {
                self.handler = Some(handler);
            }
        }
    }

    /// Routes one inbound packet.
    pub fn recv_packet(&mut self, link: &mut Sock, hdr: &Header, payload: &[u8]) {
        if self.done {
            // Coming late to the party.
            tracing::debug!("{}: dropping late packet '{}'", self.describe(), hdr.typ as char);
            return;
        }

        if let Some(sink) = self.sinks.iter_mut().find(|ch| ch.id() == hdr.typ) {
            sink.write_data(payload);
            return;
        }

        if hdr.typ == ptype::EOF {
            if let Some(idx) = self.sinks.iter().position(Channel::has_write_eof_hook) {
                tracing::debug!("{}: received EOF", self.describe());
                self.sinks[idx].write_eof();
                if let Some(hook) = self.sinks[idx].take_write_eof_hook() {
                    hook(self, link);
                }
                return;
            }
        }

        if self.handler.is_some() {
            if let Some(mut handler) = self.handler.take() {
                handler.on_packet(self, link, hdr, payload);
                if self.handler.is_none() {
                    self.handler = Some(handler);
                }
            }
            return;
        }

        tracing::warn!("{}: unexpected packet type '{}'", self.describe(), hdr.typ as char);
        self.fail(link, libc::EPROTO as u32);
    }

    fn send_client(&self, link: &mut Sock, bp: ducat_proto::Buf) {
        link.queue_xmit(bp);
    }

    /// Emits the major status. Sending it twice is a caller bug: debug
    /// builds assert, release builds log and drop the duplicate.
    pub fn send_major(&mut self, link: &mut Sock, code: u32) {
        if self.major_sent {
            debug_assert!(false, "major status sent twice");
            tracing::error!("{}: major status sent twice, dropping", self.describe());
            return;
        }
        tracing::debug!("{}: send status.major={}", self.describe(), code);
        self.send_client(link, codec::build_uint_packet(&self.ps, ptype::MAJOR, code));
        self.major_sent = true;
    }

    /// Emits the minor status. Same duplicate policy as [`send_major`](Self::send_major).
    pub fn send_minor(&mut self, link: &mut Sock, code: u32) {
        if self.minor_sent {
            debug_assert!(false, "minor status sent twice");
            tracing::error!("{}: minor status sent twice, dropping", self.describe());
            return;
        }
        tracing::debug!("{}: send status.minor={}", self.describe(), code);
        self.send_client(link, codec::build_uint_packet(&self.ps, ptype::MINOR, code));
        self.minor_sent = true;
    }

    /// Emits both status words and completes the transaction. A second
    /// call is logged and ignored, because higher layers sometimes race.
    pub fn send_status(&mut self, link: &mut Sock, st: Status) {
        if self.done {
            tracing::warn!("{}: send_status called twice", self.describe());
            return;
        }
        self.send_major(link, st.major);
        self.send_minor(link, st.minor);
        self.done = true;
    }

    /// Terminates the transaction with an errno, emitting whichever of
    /// the two status words has not been sent yet. Calling this after
    /// both were sent is a caller bug.
    pub fn fail(&mut self, link: &mut Sock, errno: u32) {
        self.done = true;
        if self.major_sent && self.minor_sent {
            debug_assert!(false, "fail() after both statuses sent");
            tracing::error!("{}: fail({}) after both statuses sent", self.describe(), errno);
            return;
        }
        if !self.major_sent {
            self.send_major(link, errno);
        }
        if !self.minor_sent {
            self.send_minor(link, errno);
        }
    }

    /// Unconditionally emits both status words and completes.
    pub fn fail2(&mut self, link: &mut Sock, major: u32, minor: u32) {
        self.send_major(link, major);
        self.send_minor(link, minor);
        self.done = true;
    }

    /// Emits a bare timeout packet and completes. Timeouts have their
    /// own packet type so the peer can tell them from protocol errors.
    pub fn send_timeout(&mut self, link: &mut Sock) {
        tracing::debug!("{}: send timeout", self.describe());
        let mut bp = codec::packet_buf(self.ps.variant, 0);
        codec::push_header(&mut bp, &self.ps, ptype::TIMEOUT);
        self.send_client(link, bp);
        self.done = true;
    }

    /// Synchronously drains every sink, so locally buffered payload is
    /// on disk (or in the pipe) before the caller moves on.
    pub fn flush_sinks(&mut self, timeout: Duration) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush(timeout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ducat_proto::{Variant, MAX_PACKET};
    use std::io::Read;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn mux_ps(xid: u16) -> ProtoState {
        ProtoState::new(Variant::Mux, xid)
    }

    fn link_pair() -> (Sock, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let link = Sock::new(OwnedFd::from(a), crate::sock::Mode::ReadWrite).unwrap();
        (link, b)
    }

    /// Reads every complete frame currently queued on the link.
    fn drain_link(link: &mut Sock, peer: &mut UnixStream, variant: Variant) -> Vec<(Header, Vec<u8>)> {
        link.flush(Duration::from_secs(5)).unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => raw.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        let mut bp = ducat_proto::Buf::new(raw.len().max(1));
        bp.append(&raw);
        let mut frames = Vec::new();
        while let Some(frame) = codec::take_frame(&mut bp, variant).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn status_is_one_major_then_one_minor() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(7), TxKind::Command);

        assert_eq!(tx.phase(), TxPhase::New);
        tx.send_major(&mut link, 0);
        assert_eq!(tx.phase(), TxPhase::HalfDone);
        assert!(!tx.is_done());

        tx.send_minor(&mut link, 0);
        tx.done = true;
        assert_eq!(tx.phase(), TxPhase::Done);

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        let types: Vec<u8> = frames.iter().map(|(h, _)| h.typ).collect();
        assert_eq!(types, vec![ptype::MAJOR, ptype::MINOR]);
        assert!(frames.iter().all(|(h, _)| h.xid == 7));
    }

    #[test]
    fn fail_emits_both_missing_statuses() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(5), TxKind::Other(b'x'));

        tx.fail(&mut link, libc::EPROTO as u32);
        assert!(tx.is_done());

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.typ, ptype::MAJOR);
        assert_eq!(frames[1].0.typ, ptype::MINOR);
        let code = codec::parse_uint(&frames[0].1).unwrap();
        assert_eq!(code, libc::EPROTO as u32);
        assert_eq!(codec::parse_uint(&frames[1].1).unwrap(), code);
    }

    #[test]
    fn fail_completes_a_half_done_transaction() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(6), TxKind::Command);

        tx.send_major(&mut link, 0);
        tx.fail(&mut link, libc::EIO as u32);
        assert!(tx.is_done());

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        let types: Vec<u8> = frames.iter().map(|(h, _)| h.typ).collect();
        assert_eq!(types, vec![ptype::MAJOR, ptype::MINOR]);
        assert_eq!(codec::parse_uint(&frames[1].1).unwrap(), libc::EIO as u32);
    }

    #[test]
    fn second_send_status_is_ignored() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(8), TxKind::Command);

        tx.send_status(&mut link, Status { major: 0, minor: 1 });
        tx.send_status(&mut link, Status { major: 9, minor: 9 });

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        assert_eq!(frames.len(), 2);
        assert_eq!(codec::parse_uint(&frames[1].1).unwrap(), 1);
    }

    #[test]
    fn timeout_packet_has_no_payload() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(9), TxKind::Command);

        tx.send_timeout(&mut link);
        assert!(tx.is_done());

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.typ, ptype::TIMEOUT);
        assert!(frames[0].1.is_empty());
    }

    #[test]
    fn packets_route_to_the_sink_with_matching_id() {
        let (mut link, _peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(3), TxKind::Command);

        let (out_r, out_w) = std::io::pipe().unwrap();
        tx.attach_local_sink(OwnedFd::from(out_w), ptype::STDOUT).unwrap();

        let hdr = Header { typ: ptype::STDOUT, len: 9, xid: 3 };
        tx.recv_packet(&mut link, &hdr, b"hi\n");
        tx.flush_sinks(Duration::from_secs(5)).unwrap();
        tx.close_sink(0);

        let mut got = String::new();
        let mut reader = out_r;
        reader.read_to_string(&mut got).unwrap();
        assert_eq!(got, "hi\n");
    }

    #[test]
    fn unroutable_packet_without_handler_fails_eproto() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(4), TxKind::Other(b'x'));

        let hdr = Header { typ: b'z', len: 6, xid: 4 };
        tx.recv_packet(&mut link, &hdr, b"");
        assert!(tx.is_done());

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        assert_eq!(codec::parse_uint(&frames[0].1).unwrap(), libc::EPROTO as u32);
    }

    #[test]
    fn late_packets_are_dropped_silently() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(2), TxKind::Command);
        tx.send_status(&mut link, Status { major: 0, minor: 0 });
        drain_link(&mut link, &mut peer, Variant::Mux);

        let hdr = Header { typ: ptype::STDOUT, len: 10, xid: 2 };
        tx.recv_packet(&mut link, &hdr, b"late");

        assert!(drain_link(&mut link, &mut peer, Variant::Mux).is_empty());
    }

    #[test]
    fn eof_packet_fires_the_sink_hook_once() {
        let (mut link, _peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(1), TxKind::Extract);

        let (_r, w) = std::io::pipe().unwrap();
        let sink = tx.attach_local_sink(OwnedFd::from(w), ptype::DATA).unwrap();
        sink.set_on_write_eof(Box::new(|tx, _link| {
            tx.set_outcome(Outcome::Done(Status { major: 0, minor: 0 }));
        }));

        let hdr = Header { typ: ptype::EOF, len: 6, xid: 1 };
        tx.recv_packet(&mut link, &hdr, b"");
        assert_eq!(tx.outcome(), Some(Outcome::Done(Status { major: 0, minor: 0 })));
    }

    #[test]
    fn sources_are_not_polled_over_the_watermark() {
        let (mut link, _peer) = link_pair();
        link.set_high_water(64);
        let mut tx = Transaction::new(mux_ps(11), TxKind::Inject);

        let (r, w) = std::io::pipe().unwrap();
        std::io::Write::write_all(&mut (&w), b"file data").unwrap();
        tx.attach_local_source(OwnedFd::from(r), ptype::DATA).unwrap();

        let mut pfds = Vec::new();
        assert_eq!(tx.fill_poll(&mut pfds, link.xmit_queue_allowed()), 1);

        // Push the link over its watermark; sources must fall silent.
        link.queue_xmit(ducat_proto::Buf::from_slice(&[0u8; 128]));
        assert!(!link.xmit_queue_allowed());
        pfds.clear();
        assert_eq!(tx.fill_poll(&mut pfds, link.xmit_queue_allowed()), 0);
        assert!(pfds.is_empty());
    }

    #[test]
    fn source_chunks_are_framed_onto_the_link() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(12), TxKind::Inject);

        let (r, w) = std::io::pipe().unwrap();
        std::io::Write::write_all(&mut (&w), b"hello").unwrap();
        drop(w);
        tx.attach_local_source(OwnedFd::from(r), ptype::DATA).unwrap();

        let mut pfds = Vec::new();
        tx.fill_poll(&mut pfds, true);
        tx.doio(&mut link);

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.typ, ptype::DATA);
        assert_eq!(frames[0].0.xid, 12);
        assert_eq!(frames[0].1, b"hello");
    }

    #[test]
    fn source_eof_hook_fires_exactly_once() {
        let (mut link, mut peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(13), TxKind::Command);

        let (r, w) = std::io::pipe().unwrap();
        drop(w);
        let src = tx.attach_local_source(OwnedFd::from(r), ptype::STDIN).unwrap();
        src.set_on_read_eof(Box::new(|tx, link| {
            let ps = tx.ps();
            let mut bp = codec::packet_buf(ps.variant, 0);
            codec::push_header(&mut bp, &ps, ptype::EOF);
            link.queue_xmit(bp);
        }));

        let mut pfds = Vec::new();
        tx.fill_poll(&mut pfds, true);
        tx.doio(&mut link);
        tx.doio(&mut link);

        let frames = drain_link(&mut link, &mut peer, Variant::Mux);
        let eofs = frames.iter().filter(|(h, _)| h.typ == ptype::EOF).count();
        assert_eq!(eofs, 1);
    }

    #[test]
    fn source_buffer_reserves_header_room() {
        let (_link, _peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(14), TxKind::Inject);

        let (r, w) = std::io::pipe().unwrap();
        std::io::Write::write_all(&mut (&w), &[9u8; 100]).unwrap();
        tx.attach_local_source(OwnedFd::from(r), ptype::DATA).unwrap();

        let mut pfds = Vec::new();
        tx.fill_poll(&mut pfds, true);
        let src = tx.find_source(ptype::DATA).unwrap();
        src.sock_doio().unwrap();
        let bp = src.take_forward_buf().unwrap();
        // A full buffer plus its header must still fit in one packet.
        assert!(bp.count() + Variant::Mux.header_size() <= MAX_PACKET);
    }

    #[test]
    fn close_sink_removes_by_id() {
        let (_link, _peer) = link_pair();
        let mut tx = Transaction::new(mux_ps(15), TxKind::Command);

        let (_r1, w1) = std::io::pipe().unwrap();
        let (_r2, w2) = std::io::pipe().unwrap();
        tx.attach_local_sink(OwnedFd::from(w1), ptype::STDOUT).unwrap();
        tx.attach_local_sink(OwnedFd::from(w2), ptype::STDERR).unwrap();
        assert_eq!(tx.num_channels(), 2);

        tx.close_sink(ptype::STDOUT);
        assert_eq!(tx.num_channels(), 1);
        assert!(tx.find_sink(ptype::STDOUT).is_none());
        assert!(tx.find_sink(ptype::STDERR).is_some());

        tx.close_sink(0);
        assert_eq!(tx.num_channels(), 0);
    }
}
