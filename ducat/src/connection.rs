//! The connection: owns the link and drives every live transaction from
//! one poll loop.
//!
//! Each tick aggregates pollable descriptors from the link and all
//! transaction channels, blocks in a single `poll`, performs
//! non-blocking I/O everywhere, demultiplexes inbound frames by xid, and
//! drops completed transactions once their final packets have left the
//! process. All scheduling is cooperative and single-threaded; the only
//! blocking primitive is the `poll` at the top of the tick.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use ducat_proto::{codec, ptype, Buf, ProtoState, Variant, MAX_PACKET};

use crate::client::{self, CommandReq, ExtractReq, InjectReq};
use crate::error::{Error, Result};
use crate::sock::{blank_pollfd, Mode, Sock};
use crate::transaction::{Outcome, Transaction};

/// How long one tick blocks in `poll` at most; the run loop re-checks
/// its inactivity deadline at this granularity.
const TICK_SLICE: Duration = Duration::from_millis(100);

/// Link-level options.
#[derive(Debug, Clone)]
pub struct LinkOpts {
    variant: Variant,
    timeout: Duration,
    high_water: Option<usize>,
}

impl LinkOpts {
    /// Options for a link with the given header variant.
    #[must_use]
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            timeout: Duration::from_secs(60),
            high_water: None,
        }
    }

    /// Inactivity timeout: how long the link may stay completely silent
    /// while a transaction is being driven to completion.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the link send-queue high watermark.
    #[must_use]
    pub fn high_water(mut self, bytes: usize) -> Self {
        self.high_water = Some(bytes);
        self
    }
}

impl Default for LinkOpts {
    fn default() -> Self {
        Self::new(Variant::Mux)
    }
}

/// One multiplexed link to a remote test server and the transactions
/// riding on it.
pub struct Connection {
    link: Sock,
    opts: LinkOpts,
    next_xid: u16,
    transactions: Vec<Transaction>,
}

impl Connection {
    /// Wraps an open link descriptor with default (multiplexed) options.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        Self::with_opts(fd, LinkOpts::default())
    }

    /// Wraps an open link descriptor.
    pub fn with_opts(fd: OwnedFd, opts: LinkOpts) -> io::Result<Self> {
        let mut link = Sock::new(fd, Mode::ReadWrite)?;
        if let Some(bytes) = opts.high_water {
            link.set_high_water(bytes);
        }
        Ok(Self {
            link,
            opts,
            next_xid: 1,
            transactions: Vec::new(),
        })
    }

    /// Header variant of this link.
    pub fn variant(&self) -> Variant {
        self.opts.variant
    }

    /// Number of live transactions.
    pub fn num_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn alloc_xid(&mut self) -> u16 {
        match self.opts.variant {
            Variant::Plain => 0,
            Variant::Mux => {
                let xid = self.next_xid;
                self.next_xid = self.next_xid.wrapping_add(1);
                if self.next_xid == 0 {
                    self.next_xid = 1;
                }
                xid
            }
        }
    }

    fn new_ps(&mut self) -> Result<ProtoState> {
        if self.link.is_dead() {
            return Err(Error::LinkDead);
        }
        if matches!(self.opts.variant, Variant::Plain) && !self.transactions.is_empty() {
            return Err(Error::Parameter("plain link carries one transaction at a time"));
        }
        Ok(ProtoState::new(self.opts.variant, self.alloc_xid()))
    }

    fn submit(&mut self, tx: Transaction, request: Buf) -> u16 {
        let xid = tx.xid();
        tracing::debug!("{}: submitting request", tx.describe());
        self.link.queue_xmit(request);
        self.transactions.push(tx);
        xid
    }

    /// Starts a command transaction; returns its xid.
    pub fn command(&mut self, req: CommandReq) -> Result<u16> {
        let ps = self.new_ps()?;
        let (tx, request) = client::command_transaction(ps, req)?;
        Ok(self.submit(tx, request))
    }

    /// Starts an inject transaction; returns its xid.
    pub fn inject(&mut self, req: InjectReq) -> Result<u16> {
        let ps = self.new_ps()?;
        let (tx, request) = client::inject_transaction(ps, req)?;
        Ok(self.submit(tx, request))
    }

    /// Starts an extract transaction; returns its xid.
    pub fn extract(&mut self, req: ExtractReq) -> Result<u16> {
        let ps = self.new_ps()?;
        let (tx, request) = client::extract_transaction(ps, req)?;
        Ok(self.submit(tx, request))
    }

    /// Sends an interrupt packet for whatever the server is running.
    pub fn interrupt(&mut self) -> Result<()> {
        self.fire_and_forget(ptype::INTERRUPT)
    }

    /// Asks the remote test server to exit.
    pub fn quit(&mut self) -> Result<()> {
        self.fire_and_forget(ptype::QUIT)
    }

    fn fire_and_forget(&mut self, typ: u8) -> Result<()> {
        if self.link.is_dead() {
            return Err(Error::LinkDead);
        }
        let ps = ProtoState::new(self.opts.variant, self.alloc_xid());
        let mut bp = codec::packet_buf(ps.variant, 0);
        codec::push_header(&mut bp, &ps, typ);
        self.link.queue_xmit(bp);
        self.link.flush(self.opts.timeout)?;
        Ok(())
    }

    /// One scheduler round. Returns whether any descriptor was ready.
    pub fn tick(&mut self, timeout: Duration) -> Result<bool> {
        if self.link.is_dead() {
            return Err(Error::LinkDead);
        }

        // Keep a receive buffer posted on the link at all times.
        if self.link.recvbuf().is_none() && !self.link.is_read_eof() {
            self.link.post_recvbuf(Buf::new(MAX_PACKET));
        }

        let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.transactions.len());
        let mut link_pfd = blank_pollfd();
        if self.link.fill_poll(&mut link_pfd) {
            pfds.push(link_pfd);
        }
        let link_allowed = self.link.xmit_queue_allowed();
        for tx in &mut self.transactions {
            tx.fill_poll(&mut pfds, link_allowed);
        }

        let ready = poll_all(&mut pfds, timeout)?;

        // Link I/O first, so freshly arrived frames are routed this round.
        if let Err(err) = self.link.doio() {
            tracing::error!("link I/O error: {}", err);
            self.teardown();
            return Err(Error::LinkDead);
        }

        {
            let Self {
                link, transactions, ..
            } = self;
            for tx in transactions.iter_mut() {
                tx.doio(link);
            }
        }

        self.dispatch_inbound()?;

        if self.link.is_read_eof() && self.transactions.iter().any(|tx| !tx.is_done()) {
            tracing::error!("link closed by peer with transactions outstanding");
            self.teardown();
            return Err(Error::LinkDead);
        }

        // Completed transactions linger until the link queue has drained
        // their final packets; outcomes are claimed by `run`.
        if self.link.xmit_queue_empty() {
            self.transactions
                .retain(|tx| !(tx.is_done() && tx.outcome().is_none()));
        }

        Ok(ready > 0)
    }

    /// Drives the link until the transaction completes, then returns its
    /// outcome. Local sink data is flushed before returning. A link that
    /// stays silent longer than the configured timeout fails with
    /// [`Error::Timeout`].
    pub fn run(&mut self, xid: u16) -> Result<Outcome> {
        let mut last_activity = Instant::now();
        loop {
            if let Some(pos) = self.transactions.iter().position(|tx| tx.xid() == xid) {
                if self.transactions[pos].is_done() {
                    self.link.flush(self.opts.timeout)?;
                    let mut tx = self.transactions.remove(pos);
                    tx.flush_sinks(self.opts.timeout)?;
                    tracing::debug!("{}: complete", tx.describe());
                    return match tx.into_outcome() {
                        Some(outcome) => Ok(outcome),
                        None => Err(Error::Protocol("transaction aborted".into())),
                    };
                }
            } else {
                return Err(Error::Protocol("transaction aborted".into()));
            }

            if self.tick(TICK_SLICE)? {
                last_activity = Instant::now();
            } else if last_activity.elapsed() >= self.opts.timeout {
                return Err(Error::Timeout);
            }
        }
    }

    /// Extracts complete frames from the link receive buffer and routes
    /// them to their transactions.
    fn dispatch_inbound(&mut self) -> Result<()> {
        let Some(mut rb) = self.link.take_recvbuf() else {
            return Ok(());
        };
        loop {
            match codec::take_frame(&mut rb, self.opts.variant) {
                Ok(Some((hdr, payload))) => {
                    let Self {
                        link, transactions, ..
                    } = self;
                    match transactions.iter_mut().find(|tx| tx.xid() == hdr.xid) {
                        Some(tx) => tx.recv_packet(link, &hdr, &payload),
                        None => tracing::debug!(
                            "no transaction for xid {} (type '{}'), dropping",
                            hdr.xid,
                            hdr.typ as char
                        ),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!("malformed frame on link: {}", err);
                    self.teardown();
                    return Err(err.into());
                }
            }
        }
        rb.compact();
        if self.link.is_read_eof() && !rb.is_empty() {
            tracing::warn!("link closed mid-frame, discarding {} bytes", rb.count());
        } else if !self.link.is_read_eof() {
            self.link.post_recvbuf(rb);
        }
        Ok(())
    }

    /// Kills the link and terminates every transaction riding on it.
    fn teardown(&mut self) {
        self.link.mark_dead();
        let Self {
            link, transactions, ..
        } = self;
        for tx in transactions.iter_mut() {
            if !tx.is_done() {
                tx.fail(link, libc::ECANCELED as u32);
            }
        }
        transactions.clear();
    }
}

/// Polls the collected descriptors, retrying on `EINTR`.
fn poll_all(pfds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        // SAFETY: pfds is a valid array of initialized pollfd structs; a
        // zero-length array is permitted and only observes the timeout.
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc as usize);
    }
}
