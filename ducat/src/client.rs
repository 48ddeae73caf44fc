//! Client-side transaction kinds: command, inject, extract.
//!
//! Each kind builds its request packet and wires up a [`TxHandler`] that
//! drives the client half of the exchange: collecting the two-word
//! status, unplugging the inject source once the server is ready, and
//! closing the extract sink on stream EOF.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;

use ducat_proto::{codec, ptype, Buf, Header, ProtoState};

use crate::error::{Error, Result};
use crate::sock::Sock;
use crate::transaction::{Outcome, Status, Transaction, TxHandler, TxKind};

/// The wire protocol restricts usernames to `[0-9A-Za-z_]+`.
fn valid_username(user: &str) -> bool {
    !user.is_empty() && user.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Builds a request packet whose payload is `text` plus the terminating
/// NUL the wire format requires.
fn request_packet(ps: &ProtoState, typ: u8, text: &str) -> Result<Buf> {
    let mut payload = Vec::with_capacity(text.len() + 1);
    payload.extend_from_slice(text.as_bytes());
    payload.push(0);
    Ok(codec::build_packet(ps, typ, &payload)?)
}

/// Queues an EOF packet for the transaction's stream. Installed as the
/// read-EOF hook on stdin and file sources.
fn send_eof(tx: &mut Transaction, link: &mut Sock) {
    let ps = tx.ps();
    let mut bp = codec::packet_buf(ps.variant, 0);
    codec::push_header(&mut bp, &ps, ptype::EOF);
    link.queue_xmit(bp);
}

/// A shell command to run on the remote side.
#[derive(Debug)]
pub struct CommandReq {
    user: String,
    command: String,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl CommandReq {
    /// Creates a command request for the given user and shell command.
    #[must_use]
    pub fn new(user: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            command: command.into(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Feeds the command's stdin from this descriptor; EOF on it is
    /// forwarded to the remote side.
    #[must_use]
    pub fn stdin(mut self, fd: OwnedFd) -> Self {
        self.stdin = Some(fd);
        self
    }

    /// Writes the command's stdout stream to this descriptor.
    #[must_use]
    pub fn stdout(mut self, fd: OwnedFd) -> Self {
        self.stdout = Some(fd);
        self
    }

    /// Writes the command's stderr stream to this descriptor.
    #[must_use]
    pub fn stderr(mut self, fd: OwnedFd) -> Self {
        self.stderr = Some(fd);
        self
    }
}

/// A file to send to the remote side.
#[derive(Debug)]
pub struct InjectReq {
    user: String,
    remote_path: String,
    file: OwnedFd,
    size: u64,
}

impl InjectReq {
    /// Creates an inject request from an already-open descriptor.
    #[must_use]
    pub fn new(
        user: impl Into<String>,
        remote_path: impl Into<String>,
        file: OwnedFd,
        size: u64,
    ) -> Self {
        Self {
            user: user.into(),
            remote_path: remote_path.into(),
            file,
            size,
        }
    }

    /// Opens a local file and sizes it for transfer.
    pub fn from_file(
        user: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let file = File::open(local_path)?;
        let size = file.metadata()?.len();
        Ok(Self::new(user, remote_path, OwnedFd::from(file), size))
    }
}

/// A file to fetch from the remote side.
#[derive(Debug)]
pub struct ExtractReq {
    user: String,
    remote_path: String,
    file: OwnedFd,
}

impl ExtractReq {
    /// Creates an extract request writing into an already-open descriptor.
    #[must_use]
    pub fn new(user: impl Into<String>, remote_path: impl Into<String>, file: OwnedFd) -> Self {
        Self {
            user: user.into(),
            remote_path: remote_path.into(),
            file,
        }
    }

    /// Creates the local destination file (mode `rw-rw----`).
    pub fn create_file(
        user: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o660)
            .open(local_path)?;
        Ok(Self::new(user, remote_path, OwnedFd::from(file)))
    }
}

/// Collects the `M`/`m` status pair for a command transaction.
struct CommandHandler {
    major: Option<u32>,
}

impl TxHandler for CommandHandler {
    fn on_packet(&mut self, tx: &mut Transaction, link: &mut Sock, hdr: &Header, payload: &[u8]) {
        match hdr.typ {
            ptype::MAJOR if self.major.is_none() => match codec::parse_uint(payload) {
                Ok(code) => self.major = Some(code),
                Err(_) => proto_fail(tx, link, hdr),
            },
            ptype::MINOR => {
                let Some(major) = self.major else {
                    proto_fail(tx, link, hdr);
                    return;
                };
                match codec::parse_uint(payload) {
                    Ok(minor) => tx.set_outcome(Outcome::Done(Status { major, minor })),
                    Err(_) => proto_fail(tx, link, hdr),
                }
            }
            ptype::TIMEOUT => tx.set_outcome(Outcome::TimedOut),
            _ => proto_fail(tx, link, hdr),
        }
    }
}

/// Drives the client half of an inject: the file source stays plugged
/// until the server acknowledges with `major == 0`.
struct InjectHandler {
    major: Option<u32>,
}

impl TxHandler for InjectHandler {
    fn on_packet(&mut self, tx: &mut Transaction, link: &mut Sock, hdr: &Header, payload: &[u8]) {
        match hdr.typ {
            ptype::MAJOR if self.major.is_none() => match codec::parse_uint(payload) {
                Ok(0) => {
                    self.major = Some(0);
                    tracing::debug!("{}: server ready, unplugging source", tx.describe());
                    tx.set_plugged(ptype::DATA, false);
                }
                Ok(code) => {
                    // The destination could not be opened; nothing to send.
                    self.major = Some(code);
                    tx.close_source(0);
                    tx.set_outcome(Outcome::Done(Status { major: code, minor: 0 }));
                }
                Err(_) => proto_fail(tx, link, hdr),
            },
            ptype::MINOR => {
                let Some(major) = self.major else {
                    proto_fail(tx, link, hdr);
                    return;
                };
                match codec::parse_uint(payload) {
                    Ok(minor) => tx.set_outcome(Outcome::Done(Status { major, minor })),
                    Err(_) => proto_fail(tx, link, hdr),
                }
            }
            ptype::TIMEOUT => tx.set_outcome(Outcome::TimedOut),
            _ => proto_fail(tx, link, hdr),
        }
    }
}

/// Drives the client half of an extract: size reply, data stream into
/// the sink, then the status pair.
struct ExtractHandler {
    major: Option<u32>,
    size: Option<u32>,
}

impl TxHandler for ExtractHandler {
    fn on_packet(&mut self, tx: &mut Transaction, link: &mut Sock, hdr: &Header, payload: &[u8]) {
        match hdr.typ {
            ptype::SIZE if self.size.is_none() => match codec::parse_uint(payload) {
                Ok(size) => {
                    tracing::debug!("{}: remote file is {} bytes", tx.describe(), size);
                    self.size = Some(size);
                }
                Err(_) => proto_fail(tx, link, hdr),
            },
            ptype::MAJOR if self.major.is_none() => match codec::parse_uint(payload) {
                Ok(0) => self.major = Some(0),
                Ok(code) => {
                    // The remote file was not readable; no data follows.
                    self.major = Some(code);
                    tx.close_sink(0);
                    tx.set_outcome(Outcome::Done(Status { major: code, minor: 0 }));
                }
                Err(_) => proto_fail(tx, link, hdr),
            },
            ptype::MINOR => {
                let Some(major) = self.major else {
                    proto_fail(tx, link, hdr);
                    return;
                };
                match codec::parse_uint(payload) {
                    Ok(minor) => tx.set_outcome(Outcome::Done(Status { major, minor })),
                    Err(_) => proto_fail(tx, link, hdr),
                }
            }
            ptype::TIMEOUT => tx.set_outcome(Outcome::TimedOut),
            _ => proto_fail(tx, link, hdr),
        }
    }
}

fn proto_fail(tx: &mut Transaction, link: &mut Sock, hdr: &Header) {
    tracing::warn!("{}: unexpected packet type '{}'", tx.describe(), hdr.typ as char);
    tx.fail(link, libc::EPROTO as u32);
}

/// Assembles a command transaction and its request packet.
pub(crate) fn command_transaction(ps: ProtoState, req: CommandReq) -> Result<(Transaction, Buf)> {
    if !valid_username(&req.user) {
        return Err(Error::Parameter("invalid username"));
    }
    if req.command.is_empty() {
        return Err(Error::Parameter("empty command"));
    }

    let mut tx = Transaction::new(ps, TxKind::Command);
    if let Some(fd) = req.stdout {
        tx.attach_local_sink(fd, ptype::STDOUT)?;
    }
    if let Some(fd) = req.stderr {
        tx.attach_local_sink(fd, ptype::STDERR)?;
    }
    if let Some(fd) = req.stdin {
        let src = tx.attach_local_source(fd, ptype::STDIN)?;
        src.set_on_read_eof(Box::new(send_eof));
    }
    tx.set_handler(Box::new(CommandHandler { major: None }));

    let text = format!("{} {}", req.user, req.command);
    let bp = request_packet(&ps, ptype::COMMAND, &text)?;
    Ok((tx, bp))
}

/// Assembles an inject transaction and its request packet. The file
/// source starts plugged; data flows only after the server's go-ahead.
pub(crate) fn inject_transaction(ps: ProtoState, req: InjectReq) -> Result<(Transaction, Buf)> {
    if !valid_username(&req.user) {
        return Err(Error::Parameter("invalid username"));
    }

    let mut tx = Transaction::new(ps, TxKind::Inject);
    let src = tx.attach_local_source(req.file, ptype::DATA)?;
    src.set_plugged(true);
    src.set_on_read_eof(Box::new(send_eof));
    tx.set_handler(Box::new(InjectHandler { major: None }));

    let text = format!("{} {} {}", req.user, req.size, req.remote_path);
    let bp = request_packet(&ps, ptype::INJECT, &text)?;
    Ok((tx, bp))
}

/// Assembles an extract transaction and its request packet.
pub(crate) fn extract_transaction(ps: ProtoState, req: ExtractReq) -> Result<(Transaction, Buf)> {
    if !valid_username(&req.user) {
        return Err(Error::Parameter("invalid username"));
    }

    let mut tx = Transaction::new(ps, TxKind::Extract);
    let sink = tx.attach_local_sink(req.file, ptype::DATA)?;
    sink.set_on_write_eof(Box::new(|tx, _link| {
        tracing::debug!("{}: file data complete", tx.describe());
    }));
    tx.set_handler(Box::new(ExtractHandler {
        major: None,
        size: None,
    }));

    let text = format!("{} {}", req.user, req.remote_path);
    let bp = request_packet(&ps, ptype::EXTRACT, &text)?;
    Ok((tx, bp))
}
