//! # ducat
//!
//! Transaction multiplexing core for driving a remote "system under
//! test" over a single byte pipe (virtio-serial, serial line, TCP).
//!
//! One link carries many concurrent transactions (run a command, send
//! a file, fetch a file), each identified by a 16-bit xid and framed
//! with a small typed header (see [`ducat_proto`]). A transaction owns
//! *channels* that adapt local descriptors to link packets: sinks
//! receive stream data, sources feed it. Everything is scheduled
//! cooperatively from one non-blocking poll loop with backpressure on
//! the shared link.
//!
//! ## Example
//!
//! ```ignore
//! use ducat::{CommandReq, Connection, Outcome};
//!
//! let mut conn = Connection::new(link_fd)?;
//! let xid = conn.command(CommandReq::new("root", "echo hi").stdout(out_fd))?;
//! match conn.run(xid)? {
//!     Outcome::Done(status) => println!("major={} minor={}", status.major, status.minor),
//!     Outcome::TimedOut => eprintln!("remote timeout"),
//! }
//! ```

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod sock;
pub mod transaction;

pub use client::{CommandReq, ExtractReq, InjectReq};
pub use connection::{Connection, LinkOpts};
pub use error::{Error, Result};
pub use transaction::{Outcome, Status, Transaction, TxHandler, TxKind, TxPhase};

pub use ducat_proto as proto;
