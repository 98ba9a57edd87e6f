//! A non-blocking SSH client for listing directories over SFTP.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use dusk::{Config, Session, SftpChannel, ReadEntry};
//!
//! # fn main() -> dusk::Result<()> {
//! let tcp = TcpStream::connect("127.0.0.1:22").map_err(|e| dusk::Error::IoError { source: e })?;
//! let mut sess = Session::connect(tcp, Config::new().blocking(true))?;
//! println!("Fingerprint: {}", sess.host_fingerprint()?);
//! sess.authenticate_password("username", "password")?;
//! let mut sftp = SftpChannel::open(&mut sess)?;
//! let dir = sftp.open_directory("/tmp")?;
//! while let ReadEntry::Entry(e) = sftp.read_entry(&dir)? {
//!     println!("{}", e.name_lossy());
//! }
//! sftp.close_directory(&dir)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
// avoids headscratching
#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod packets;
pub mod sftp;
pub mod sshnames;
pub mod sshwire;

mod channel;
mod cliauth;
mod conn;
mod dusklog;
mod encrypt;
mod ident;
mod kex;
mod namelist;
mod random;
mod session;
mod sign;
mod ssh_chapoly;
mod traffic;
mod transport;

#[cfg(test)]
mod test;

// Application API
pub use config::{AuthMethod, Config, HashKind};
pub use error::{Error, ErrorKind, Result, SftpError};
pub use session::{Credentials, Fingerprint, Session};
pub use sftp::{AcModTime, Attrs, DirEntry, DirHandle, DirState, ReadEntry, SftpChannel, UidGid};
pub use sign::SignKey;
pub use transport::Transport;
