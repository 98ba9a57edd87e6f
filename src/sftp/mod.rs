//! SFTP version 3 directory listing,
//! [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02).

pub mod proto;

pub(crate) mod channel;
pub(crate) mod client;

pub use channel::SftpChannel;
pub use client::{DirEntry, DirHandle, DirState, ReadEntry};
pub use proto::{AcModTime, Attrs, StatusCode, UidGid};
