//! Session configuration.
//!
//! There are no built-in credentials or paths. Everything a session
//! needs beyond these options is passed to the individual operations.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

/// Initial receive window for a channel.
pub const DEFAULT_WINDOW: usize = 64 * 1024;
/// Largest channel data packet we accept.
pub const DEFAULT_MAX_PACKET: usize = 32 * 1024;

/// Limit on the number of SSH channels a session can have open.
pub const MAX_CHANNELS: usize = 4;

/// Largest SFTP packet accepted from the server.
///
/// draft-ietf-secsh-filexfer requires servers to handle 34000 bytes,
/// a NAME response for a large directory chunk can be larger.
pub const MAX_SFTP_PACKET: usize = 256 * 1024;

/// Digest used for the host key fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    /// 16 byte MD5
    #[default]
    Md5,
    /// 20 byte SHA-1
    Sha1,
    /// 32 byte SHA-256
    Sha256,
}

impl HashKind {
    /// Length in bytes of the digest
    pub fn len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        };
        f.write_str(s)
    }
}

/// A user authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    #[default]
    Password,
    PublicKey,
}

impl AuthMethod {
    /// The RFC4252 method name
    pub fn ssh_name(&self) -> &'static str {
        match self {
            Self::Password => crate::sshnames::SSH_AUTHMETHOD_PASSWORD,
            Self::PublicKey => crate::sshnames::SSH_AUTHMETHOD_PUBLICKEY,
        }
    }
}

/// Options recognised by a [`Session`](crate::Session).
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Which host key digest [`Session::fingerprint`](crate::Session::fingerprint)
    /// returns when not asked for a specific one.
    pub hash_kind: HashKind,
    /// Method used by [`Session::authenticate`](crate::Session::authenticate)
    pub auth_method: AuthMethod,
    /// When `true`, operations wait on the transport rather than
    /// returning [`Error::WouldBlock`].
    pub blocking_mode: bool,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_kind(mut self, hash_kind: HashKind) -> Self {
        self.hash_kind = hash_kind;
        self
    }

    pub fn auth_method(mut self, auth_method: AuthMethod) -> Self {
        self.auth_method = auth_method;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking_mode = blocking;
        self
    }
}
