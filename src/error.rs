use core::str::Utf8Error;
#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;
use core::fmt;

use snafu::prelude::*;

use crate::sftp::proto::StatusCode;

/// The dusk error type.
///
/// Variants fall into the categories returned by [`Error::kind()`].
/// Transport and protocol errors are fatal to a [`Session`](crate::Session),
/// the others are scoped to the operation that returned them.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// The operation can't progress until the transport is ready.
    ///
    /// Not a failure. Retry the identical call later.
    WouldBlock,

    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// Key exchange incorrect
    BadKex,

    /// Packet integrity failed
    BadDecrypt,

    /// Signature is incorrect
    BadSig,

    /// Integer overflow in packet
    BadNumber,

    /// Error in received SSH protocol. Will disconnect.
    SSHProtoError,

    /// Peer sent something we don't handle. Will disconnect.
    ///
    /// The peer may be behaving within the SSH specifications,
    /// but dusk doesn't support it.
    SSHProtoUnsupported,

    /// Received a key with invalid structure, or too large.
    BadKeyFormat,

    /// Remote peer isn't SSH
    NotSSH,

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// Received packet at a disallowed time.
    PacketWrong,

    #[snafu(display("No matching {algo} algorithm"))]
    AlgoNoMatch { algo: &'static str },

    #[snafu(display("Packet size {size} too large (or bad decrypt)"))]
    BigPacket { size: usize },

    /// An unknown SSH name is provided, for a key type, signature type,
    /// channel name etc.
    #[snafu(display("Unknown {kind} method"))]
    UnknownMethod { kind: &'static str },

    /// Malformed SFTP packet from the server
    #[snafu(display("Bad SFTP packet: {msg}"))]
    SftpProto { msg: &'static str },

    /// IO Error
    IoError { source: std::io::Error },

    /// The transport reached end of stream
    TransportClosed,

    #[snafu(display("Peer disconnected: {desc} (reason {reason})"))]
    PeerDisconnected { reason: u32, desc: String },

    /// An earlier fatal error left the session unusable
    SessionFailed,

    /// Credentials were rejected
    ///
    /// `methods` lists the methods the server would still accept.
    #[snafu(display("Authentication failed, server allows {methods}"))]
    AuthFailed { methods: String },

    /// The server requires a password change
    PasswordExpired,

    #[snafu(display("Failed loading key: {msg}"))]
    KeyFile { msg: String },

    /// Bad key
    BadKey,

    #[snafu(display("Channel open failed: {desc} (reason {reason})"))]
    ChannelOpenFailed { reason: u32, desc: String },

    #[snafu(display("Subsystem {name} refused"))]
    SubsystemRefused { name: &'static str },

    /// Channel EOF
    ///
    /// The remote side sent EOF or closed the channel.
    ChannelEOF,

    #[snafu(display("Bad channel number {num}"))]
    BadChannel { num: u32 },

    /// SFTP operation failed on the server
    #[snafu(display("SFTP {code:?}: {msg}"))]
    Sftp { code: SftpError, msg: String },

    /// An operation was called in a state that doesn't allow it.
    #[snafu(display("Invalid state, {what}"))]
    InvalidState { what: &'static str },

    /// The handle has already been closed
    AlreadyClosed,

    /// Bad application usage
    #[snafu(display("Bad usage, {what}"))]
    BadUsage { what: &'static str },

    // Used for unknown key types etc.
    #[snafu(display("{what} is not available"))]
    NotAvailable { what: &'static str },

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    // This state should not be reached, previous logic should have prevented it.
    // Create this using [`Error::bug()`] or [`.trap()`](TrapBug::trap).
    /// Program bug
    Bug,
}

/// Broad category of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// I/O failure on the underlying stream. Fatal.
    Transport,
    /// Malformed or out of sequence protocol data. Fatal.
    Protocol,
    /// Credentials rejected. The caller may retry.
    Auth,
    /// The subsystem channel could not be established. The caller may retry.
    Channel,
    /// Server-side SFTP operation failure, scoped to a handle.
    Sftp,
    /// Retry signal, not a failure.
    WouldBlock,
    /// The API was called incorrectly.
    Usage,
}

/// SFTP failure reported by the server in a `SSH_FXP_STATUS`.
///
/// `SSH_FX_OK` and `SSH_FX_EOF` are not failures so have no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SftpError {
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    Other(u32),
}

impl From<StatusCode> for SftpError {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::SSH_FX_NO_SUCH_FILE => Self::NoSuchFile,
            StatusCode::SSH_FX_PERMISSION_DENIED => Self::PermissionDenied,
            StatusCode::SSH_FX_FAILURE => Self::Failure,
            StatusCode::SSH_FX_BAD_MESSAGE => Self::BadMessage,
            StatusCode::SSH_FX_NO_CONNECTION => Self::NoConnection,
            StatusCode::SSH_FX_CONNECTION_LOST => Self::ConnectionLost,
            StatusCode::SSH_FX_OP_UNSUPPORTED => Self::OpUnsupported,
            c => Self::Other(c.into()),
        }
    }
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WouldBlock => ErrorKind::WouldBlock,

            Error::IoError { .. }
            | Error::TransportClosed
            | Error::PeerDisconnected { .. }
            | Error::SessionFailed => ErrorKind::Transport,

            Error::AuthFailed { .. }
            | Error::PasswordExpired
            | Error::KeyFile { .. }
            | Error::BadKey => ErrorKind::Auth,

            Error::ChannelOpenFailed { .. }
            | Error::SubsystemRefused { .. }
            | Error::ChannelEOF => ErrorKind::Channel,

            Error::Sftp { .. } => ErrorKind::Sftp,

            Error::InvalidState { .. }
            | Error::AlreadyClosed
            | Error::BadUsage { .. }
            | Error::NotAvailable { .. } => ErrorKind::Usage,

            _ => ErrorKind::Protocol,
        }
    }

    /// Returns `true` if the error invalidates the session and
    /// everything derived from it.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Protocol)
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    /// Returns the SFTP failure code, if this is a SFTP error.
    pub fn sftp_code(&self) -> Option<SftpError> {
        match self {
            Error::Sftp { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to track the source of errors in development,
        // but release builds shouldn't panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    ///
    /// The message can be used instead of a code comment, is logged at `debug` level.
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            debug!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    #[cold]
    pub fn bug_err_msg(msg: &str) -> Error {
        Self::bug_fmt(format_args!("{}", msg))
    }
}

/// A dusk-specific Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message, calls [`Error::bug_msg()`]
    /// The message can be used instead of a comment.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        // call directly so that Location::caller() works
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::WouldBlock {
            Self::WouldBlock
        } else {
            Self::IoError { source: value }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Auth => "auth",
            Self::Channel => "channel",
            Self::Sftp => "sftp",
            Self::WouldBlock => "would block",
            Self::Usage => "usage",
        };
        f.write_str(s)
    }
}
