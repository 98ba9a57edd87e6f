//! SFTP version 3 wire messages,
//! [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)
//!
//! Only the subset needed for directory listing is defined. Messages share
//! the SSH primitive encodings from [`sshwire`](crate::sshwire).

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::sshwire::{
    wire_struct, BinString, SSHDecode, SSHEncode, SSHSink, SSHSource, TextString,
    WireError, WireResult,
};

/// The protocol version we implement
pub const SFTP_VERSION: u32 = 3;

/// A filename or path. Not necessarily UTF-8.
#[derive(Debug, Clone, Copy)]
pub struct Filename<'a>(pub BinString<'a>);

impl<'a> From<&'a str> for Filename<'a> {
    fn from(s: &'a str) -> Self {
        Filename(BinString(s.as_bytes()))
    }
}

impl<'a> Filename<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0 .0
    }
}

impl SSHEncode for Filename<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for Filename<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(Filename(BinString::dec(s)?))
    }
}

/// An opaque handle chosen by the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileHandle<'a>(pub BinString<'a>);

impl SSHEncode for FileHandle<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for FileHandle<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(FileHandle(BinString::dec(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub u32);

impl SSHEncode for ReqId {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ReqId {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(ReqId(u32::dec(s)?))
    }
}

#[derive(Debug)]
pub struct ExtPair<'a> {
    pub name: TextString<'a>,
    pub data: BinString<'a>,
}

wire_struct!(ExtPair<'a> { name, data });

/// Extension pairs run to the end of an INIT or VERSION packet.
fn dec_extensions<'de, S>(s: &mut S) -> WireResult<Vec<ExtPair<'de>>>
where
    S: SSHSource<'de>,
{
    let mut ext = Vec::new();
    while s.remaining() > 0 {
        ext.push(ExtPair::dec(s)?);
    }
    Ok(ext)
}

/// `SSH_FXP_INIT`. Has no request id.
#[derive(Debug)]
pub struct Init<'a> {
    pub version: u32,
    pub extensions: Vec<ExtPair<'a>>,
}

impl SSHEncode for Init<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.version.enc(s)?;
        for e in self.extensions.iter() {
            e.enc(s)?;
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for Init<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let version = u32::dec(s)?;
        Ok(Self { version, extensions: dec_extensions(s)? })
    }
}

/// `SSH_FXP_VERSION`. Has no request id.
#[derive(Debug)]
pub struct Version<'a> {
    pub version: u32,
    pub extensions: Vec<ExtPair<'a>>,
}

impl SSHEncode for Version<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.version.enc(s)?;
        for e in self.extensions.iter() {
            e.enc(s)?;
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for Version<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let version = u32::dec(s)?;
        Ok(Self { version, extensions: dec_extensions(s)? })
    }
}

// Requests

#[derive(Debug)]
pub struct OpenDir<'a> {
    pub path: Filename<'a>,
}

wire_struct!(OpenDir<'a> { path });

#[derive(Debug)]
pub struct ReadDir<'a> {
    pub handle: FileHandle<'a>,
}

wire_struct!(ReadDir<'a> { handle });

#[derive(Debug)]
pub struct Close<'a> {
    pub handle: FileHandle<'a>,
}

wire_struct!(Close<'a> { handle });

#[derive(Debug)]
pub struct RealPath<'a> {
    pub path: Filename<'a>,
}

wire_struct!(RealPath<'a> { path });

// Responses

#[derive(Debug)]
pub struct Status<'a> {
    pub code: StatusCode,
    pub message: TextString<'a>,
    pub lang: TextString<'a>,
}

impl SSHEncode for Status<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.code.enc(s)?;
        self.message.enc(s)?;
        self.lang.enc(s)
    }
}

impl<'de> SSHDecode<'de> for Status<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let code = StatusCode::dec(s)?;
        // Some version 3 servers omit the message and language tag
        let message = if s.remaining() > 0 { TextString::dec(s)? } else { TextString(b"") };
        let lang = if s.remaining() > 0 { TextString::dec(s)? } else { TextString(b"") };
        Ok(Self { code, message, lang })
    }
}

#[derive(Debug)]
pub struct Handle<'a> {
    pub handle: FileHandle<'a>,
}

wire_struct!(Handle<'a> { handle });

#[derive(Debug)]
pub struct NameEntry<'a> {
    pub filename: Filename<'a>,
    /// An `ls -l` style line. Its format is unspecified.
    pub longname: Filename<'a>,
    pub attrs: Attrs,
}

wire_struct!(NameEntry<'a> { filename, longname, attrs });

#[derive(Debug)]
pub struct Name<'a>(pub Vec<NameEntry<'a>>);

impl<'de> SSHDecode<'de> for Name<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let count = u32::dec(s)? as usize;

        // Each entry is at least 12 bytes, don't trust the count for allocation
        let mut names = Vec::with_capacity(count.min(s.remaining() / 12));

        for _ in 0..count {
            names.push(NameEntry::dec(s)?);
        }

        Ok(Name(names))
    }
}

impl SSHEncode for Name<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        (self.0.len() as u32).enc(s)?;

        for element in self.0.iter() {
            element.enc(s)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum StatusCode {
    SSH_FX_OK,
    SSH_FX_EOF,
    SSH_FX_NO_SUCH_FILE,
    SSH_FX_PERMISSION_DENIED,
    SSH_FX_FAILURE,
    SSH_FX_BAD_MESSAGE,
    SSH_FX_NO_CONNECTION,
    SSH_FX_CONNECTION_LOST,
    SSH_FX_OP_UNSUPPORTED,
    Other(u32),
}

impl From<u32> for StatusCode {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::SSH_FX_OK,
            1 => Self::SSH_FX_EOF,
            2 => Self::SSH_FX_NO_SUCH_FILE,
            3 => Self::SSH_FX_PERMISSION_DENIED,
            4 => Self::SSH_FX_FAILURE,
            5 => Self::SSH_FX_BAD_MESSAGE,
            6 => Self::SSH_FX_NO_CONNECTION,
            7 => Self::SSH_FX_CONNECTION_LOST,
            8 => Self::SSH_FX_OP_UNSUPPORTED,
            v => Self::Other(v),
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> u32 {
        match c {
            StatusCode::SSH_FX_OK => 0,
            StatusCode::SSH_FX_EOF => 1,
            StatusCode::SSH_FX_NO_SUCH_FILE => 2,
            StatusCode::SSH_FX_PERMISSION_DENIED => 3,
            StatusCode::SSH_FX_FAILURE => 4,
            StatusCode::SSH_FX_BAD_MESSAGE => 5,
            StatusCode::SSH_FX_NO_CONNECTION => 6,
            StatusCode::SSH_FX_CONNECTION_LOST => 7,
            StatusCode::SSH_FX_OP_UNSUPPORTED => 8,
            StatusCode::Other(v) => v,
        }
    }
}

impl SSHEncode for StatusCode {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        u32::from(*self).enc(s)
    }
}

impl<'de> SSHDecode<'de> for StatusCode {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(StatusCode::from(u32::dec(s)?))
    }
}

#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum AttrsFlags {
    SSH_FILEXFER_ATTR_SIZE = 0x01,
    SSH_FILEXFER_ATTR_UIDGID = 0x02,
    SSH_FILEXFER_ATTR_PERMISSIONS = 0x04,
    SSH_FILEXFER_ATTR_ACMODTIME = 0x08,
    SSH_FILEXFER_ATTR_EXTENDED = 0x80000000,
}

impl core::ops::BitOrAssign<AttrsFlags> for u32 {
    fn bitor_assign(&mut self, other: AttrsFlags) {
        *self |= other as u32;
    }
}

impl core::ops::BitAnd<AttrsFlags> for u32 {
    type Output = u32;

    fn bitand(self, rhs: AttrsFlags) -> Self::Output {
        self & rhs as u32
    }
}

/// File attributes.
///
/// A field is `None` when the server didn't send it. The wire flags are
/// derived from which fields are present, so a zero value is never
/// confused with an absent one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attrs {
    pub size: Option<u64>,
    pub uidgid: Option<UidGid>,
    pub permissions: Option<u32>,
    pub acmodtime: Option<AcModTime>,
    /// `(type, data)` extension pairs
    pub extended: Option<Vec<(Vec<u8>, Vec<u8>)>>,
}

/// Owner ids, always sent together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidGid {
    pub uid: u32,
    pub gid: u32,
}

/// Access and modification times, seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcModTime {
    pub atime: u32,
    pub mtime: u32,
}

impl Attrs {
    pub fn flags(&self) -> u32 {
        let mut flags: u32 = 0;
        if self.size.is_some() {
            flags |= AttrsFlags::SSH_FILEXFER_ATTR_SIZE
        }
        if self.uidgid.is_some() {
            flags |= AttrsFlags::SSH_FILEXFER_ATTR_UIDGID
        }
        if self.permissions.is_some() {
            flags |= AttrsFlags::SSH_FILEXFER_ATTR_PERMISSIONS
        }
        if self.acmodtime.is_some() {
            flags |= AttrsFlags::SSH_FILEXFER_ATTR_ACMODTIME
        }
        if self.extended.is_some() {
            flags |= AttrsFlags::SSH_FILEXFER_ATTR_EXTENDED
        }
        flags
    }
}

impl SSHEncode for Attrs {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.flags().enc(s)?;

        // Order matters, fields are interpreted according to the flags
        if let Some(size) = self.size {
            size.enc(s)?
        }
        if let Some(ids) = self.uidgid {
            ids.uid.enc(s)?;
            ids.gid.enc(s)?;
        }
        if let Some(perm) = self.permissions {
            perm.enc(s)?
        }
        if let Some(t) = self.acmodtime {
            t.atime.enc(s)?;
            t.mtime.enc(s)?;
        }
        if let Some(ext) = &self.extended {
            (ext.len() as u32).enc(s)?;
            for (ty, data) in ext.iter() {
                BinString(ty).enc(s)?;
                BinString(data).enc(s)?;
            }
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for Attrs {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let mut attrs = Attrs::default();
        let flags = u32::dec(s)?;
        if flags & AttrsFlags::SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(u64::dec(s)?);
        }
        if flags & AttrsFlags::SSH_FILEXFER_ATTR_UIDGID != 0 {
            let uid = u32::dec(s)?;
            let gid = u32::dec(s)?;
            attrs.uidgid = Some(UidGid { uid, gid });
        }
        if flags & AttrsFlags::SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(u32::dec(s)?);
        }
        if flags & AttrsFlags::SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            let atime = u32::dec(s)?;
            let mtime = u32::dec(s)?;
            attrs.acmodtime = Some(AcModTime { atime, mtime });
        }
        if flags & AttrsFlags::SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = u32::dec(s)? as usize;
            let mut ext = Vec::with_capacity(count.min(s.remaining() / 8));
            for _ in 0..count {
                let ty = BinString::dec(s)?;
                let data = BinString::dec(s)?;
                ext.push((ty.0.to_vec(), data.0.to_vec()));
            }
            attrs.extended = Some(ext);
        }
        Ok(attrs)
    }
}

/// SFTP packets, without the `u32` length prefix.
macro_rules! sftpmessages {
    (
        init: {
            $( ( $init_num:literal, $InitVariant:ident, $InitType:ty, $INIT_NAME:ident ), )*
        },
        request: {
            $( ( $req_num:literal, $ReqVariant:ident, $ReqType:ty, $REQ_NAME:ident ), )*
        },
        response: {
            $( ( $resp_num:literal, $RespVariant:ident, $RespType:ty, $RESP_NAME:ident ), )*
        },
    ) => {

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum SftpNum {
    $( $INIT_NAME = $init_num, )*
    $( $REQ_NAME = $req_num, )*
    $( $RESP_NAME = $resp_num, )*
}

impl TryFrom<u8> for SftpNum {
    type Error = WireError;
    fn try_from(v: u8) -> WireResult<Self> {
        match v {
            $( $init_num => Ok(SftpNum::$INIT_NAME), )*
            $( $req_num => Ok(SftpNum::$REQ_NAME), )*
            $( $resp_num => Ok(SftpNum::$RESP_NAME), )*
            _ => Err(WireError::UnknownPacket { number: v }),
        }
    }
}

/// Top level SFTP packet enum
#[derive(Debug)]
pub enum SftpPacket<'a> {
    $( $InitVariant($InitType), )*
    $( $ReqVariant(ReqId, $ReqType), )*
    $( $RespVariant(ReqId, $RespType), )*
}

impl SSHEncode for SftpPacket<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (self.sftp_num() as u8).enc(s)?;
        match self {
            $( SftpPacket::$InitVariant(p) => p.enc(s), )*
            $( SftpPacket::$ReqVariant(id, p) => {
                id.enc(s)?;
                p.enc(s)
            } )*
            $( SftpPacket::$RespVariant(id, p) => {
                id.enc(s)?;
                p.enc(s)
            } )*
        }
    }
}

impl<'a> SSHDecode<'a> for SftpPacket<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'a> {
        let num = SftpNum::try_from(u8::dec(s)?)?;
        let p = match num {
            $( SftpNum::$INIT_NAME => SftpPacket::$InitVariant(SSHDecode::dec(s)?), )*
            $( SftpNum::$REQ_NAME => {
                let id = ReqId::dec(s)?;
                SftpPacket::$ReqVariant(id, SSHDecode::dec(s)?)
            } )*
            $( SftpNum::$RESP_NAME => {
                let id = ReqId::dec(s)?;
                SftpPacket::$RespVariant(id, SSHDecode::dec(s)?)
            } )*
        };
        Ok(p)
    }
}

impl SftpPacket<'_> {
    pub fn sftp_num(&self) -> SftpNum {
        match self {
            $( SftpPacket::$InitVariant(_) => SftpNum::$INIT_NAME, )*
            $( SftpPacket::$ReqVariant(..) => SftpNum::$REQ_NAME, )*
            $( SftpPacket::$RespVariant(..) => SftpNum::$RESP_NAME, )*
        }
    }

    /// Request id of a request or response
    pub fn req_id(&self) -> Option<ReqId> {
        match self {
            $( SftpPacket::$InitVariant(_) => None, )*
            $( SftpPacket::$ReqVariant(id, _) => Some(*id), )*
            $( SftpPacket::$RespVariant(id, _) => Some(*id), )*
        }
    }

    pub fn is_request(&self) -> bool {
        match self {
            $( SftpPacket::$ReqVariant(..) => true, )*
            _ => false,
        }
    }

    pub fn is_response(&self) -> bool {
        match self {
            $( SftpPacket::$RespVariant(..) => true, )*
            _ => false,
        }
    }
}

} } // macro

sftpmessages![
    init: {
        (1, Init, Init<'a>, SSH_FXP_INIT),
        (2, Version, Version<'a>, SSH_FXP_VERSION),
    },
    request: {
        (4, Close, Close<'a>, SSH_FXP_CLOSE),
        (11, OpenDir, OpenDir<'a>, SSH_FXP_OPENDIR),
        (12, ReadDir, ReadDir<'a>, SSH_FXP_READDIR),
        (16, RealPath, RealPath<'a>, SSH_FXP_REALPATH),
    },
    response: {
        (101, Status, Status<'a>, SSH_FXP_STATUS),
        (102, Handle, Handle<'a>, SSH_FXP_HANDLE),
        (104, Name, Name<'a>, SSH_FXP_NAME),
    },
];

/// Appends `p` to `out` with its `u32` length prefix.
pub fn write_framed(out: &mut Vec<u8>, p: &SftpPacket) -> Result<()> {
    let start = out.len();
    out.extend_from_slice(&[0u8; 4]);
    let len = crate::sshwire::write_ssh_vec(out, p)?;
    let len = u32::try_from(len).map_err(|_| Error::NoRoom)?;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Returns the length of a complete framed packet at the start of `buf`,
/// including the length prefix, or `None` if more input is needed.
pub fn framed_len(buf: &[u8], max: usize) -> Result<Option<usize>> {
    let Some(l) = buf.get(..4) else {
        return Ok(None);
    };
    let mut lb = [0u8; 4];
    lb.copy_from_slice(l);
    let len = u32::from_be_bytes(lb) as usize;
    if len == 0 {
        return Err(Error::SftpProto { msg: "Empty packet" });
    }
    if len > max {
        debug!("SFTP packet length {len}");
        return Err(Error::SftpProto { msg: "Packet too large" });
    }
    if buf.len() < 4 + len {
        Ok(None)
    } else {
        Ok(Some(4 + len))
    }
}
