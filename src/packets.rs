//! SSH protocol packets.
//!
//! A [`Packet`] can be encoded/decoded to the
//! SSH Binary Packet Protocol using [`sshwire`].
//! SSH packet format is described in [RFC4253](https://tools.ietf.org/html/rfc4253) SSH Transport

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use crate::config;
use crate::namelist::NameList;
use crate::sign::{OwnedSig, SigType};
use crate::sshnames::*;
use crate::sshwire::{self, wire_struct, BinString, Blob, TextString};
use crate::sshwire::{SSHDecode, SSHEncode, SSHSink, SSHSource, WireError, WireResult};

#[derive(Debug)]
pub struct KexInit<'a> {
    pub cookie: [u8; 16],
    pub kex: NameList<'a>,
    /// Signature algorithms, RFC4253 calls them host key algorithms.
    pub hostsig: NameList<'a>,
    pub cipher_c2s: NameList<'a>,
    pub cipher_s2c: NameList<'a>,
    pub mac_c2s: NameList<'a>,
    pub mac_s2c: NameList<'a>,
    pub comp_c2s: NameList<'a>,
    pub comp_s2c: NameList<'a>,
    pub lang_c2s: NameList<'a>,
    pub lang_s2c: NameList<'a>,
    pub first_follows: bool,
    pub reserved: u32,
}
wire_struct!(KexInit<'a> {
    cookie, kex, hostsig, cipher_c2s, cipher_s2c, mac_c2s, mac_s2c,
    comp_c2s, comp_s2c, lang_c2s, lang_s2c, first_follows, reserved,
});

#[derive(Debug)]
pub struct NewKeys {}
wire_struct!(NewKeys {});

#[derive(Debug)]
pub struct Ignore<'a> {
    pub data: BinString<'a>,
}
wire_struct!(Ignore<'a> { data });

/// Named to avoid clashing with [`fmt::Debug`]
#[derive(Debug)]
pub struct DebugPacket<'a> {
    pub always_display: bool,
    pub message: TextString<'a>,
    pub lang: TextString<'a>,
}
wire_struct!(DebugPacket<'a> { always_display, message, lang });

#[derive(Debug)]
pub struct Disconnect<'a> {
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: TextString<'a>,
}
wire_struct!(Disconnect<'a> { reason, desc, lang });

#[derive(Debug)]
pub struct Unimplemented {
    pub seq: u32,
}
wire_struct!(Unimplemented { seq });

#[derive(Debug)]
pub struct KexDHInit<'a> {
    pub q_c: BinString<'a>,
}
wire_struct!(KexDHInit<'a> { q_c });

#[derive(Debug)]
pub struct KexDHReply<'a> {
    pub k_s: Blob<PubKey<'a>>,
    pub q_s: BinString<'a>,
    pub sig: Blob<Signature<'a>>,
}
wire_struct!(KexDHReply<'a> { k_s, q_s, sig });

#[derive(Debug)]
pub struct ServiceRequest<'a> {
    pub name: &'a str,
}
wire_struct!(ServiceRequest<'a> { name });

#[derive(Debug)]
pub struct ServiceAccept<'a> {
    pub name: &'a str,
}
wire_struct!(ServiceAccept<'a> { name });

#[derive(Debug)]
pub struct UserauthRequest<'a> {
    pub username: TextString<'a>,
    pub service: &'a str,
    pub method: AuthMethod<'a>,
}
wire_struct!(UserauthRequest<'a> { username, service, method });

/// The method-specific part of a [`UserauthRequest`].
#[derive(Debug)]
pub enum AuthMethod<'a> {
    Password(MethodPassword<'a>),
    PubKey(MethodPubKey<'a>),
    None,
    Unknown(Unknown<'a>),
}

impl AuthMethod<'_> {
    fn name(&self) -> WireResult<&str> {
        match self {
            AuthMethod::Password(_) => Ok(SSH_AUTHMETHOD_PASSWORD),
            AuthMethod::PubKey(_) => Ok(SSH_AUTHMETHOD_PUBLICKEY),
            AuthMethod::None => Ok(SSH_NAME_NONE),
            AuthMethod::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl SSHEncode for AuthMethod<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.name()?.enc(s)?;
        match self {
            AuthMethod::Password(m) => m.enc(s),
            AuthMethod::PubKey(m) => m.enc(s),
            AuthMethod::None => Ok(()),
            AuthMethod::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecode<'a> for AuthMethod<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let name = BinString::dec(s)?;
        let m = match name.0 {
            n if n == SSH_AUTHMETHOD_PASSWORD.as_bytes() => AuthMethod::Password(SSHDecode::dec(s)?),
            n if n == SSH_AUTHMETHOD_PUBLICKEY.as_bytes() => AuthMethod::PubKey(SSHDecode::dec(s)?),
            n if n == SSH_NAME_NONE.as_bytes() => AuthMethod::None,
            n => Unknown::seen(s, n, AuthMethod::Unknown),
        };
        Ok(m)
    }
}

/// Packet number 60 has a different meaning depending on the
/// authentication method in progress.
#[derive(Debug)]
pub enum Userauth60<'a> {
    PkOk(UserauthPkOk<'a>),
    PwChangeReq(UserauthPwChangeReq<'a>),
}

impl SSHEncode for Userauth60<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            Userauth60::PkOk(p) => p.enc(s),
            Userauth60::PwChangeReq(p) => p.enc(s),
        }
    }
}

impl<'a> SSHDecode<'a> for Userauth60<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        match s.ctx().cli_auth_type {
            Some(config::AuthMethod::Password) => Ok(Self::PwChangeReq(SSHDecode::dec(s)?)),
            Some(config::AuthMethod::PublicKey) => Ok(Self::PkOk(SSHDecode::dec(s)?)),
            None => {
                trace!("Wrong packet state for userauth60");
                Err(WireError::PacketWrong)
            }
        }
    }
}

#[derive(Debug)]
pub struct UserauthPkOk<'a> {
    pub algo: &'a str,
    pub key: Blob<PubKey<'a>>,
}
wire_struct!(UserauthPkOk<'a> { algo, key });

#[derive(Debug)]
pub struct UserauthPwChangeReq<'a> {
    pub prompt: TextString<'a>,
    pub lang: TextString<'a>,
}
wire_struct!(UserauthPwChangeReq<'a> { prompt, lang });

pub struct MethodPassword<'a> {
    pub change: bool,
    pub password: TextString<'a>,
}
wire_struct!(MethodPassword<'a> { change, password });

// Don't print password
impl fmt::Debug for MethodPassword<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodPassword").field("change", &self.change).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MethodPubKey<'a> {
    /// A signature algorithm name (not key algorithm name).
    pub sig_algo: &'a str,
    pub pubkey: Blob<PubKey<'a>>,
    pub sig: Option<Blob<Signature<'a>>>,
}

impl SSHEncode for MethodPubKey<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        // boolean   has signature
        // string    public key algorithm name
        // string    public key to be used for authentication
        // string    signature, when present
        self.sig.is_some().enc(s)?;
        self.sig_algo.enc(s)?;
        self.pubkey.enc(s)?;
        self.sig.enc(s)
    }
}

impl<'a> SSHDecode<'a> for MethodPubKey<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let sig = bool::dec(s)?;
        let sig_algo = SSHDecode::dec(s)?;
        let pubkey = SSHDecode::dec(s)?;
        let sig = if sig { Some(SSHDecode::dec(s)?) } else { None };
        Ok(Self { sig_algo, pubkey, sig })
    }
}

/// The data signed for publickey authentication, RFC4252 section 7.
pub struct AuthSigMsg<'a> {
    pub sess_id: BinString<'a>,
    pub username: TextString<'a>,
    pub service: &'a str,
    pub sig_algo: &'a str,
    pub pubkey: Blob<PubKey<'a>>,
}

impl SSHEncode for AuthSigMsg<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.sess_id.enc(s)?;
        (MessageNumber::SSH_MSG_USERAUTH_REQUEST as u8).enc(s)?;
        self.username.enc(s)?;
        self.service.enc(s)?;
        SSH_AUTHMETHOD_PUBLICKEY.enc(s)?;
        true.enc(s)?;
        self.sig_algo.enc(s)?;
        self.pubkey.enc(s)
    }
}

#[derive(Debug)]
pub struct UserauthFailure<'a> {
    pub methods: NameList<'a>,
    pub partial: bool,
}
wire_struct!(UserauthFailure<'a> { methods, partial });

#[derive(Debug)]
pub struct UserauthSuccess {}
wire_struct!(UserauthSuccess {});

#[derive(Debug)]
pub struct UserauthBanner<'a> {
    pub message: TextString<'a>,
    pub lang: TextString<'a>,
}
wire_struct!(UserauthBanner<'a> { message, lang });

#[derive(Debug, Clone, PartialEq)]
pub enum PubKey<'a> {
    Ed25519(Ed25519PubKey<'a>),
    Unknown(Unknown<'a>),
}

impl PubKey<'_> {
    /// The algorithm name presented. May be invalid.
    pub fn algorithm_name(&self) -> Result<&str, &Unknown<'_>> {
        match self {
            PubKey::Ed25519(_) => Ok(SSH_NAME_ED25519),
            PubKey::Unknown(u) => Err(u),
        }
    }

    /// Returns whether an OpenSSH format public key `k` is the same key
    pub fn matches_openssh(&self, k: &ssh_key::PublicKey) -> bool {
        match (k.key_data(), self) {
            (ssh_key::public::KeyData::Ed25519(kssh), PubKey::Ed25519(kself)) => {
                kssh.0 == kself.key.0
            }
            _ => false,
        }
    }
}

impl SSHEncode for PubKey<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            PubKey::Ed25519(k) => {
                SSH_NAME_ED25519.enc(s)?;
                k.enc(s)
            }
            PubKey::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecode<'a> for PubKey<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let name = BinString::dec(s)?;
        let k = match name.0 {
            n if n == SSH_NAME_ED25519.as_bytes() => PubKey::Ed25519(SSHDecode::dec(s)?),
            n => Unknown::seen(s, n, PubKey::Unknown),
        };
        Ok(k)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ed25519PubKey<'a> {
    pub key: BinString<'a>,
}
wire_struct!(Ed25519PubKey<'a> { key });

#[derive(Debug)]
pub enum Signature<'a> {
    Ed25519(Ed25519Sig<'a>),
    Unknown(Unknown<'a>),
}

impl<'a> Signature<'a> {
    /// The algorithm name presented. May be invalid.
    pub fn algorithm_name(&self) -> Result<&'a str, &Unknown<'a>> {
        match self {
            Signature::Ed25519(_) => Ok(SSH_NAME_ED25519),
            Signature::Unknown(u) => Err(u),
        }
    }

    /// Returns the signature algorithm name for a public key.
    pub fn sig_name_for_pubkey(pubkey: &PubKey) -> Result<&'static str> {
        match pubkey {
            PubKey::Ed25519(_) => Ok(SSH_NAME_ED25519),
            PubKey::Unknown(u) => {
                warn!("Unknown key type \"{}\"", u);
                Err(Error::UnknownMethod { kind: "key" })
            }
        }
    }

    pub fn sig_type(&self) -> Result<SigType> {
        match self {
            Signature::Ed25519(_) => Ok(SigType::Ed25519),
            Signature::Unknown(u) => {
                warn!("Unknown signature type \"{}\"", u);
                Err(Error::UnknownMethod { kind: "signature" })
            }
        }
    }
}

impl SSHEncode for Signature<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            Signature::Ed25519(k) => {
                SSH_NAME_ED25519.enc(s)?;
                k.enc(s)
            }
            Signature::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecode<'a> for Signature<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let name = BinString::dec(s)?;
        let k = match name.0 {
            n if n == SSH_NAME_ED25519.as_bytes() => Signature::Ed25519(SSHDecode::dec(s)?),
            n => Unknown::seen(s, n, Signature::Unknown),
        };
        Ok(k)
    }
}

impl<'a> From<&'a OwnedSig> for Signature<'a> {
    fn from(s: &'a OwnedSig) -> Self {
        match s {
            OwnedSig::Ed25519(e) => Signature::Ed25519(Ed25519Sig { sig: BinString(e) }),
        }
    }
}

#[derive(Debug)]
pub struct Ed25519Sig<'a> {
    pub sig: BinString<'a>,
}
wire_struct!(Ed25519Sig<'a> { sig });

/// A global request. None are implemented, any request-specific data is skipped.
#[derive(Debug)]
pub struct GlobalRequest<'a> {
    pub req: Unknown<'a>,
    pub want_reply: bool,
}

impl SSHEncode for GlobalRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        BinString(self.req.0).enc(s)?;
        self.want_reply.enc(s)
    }
}

impl<'a> SSHDecode<'a> for GlobalRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let req = Unknown(BinString::dec(s)?.0);
        let want_reply = bool::dec(s)?;
        s.ctx().seen_unknown = true;
        Ok(Self { req, want_reply })
    }
}

#[derive(Debug)]
pub struct RequestSuccess {}
wire_struct!(RequestSuccess {});

#[derive(Debug)]
pub struct RequestFailure {}
wire_struct!(RequestFailure {});

#[derive(Debug)]
pub struct ChannelOpen<'a> {
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub ty: ChannelOpenType<'a>,
}

#[derive(Debug)]
pub enum ChannelOpenType<'a> {
    Session,
    Unknown(Unknown<'a>),
}

impl SSHEncode for ChannelOpen<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        // channel type comes first on the wire
        match self.ty {
            ChannelOpenType::Session => SSH_CHANNEL_SESSION.enc(s)?,
            ChannelOpenType::Unknown(_) => return Err(WireError::UnknownVariant),
        }
        self.num.enc(s)?;
        self.initial_window.enc(s)?;
        self.max_packet.enc(s)
    }
}

impl<'a> SSHDecode<'a> for ChannelOpen<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let name = BinString::dec(s)?;
        let num = u32::dec(s)?;
        let initial_window = u32::dec(s)?;
        let max_packet = u32::dec(s)?;
        let ty = match name.0 {
            n if n == SSH_CHANNEL_SESSION.as_bytes() => ChannelOpenType::Session,
            n => Unknown::seen(s, n, ChannelOpenType::Unknown),
        };
        Ok(Self { num, initial_window, max_packet, ty })
    }
}

#[derive(Debug)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}
wire_struct!(ChannelOpenConfirmation { num, sender_num, initial_window, max_packet });

#[derive(Debug)]
pub struct ChannelOpenFailure<'a> {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: TextString<'a>,
}
wire_struct!(ChannelOpenFailure<'a> { num, reason, desc, lang });

#[derive(Debug)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}
wire_struct!(ChannelWindowAdjust { num, adjust });

#[derive(Debug)]
pub struct ChannelData<'a> {
    pub num: u32,
    pub data: BinString<'a>,
}
wire_struct!(ChannelData<'a> { num, data });

impl ChannelData<'_> {
    /// Bytes in a packet payload before the data, includes packet type byte
    pub const DATA_OFFSET: usize = 9;
}

#[derive(Debug)]
pub struct ChannelDataExt<'a> {
    pub num: u32,
    pub code: u32,
    pub data: BinString<'a>,
}
wire_struct!(ChannelDataExt<'a> { num, code, data });

#[derive(Debug)]
pub struct ChannelEof {
    pub num: u32,
}
wire_struct!(ChannelEof { num });

#[derive(Debug)]
pub struct ChannelClose {
    pub num: u32,
}
wire_struct!(ChannelClose { num });

#[derive(Debug)]
pub struct ChannelSuccess {
    pub num: u32,
}
wire_struct!(ChannelSuccess { num });

#[derive(Debug)]
pub struct ChannelFailure {
    pub num: u32,
}
wire_struct!(ChannelFailure { num });

#[derive(Debug)]
pub struct ChannelRequest<'a> {
    pub num: u32,
    pub want_reply: bool,
    pub req: ChannelReqType<'a>,
}

#[derive(Debug)]
pub enum ChannelReqType<'a> {
    Subsystem(Subsystem<'a>),
    ExitStatus(ExitStatus),
    /// Anything else, such as `keepalive@openssh.com`
    Unknown(Unknown<'a>),
}

impl SSHEncode for ChannelRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.num.enc(s)?;
        // request type precedes want_reply
        match &self.req {
            ChannelReqType::Subsystem(_) => SSH_REQ_SUBSYSTEM.enc(s)?,
            ChannelReqType::ExitStatus(_) => SSH_REQ_EXIT_STATUS.enc(s)?,
            ChannelReqType::Unknown(_) => return Err(WireError::UnknownVariant),
        }
        self.want_reply.enc(s)?;
        match &self.req {
            ChannelReqType::Subsystem(r) => r.enc(s),
            ChannelReqType::ExitStatus(r) => r.enc(s),
            ChannelReqType::Unknown(_) => Err(WireError::UnknownVariant),
        }
    }
}

impl<'a> SSHDecode<'a> for ChannelRequest<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let num = u32::dec(s)?;
        let name = BinString::dec(s)?;
        let want_reply = bool::dec(s)?;
        let req = match name.0 {
            n if n == SSH_REQ_SUBSYSTEM.as_bytes() => ChannelReqType::Subsystem(SSHDecode::dec(s)?),
            n if n == SSH_REQ_EXIT_STATUS.as_bytes() => ChannelReqType::ExitStatus(SSHDecode::dec(s)?),
            n => Unknown::seen(s, n, ChannelReqType::Unknown),
        };
        Ok(Self { num, want_reply, req })
    }
}

#[derive(Debug)]
pub struct Subsystem<'a> {
    pub subsystem: TextString<'a>,
}
wire_struct!(Subsystem<'a> { subsystem });

#[derive(Debug)]
pub struct ExitStatus {
    pub status: u32,
}
wire_struct!(ExitStatus { status });

/// An unknown method or variant name.
///
/// Only received, never encoded. Whatever follows the name in the packet
/// is skipped.
#[derive(Clone, PartialEq)]
pub struct Unknown<'a>(pub &'a [u8]);

impl<'a> Unknown<'a> {
    /// Marks the parse as having skipped data and wraps `name` in variant `f`
    fn seen<'de, S, T>(s: &mut S, name: &'a [u8], f: impl FnOnce(Self) -> T) -> T
    where
        S: SSHSource<'de>,
    {
        s.ctx().seen_unknown = true;
        f(Unknown(name))
    }
}

impl fmt::Display for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = sshwire::try_as_ascii_str(self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl fmt::Debug for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// State passed to decoding, used to select some variants.
#[derive(Default, Clone, Debug)]
pub struct ParseContext {
    /// Authentication method in progress, for [`Userauth60`]
    pub cli_auth_type: Option<config::AuthMethod>,

    // An unknown variant skipped the rest of a packet,
    // packet length checks should be omitted.
    pub(crate) seen_unknown: bool,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident,
            $category:ident
            ),
             )*
    ) => {

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => Err(Error::UnknownPacket { number: v }),
        }
    }
}

impl SSHEncode for Packet<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (self.message_num() as u8).enc(s)?;
        match self {
            $(
            Packet::$SpecificPacketVariant(p) => p.enc(s),
            )*
        }
    }
}

impl<'a> SSHDecode<'a> for Packet<'a> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'a> {
        let msg_num = u8::dec(s)?;
        let ty = MessageNumber::try_from(msg_num)
            .map_err(|_| WireError::UnknownPacket { number: msg_num })?;

        let p = match ty {
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Top level SSH packet enum
#[derive(Debug)]
pub enum Packet<'a> {
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl<'a> Packet<'a> {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            $(
            Packet::$SpecificPacketVariant(_) => MessageNumber::$SSH_MESSAGE_NAME,
            )*
        }
    }

    pub fn category(&self) -> Category {
        match self {
            $(
            Packet::$SpecificPacketVariant(_) => Category::$category,
            )*
        }
    }
}

$(
impl<'a> From<$SpecificPacketType> for Packet<'a> {
    fn from(s: $SpecificPacketType) -> Packet<'a> {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Category {
    /// Allowed at any time.
    All,
    /// After kexinit, before newkeys complete. Strict kex allows
    /// nothing else at that time.
    Kex,
    /// Post-kex
    Auth,
    /// Post-auth
    Sess,
}

messagetypes![
(1, Disconnect, Disconnect<'a>, SSH_MSG_DISCONNECT, All),
(2, Ignore, Ignore<'a>, SSH_MSG_IGNORE, All),
(3, Unimplemented, Unimplemented, SSH_MSG_UNIMPLEMENTED, All),
(4, DebugPacket, DebugPacket<'a>, SSH_MSG_DEBUG, All),
(5, ServiceRequest, ServiceRequest<'a>, SSH_MSG_SERVICE_REQUEST, Auth),
(6, ServiceAccept, ServiceAccept<'a>, SSH_MSG_SERVICE_ACCEPT, Auth),
(20, KexInit, KexInit<'a>, SSH_MSG_KEXINIT, Kex),
(21, NewKeys, NewKeys, SSH_MSG_NEWKEYS, Kex),
(30, KexDHInit, KexDHInit<'a>, SSH_MSG_KEXDH_INIT, Kex),
(31, KexDHReply, KexDHReply<'a>, SSH_MSG_KEXDH_REPLY, Kex),

(50, UserauthRequest, UserauthRequest<'a>, SSH_MSG_USERAUTH_REQUEST, Auth),
(51, UserauthFailure, UserauthFailure<'a>, SSH_MSG_USERAUTH_FAILURE, Auth),
(52, UserauthSuccess, UserauthSuccess, SSH_MSG_USERAUTH_SUCCESS, Auth),
(53, UserauthBanner, UserauthBanner<'a>, SSH_MSG_USERAUTH_BANNER, Auth),
// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ or SSH_MSG_USERAUTH_PK_OK
(60, Userauth60, Userauth60<'a>, SSH_MSG_USERAUTH_60, Auth),

(80, GlobalRequest, GlobalRequest<'a>, SSH_MSG_GLOBAL_REQUEST, Sess),
(81, RequestSuccess, RequestSuccess, SSH_MSG_REQUEST_SUCCESS, Sess),
(82, RequestFailure, RequestFailure, SSH_MSG_REQUEST_FAILURE, Sess),

(90, ChannelOpen, ChannelOpen<'a>, SSH_MSG_CHANNEL_OPEN, Sess),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION, Sess),
(92, ChannelOpenFailure, ChannelOpenFailure<'a>, SSH_MSG_CHANNEL_OPEN_FAILURE, Sess),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST, Sess),
(94, ChannelData, ChannelData<'a>, SSH_MSG_CHANNEL_DATA, Sess),
(95, ChannelDataExt, ChannelDataExt<'a>, SSH_MSG_CHANNEL_EXTENDED_DATA, Sess),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF, Sess),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE, Sess),
(98, ChannelRequest, ChannelRequest<'a>, SSH_MSG_CHANNEL_REQUEST, Sess),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS, Sess),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE, Sess),
];

#[cfg(test)]
mod tests {
    use crate::dusklog::init_test_log;
    use crate::packets::*;
    use crate::sign::SignKey;
    use crate::sshwire::tests::test_roundtrip;
    use crate::sshwire::{packet_from_bytes, write_ssh_vec};
    use pretty_hex::PrettyHex;

    #[test]
    /// check round trip of packet enums is right
    fn packet_type() {
        for i in 0..=255 {
            if let Ok(ty) = MessageNumber::try_from(i) {
                assert_eq!(i, ty as u8);
            }
        }
    }

    #[test]
    fn roundtrip_authpubkey() {
        init_test_log();
        let k = SignKey::generate().unwrap();
        let pk = k.pubkey();
        let p = UserauthRequest {
            username: "matt".into(),
            service: "conn",
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: SSH_NAME_ED25519,
                pubkey: Blob(pk.clone()),
                sig: None,
            }),
        }
        .into();
        test_roundtrip(&p);

        // again with a sig
        let owned_sig = k.sign(&"hello").unwrap();
        let p = UserauthRequest {
            username: "matt".into(),
            service: "conn",
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: SSH_NAME_ED25519,
                pubkey: Blob(pk),
                sig: Some(Blob((&owned_sig).into())),
            }),
        }
        .into();
        test_roundtrip(&p);
    }

    #[test]
    fn roundtrip_channel() {
        init_test_log();
        test_roundtrip(&Packet::ChannelOpen(ChannelOpen {
            num: 0,
            initial_window: 899,
            max_packet: 14,
            ty: ChannelOpenType::Session,
        }));
        test_roundtrip(&Packet::ChannelRequest(ChannelRequest {
            num: 3,
            want_reply: true,
            req: ChannelReqType::Subsystem(Subsystem { subsystem: "sftp".into() }),
        }));
        test_roundtrip(&Packet::ChannelRequest(ChannelRequest {
            num: 3,
            want_reply: false,
            req: ChannelReqType::ExitStatus(ExitStatus { status: 1 }),
        }));
    }

    #[test]
    fn unknown_channel_request() {
        init_test_log();
        let p = Packet::ChannelRequest(ChannelRequest {
            num: 1,
            want_reply: true,
            req: ChannelReqType::Subsystem(Subsystem { subsystem: "sftp".into() }),
        });
        let mut buf = vec![];
        write_ssh_vec(&mut buf, &p).unwrap();
        // "subsystem" becomes "subsystXm"
        buf[16] = b'X';
        trace!("broken: {:?}", buf.hex_dump());
        let p2 = packet_from_bytes(&buf, &ParseContext::default()).unwrap();
        assert!(matches!(
            p2,
            Packet::ChannelRequest(ChannelRequest {
                num: 1,
                want_reply: true,
                req: ChannelReqType::Unknown(Unknown(b"subsystXm")),
            })
        ));
    }

    #[test]
    /// Unknown variants inside a blob are skipped over.
    fn unknown_variant_in_blob() {
        init_test_log();
        let p: Packet = UserauthRequest {
            username: "matt".into(),
            service: "connection",
            method: AuthMethod::PubKey(MethodPubKey {
                sig_algo: "something",
                pubkey: Blob(PubKey::Ed25519(Ed25519PubKey { key: BinString(b"zzzz") })),
                sig: Some(Blob(Signature::Ed25519(Ed25519Sig { sig: BinString(b"sighere") }))),
            }),
        }
        .into();

        let mut buf = vec![];
        write_ssh_vec(&mut buf, &p).unwrap();
        // change a byte in the "ssh-ed25519" key name
        buf[60] = b'F';
        let p2 = packet_from_bytes(&buf, &ParseContext::default()).unwrap();
        trace!("broken: {p2:#?}");
        assert!(matches!(
            p2,
            Packet::UserauthRequest(UserauthRequest {
                method: AuthMethod::PubKey(MethodPubKey {
                    pubkey: Blob(PubKey::Unknown(Unknown(b"ssF-ed25519"))),
                    sig: Some(Blob(Signature::Ed25519(_))),
                    ..
                }),
                ..
            })
        ));
    }

    #[test]
    fn global_request_skips_data() {
        // "tcpip-forward" with want_reply and address/port data
        let mut buf = vec![80u8];
        buf.extend_from_slice(&13u32.to_be_bytes());
        buf.extend_from_slice(b"tcpip-forward");
        buf.push(1);
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 22]);
        let p = packet_from_bytes(&buf, &ParseContext::default()).unwrap();
        let Packet::GlobalRequest(g) = p else { panic!() };
        assert!(g.want_reply);
        assert_eq!(g.req.to_string(), "tcpip-forward");
    }

    #[test]
    fn trailing_bytes() {
        let mut buf = vec![];
        write_ssh_vec(&mut buf, &Packet::ChannelEof(ChannelEof { num: 2 })).unwrap();
        buf.push(0);
        assert!(matches!(
            packet_from_bytes(&buf, &ParseContext::default()),
            Err(Error::WrongPacketLength)
        ));
    }
}
