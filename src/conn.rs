//! Represents the state of a SSH connection.
//!
//! `Conn` doesn't perform any IO. Payloads are passed in by the
//! [`Session`](crate::Session), and replies are queued with a [`TrafSend`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use pretty_hex::PrettyHex;

use crate::channel::Channels;
use crate::cliauth::CliAuth;
use crate::ident::RemoteVersion;
use crate::kex::{AlgoConfig, Kex, SessId};
use crate::packets::{self, Category, Packet, ParseContext};
use crate::sshwire;
use crate::traffic::TrafSend;

/// The core state of a SSH client connection.
pub(crate) struct Conn {
    state: ConnState,

    // State of any current Key Exchange
    kex: Kex,

    sess_id: Option<SessId>,

    algo_conf: AlgoConfig,

    pub(crate) parse_ctx: ParseContext,

    pub(crate) remote_version: RemoteVersion,

    /// Server host key from the first exchange, SSH wire format
    hostkey: Option<Vec<u8>>,

    pub(crate) auth: CliAuth,

    pub(crate) channels: Channels,
}

#[derive(Debug)]
enum ConnState {
    /// The initial state
    SendIdent,
    /// Prior to SSH binary packet protocol, receiving remote version identification
    ReceiveIdent,
    /// Waiting for first Kex to complete
    FirstKex,
    /// Binary protocol has started, auth hasn't succeeded
    PreAuth,
    /// After auth success
    Authed,
}

// must_use so return values can't be forgotten in Conn::dispatch_packet
#[must_use]
#[derive(Debug, Default, PartialEq)]
pub(crate) enum DispatchEvent {
    /// The peer sent `SSH_MSG_DISCONNECT`
    Disconnect { reason: u32, desc: String },
    /// NewKeys was received
    KexDone,
    /// Connection state has changed, should poll again
    Progressed,
    /// No event
    #[default]
    None,
}

impl Conn {
    pub fn new() -> Result<Self> {
        Ok(Conn {
            state: ConnState::SendIdent,
            kex: Kex::new(),
            sess_id: None,
            algo_conf: AlgoConfig::new(true)?,
            parse_ctx: ParseContext::new(),
            remote_version: RemoteVersion::new(),
            hostkey: None,
            auth: CliAuth::new(),
            channels: Channels::new(),
        })
    }

    /// Updates `ConnState` and sends any packets required to progress the connection state.
    pub fn progress(&mut self, s: &mut TrafSend) -> Result<DispatchEvent> {
        let mut ev = DispatchEvent::None;
        match self.state {
            ConnState::SendIdent => {
                s.send_version();
                // send early to avoid round trip latency
                self.kex.send_kexinit(&self.algo_conf, s)?;
                ev = DispatchEvent::Progressed;
                self.state = ConnState::ReceiveIdent
            }
            ConnState::ReceiveIdent => {
                if let Some(v) = self.remote_version.version() {
                    debug!("Server version {}", String::from_utf8_lossy(v));
                    ev = DispatchEvent::Progressed;
                    self.state = ConnState::FirstKex
                }
            }
            ConnState::FirstKex => {
                if self.sess_id.is_some() {
                    ev = DispatchEvent::Progressed;
                    self.state = ConnState::PreAuth
                }
            }
            ConnState::PreAuth => {
                if self.auth.is_authed() {
                    ev = DispatchEvent::Progressed;
                    self.state = ConnState::Authed
                }
            }
            ConnState::Authed => (),
        }
        if ev != DispatchEvent::None {
            trace!("-> {:?}", self.state);
        }
        Ok(ev)
    }

    /// Our version has been queued, packets may follow
    pub fn initial_sent(&self) -> bool {
        !matches!(self.state, ConnState::SendIdent)
    }

    /// The first key exchange has completed
    pub fn kex_done(&self) -> bool {
        matches!(self.state, ConnState::PreAuth | ConnState::Authed)
    }

    pub fn is_authed(&self) -> bool {
        matches!(self.state, ConnState::Authed)
    }

    pub fn sess_id(&self) -> Option<&SessId> {
        self.sess_id.as_ref()
    }

    /// The server's host key blob
    pub fn hostkey(&self) -> Option<&[u8]> {
        self.hostkey.as_deref()
    }

    /// Handles a decrypted payload. Replies are queued to `s`.
    pub fn handle_payload(
        &mut self,
        payload: &[u8],
        seq: u32,
        s: &mut TrafSend,
    ) -> Result<DispatchEvent> {
        match sshwire::packet_from_bytes(payload, &self.parse_ctx) {
            Ok(p) => {
                let num = p.message_num() as u8;
                let r = self.dispatch_packet(p, s);
                if let Err(Error::SSHProtoError | Error::PacketWrong) = r {
                    debug!("Error handling {num} packet")
                }
                r
            }
            Err(Error::UnknownPacket { number }) => {
                trace!("Unimplemented packet type {number}");
                s.send(packets::Unimplemented { seq })?;
                Ok(DispatchEvent::None)
            }
            Err(e) => {
                debug!("Error decoding packet: {e}");
                trace!("Input:\n{:#?}", payload.hex_dump());
                Err(e)
            }
        }
    }

    /// Check that a packet is received in the correct state
    fn check_packet(&self, p: &Packet) -> Result<()> {
        let r = if self.is_first_kex() && self.kex.is_strict() {
            // Strict Kex doesn't allow even packets like Ignore or Debug
            match p.category() {
                Category::Kex => Ok(()),
                _ => {
                    debug!("Non-kex packet during strict kex");
                    Err(Error::SSHProtoError)
                }
            }
        } else if !matches!(self.kex, Kex::Idle | Kex::KexInit { .. }) {
            // Normal KEX only allows certain packets
            match p.category() {
                Category::All | Category::Kex => Ok(()),
                _ => {
                    debug!("Invalid packet during kex");
                    Err(Error::SSHProtoError)
                }
            }
        } else {
            match p.category() {
                Category::All | Category::Kex => Ok(()),
                Category::Auth => match self.state {
                    ConnState::PreAuth | ConnState::Authed => Ok(()),
                    _ => Err(Error::SSHProtoError),
                },
                Category::Sess => match self.state {
                    ConnState::Authed => Ok(()),
                    _ => Err(Error::SSHProtoError),
                },
            }
        };

        if r.is_err() {
            debug!("Received unexpected packet {}", p.message_num() as u8);
            trace!("state is {:?}", self.state);
        }
        r
    }

    fn is_first_kex(&self) -> bool {
        self.sess_id.is_none()
    }

    fn dispatch_packet(&mut self, packet: Packet, s: &mut TrafSend) -> Result<DispatchEvent> {
        trace!("Incoming {packet:#?}");
        let mut ev = DispatchEvent::None;

        self.check_packet(&packet)?;

        match packet {
            Packet::KexInit(k) => {
                if !self.is_first_kex() {
                    // Sessions are short lived, rekeying isn't implemented.
                    debug!("Server requested a rekey");
                    return Err(Error::SSHProtoUnsupported);
                }
                self.kex.handle_kexinit(
                    k,
                    true,
                    &self.algo_conf,
                    &self.remote_version,
                    true,
                    s,
                )?;
            }
            Packet::KexDHInit(_) => {
                debug!("Server sent kexdhinit");
                return Err(Error::SSHProtoError);
            }
            Packet::KexDHReply(p) => {
                self.kex.handle_kexdhreply(&p, s)?;
                if self.hostkey.is_none() {
                    let mut k = Vec::new();
                    sshwire::write_ssh_vec(&mut k, &p.k_s.0)?;
                    self.hostkey = Some(k);
                }
            }
            Packet::NewKeys(_) => {
                self.kex.handle_newkeys(&mut self.sess_id, s)?;
                ev = DispatchEvent::KexDone;
            }
            Packet::ServiceRequest(_) => {
                debug!("Server sent a service request");
                return Err(Error::SSHProtoError);
            }
            Packet::ServiceAccept(p) => {
                self.auth.service_accept(&p)?;
            }
            Packet::Ignore(_) => {
                // nothing to do
            }
            Packet::Unimplemented(_) => {
                warn!("Received SSH unimplemented message");
            }
            Packet::DebugPacket(p) => {
                let level = match p.always_display {
                    true => log::Level::Info,
                    false => log::Level::Debug,
                };
                log!(level, "SSH debug message from remote host: {}", p.message.to_lossy());
            }
            Packet::Disconnect(p) => {
                let desc = p.desc.to_lossy();
                debug!("Received disconnect, reason {}: {desc}", p.reason);
                ev = DispatchEvent::Disconnect { reason: p.reason, desc };
            }
            Packet::UserauthRequest(_) => {
                debug!("Server sent an auth request");
                return Err(Error::SSHProtoError);
            }
            Packet::UserauthFailure(p) => {
                self.auth.failure(&p, &mut self.parse_ctx)?;
            }
            Packet::UserauthSuccess(_) => {
                self.auth.success(&mut self.parse_ctx)?;
                // Session packets may follow immediately
                self.state = ConnState::Authed;
                ev = DispatchEvent::Progressed;
            }
            Packet::UserauthBanner(p) => {
                self.auth.banner(&p);
            }
            Packet::Userauth60(p) => {
                self.auth.auth60(&p, &mut self.parse_ctx)?;
            }
            Packet::GlobalRequest(p) => {
                trace!("Got global request {}", p.req);
                if p.want_reply {
                    s.send(packets::RequestFailure {})?;
                }
            }
            Packet::RequestSuccess(_) | Packet::RequestFailure(_) => {
                // We never send global requests
                debug!("Unexpected global request reply");
                return Err(Error::SSHProtoError);
            }
            Packet::ChannelOpen(_)
            | Packet::ChannelOpenConfirmation(_)
            | Packet::ChannelOpenFailure(_)
            | Packet::ChannelWindowAdjust(_)
            | Packet::ChannelData(_)
            | Packet::ChannelDataExt(_)
            | Packet::ChannelEof(_)
            | Packet::ChannelClose(_)
            | Packet::ChannelRequest(_)
            | Packet::ChannelSuccess(_)
            | Packet::ChannelFailure(_) => {
                self.channels.dispatch(packet, s)?;
            }
        };
        Ok(ev)
    }
}
