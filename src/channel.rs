//! SSH channels, [RFC4254](https://tools.ietf.org/html/rfc4254) section 5.
//!
//! Only client-opened session channels are supported. Received data
//! is buffered per channel until the application reads it, and window
//! adjustments follow the application's reads.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use crate::config::{self, MAX_CHANNELS};
use crate::packets::{self, ChannelOpenType, ChannelReqType, Packet};
use crate::sshnames::*;
use crate::sshwire::BinString;
use crate::traffic::TrafSend;

/// A local channel number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanNum(pub u32);

impl fmt::Display for ChanNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of a channel open
#[derive(Debug, PartialEq)]
pub(crate) enum OpenStatus {
    Pending,
    Open,
    Failed { reason: u32, desc: String },
}

/// A `want_reply` channel request
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ReqStatus {
    None,
    Pending,
    Success,
    Failure,
}

pub(crate) struct Channels {
    ch: [Option<Channel>; MAX_CHANNELS],
}

impl Channels {
    pub fn new() -> Self {
        Channels { ch: Default::default() }
    }

    /// Returns the new channel and a `ChannelOpen` packet to send.
    pub fn open_session(&mut self) -> Result<(ChanNum, Packet<'static>)> {
        let num = self.unused_chan()?;
        let chan = Channel::new(num);
        let p = packets::ChannelOpen {
            num: num.0,
            initial_window: chan.recv.window as u32,
            max_packet: chan.recv.max_packet as u32,
            ty: ChannelOpenType::Session,
        }
        .into();
        self.ch[num.0 as usize] = Some(chan);
        trace!("opening channel {num}");
        Ok((num, p))
    }

    fn get_any(&self, num: ChanNum) -> Result<&Channel> {
        self.ch
            .get(num.0 as usize)
            // out of range
            .ok_or(Error::BadChannel { num: num.0 })?
            .as_ref()
            // unused channel
            .ok_or(Error::BadChannel { num: num.0 })
    }

    fn get_any_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        self.ch
            .get_mut(num.0 as usize)
            .ok_or(Error::BadChannel { num: num.0 })?
            .as_mut()
            .ok_or(Error::BadChannel { num: num.0 })
    }

    /// Excludes channels that aren't open yet
    fn get_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        let ch = self.get_any_mut(num)?;
        match ch.state {
            ChanState::Opening | ChanState::OpenFailed { .. } => {
                Err(Error::BadChannel { num: num.0 })
            }
            _ => Ok(ch),
        }
    }

    /// Returns the first available channel
    fn unused_chan(&self) -> Result<ChanNum> {
        self.ch
            .iter()
            .enumerate()
            .find_map(|(i, ch)| if ch.is_none() { Some(ChanNum(i as u32)) } else { None })
            .ok_or(Error::NotAvailable { what: "free channel" })
    }

    pub fn open_status(&self, num: ChanNum) -> Result<OpenStatus> {
        let ch = self.get_any(num)?;
        Ok(match &ch.state {
            ChanState::Opening => OpenStatus::Pending,
            ChanState::OpenFailed { reason, desc } => {
                OpenStatus::Failed { reason: *reason, desc: desc.clone() }
            }
            _ => OpenStatus::Open,
        })
    }

    pub fn req_status(&self, num: ChanNum) -> Result<ReqStatus> {
        Ok(self.get_any(num)?.req)
    }

    pub fn request_subsystem(
        &mut self,
        num: ChanNum,
        name: &str,
        s: &mut TrafSend,
    ) -> Result<()> {
        let ch = self.get_mut(num)?;
        if ch.req == ReqStatus::Pending {
            return Err(Error::bug());
        }
        let p = packets::ChannelRequest {
            num: ch.send_num()?,
            want_reply: true,
            req: ChannelReqType::Subsystem(packets::Subsystem { subsystem: name.into() }),
        };
        s.send(p)?;
        ch.req = ReqStatus::Pending;
        Ok(())
    }

    /// Sends as much of `data` as the peer's window and packet size allow.
    ///
    /// Returns `WouldBlock` if nothing can be sent.
    pub fn send_data(&mut self, num: ChanNum, data: &[u8], s: &mut TrafSend) -> Result<usize> {
        let ch = self.get_mut(num)?;
        if ch.sent_eof || ch.sent_close || ch.is_closed() {
            return Err(Error::ChannelEOF);
        }
        let send = ch.send.as_mut().trap()?;
        let len = data.len().min(send.window).min(send.max_packet);
        if len == 0 {
            return if data.is_empty() { Ok(0) } else { Err(Error::WouldBlock) };
        }
        send.window -= len;
        s.send(packets::ChannelData { num: send.num, data: BinString(&data[..len]) })?;
        Ok(len)
    }

    /// Copies received data to `buf`.
    ///
    /// Returns `WouldBlock` when no data is buffered, or `ChannelEOF`
    /// once the peer has sent EOF and the buffer is drained.
    pub fn read(&mut self, num: ChanNum, buf: &mut [u8], s: &mut TrafSend) -> Result<usize> {
        let ch = self.get_mut(num)?;
        if ch.rx.is_empty() {
            return if ch.have_recv_eof() { Err(Error::ChannelEOF) } else { Err(Error::WouldBlock) };
        }
        let len = buf.len().min(ch.rx.len());
        buf[..len].copy_from_slice(&ch.rx[..len]);
        ch.rx.drain(..len);
        ch.finished_input(len);
        if let Some(p) = ch.check_window_adjust()? {
            s.send(p)?;
        }
        Ok(len)
    }

    /// Closes a channel from our side. It is freed once the peer
    /// has also closed.
    pub fn close(&mut self, num: ChanNum, s: &mut TrafSend) -> Result<()> {
        let ch = self.get_any_mut(num)?;
        ch.app_done = true;
        match ch.state {
            ChanState::Opening => {
                // Closed when the confirmation arrives
                return Ok(());
            }
            ChanState::OpenFailed { .. } => {
                self.ch[num.0 as usize] = None;
                return Ok(());
            }
            _ => (),
        }
        if !ch.sent_close {
            s.send(packets::ChannelClose { num: ch.send_num()? })?;
            ch.sent_close = true;
        }
        self.maybe_remove(num);
        Ok(())
    }

    fn maybe_remove(&mut self, num: ChanNum) {
        if let Some(ch) = self.ch.get_mut(num.0 as usize) {
            if ch.as_ref().is_some_and(|c| c.app_done && c.sent_close && c.is_closed()) {
                trace!("removing channel {num}");
                *ch = None;
            }
        }
    }

    pub fn exit_status(&self, num: ChanNum) -> Option<u32> {
        self.get_any(num).ok().and_then(|c| c.exit_status)
    }

    fn dispatch_inner(&mut self, packet: Packet<'_>, s: &mut TrafSend) -> Result<()> {
        match packet {
            Packet::ChannelOpen(p) => {
                // We don't accept forwarding or agent channels
                let reason = match p.ty {
                    ChannelOpenType::Unknown(u) => {
                        debug!("Rejecting unknown channel type '{u}'");
                        ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE
                    }
                    ChannelOpenType::Session => ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED,
                };
                s.send(packets::ChannelOpenFailure {
                    num: p.num,
                    reason: reason as u32,
                    desc: "".into(),
                    lang: "".into(),
                })?;
            }

            Packet::ChannelOpenConfirmation(p) => {
                let num = ChanNum(p.num);
                let ch = self.get_any_mut(num)?;
                if !matches!(ch.state, ChanState::Opening) {
                    trace!("Bad channel state");
                    return Err(Error::SSHProtoError);
                }
                debug_assert!(ch.send.is_none());
                ch.send = Some(ChanDir {
                    num: p.sender_num,
                    max_packet: p.max_packet as usize,
                    window: p.initial_window as usize,
                });
                ch.state = ChanState::Normal;
                debug!("channel {num} open");
                if ch.app_done {
                    // Closed while opening
                    s.send(packets::ChannelClose { num: p.sender_num })?;
                    ch.sent_close = true;
                }
            }

            Packet::ChannelOpenFailure(p) => {
                let ch = self.get_any_mut(ChanNum(p.num))?;
                if !matches!(ch.state, ChanState::Opening) {
                    trace!("open failure late?");
                    return Err(Error::SSHProtoError);
                }
                debug!("channel {} open failed: {}", p.num, p.desc.to_lossy());
                if ch.app_done {
                    self.ch[p.num as usize] = None;
                } else {
                    ch.state = ChanState::OpenFailed { reason: p.reason, desc: p.desc.to_lossy() };
                }
            }

            Packet::ChannelWindowAdjust(p) => {
                let send = self.get_mut(ChanNum(p.num))?.send.as_mut().trap()?;
                send.window = send.window.saturating_add(p.adjust as usize);
            }

            Packet::ChannelData(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                ch.consume_window(p.data.0.len())?;
                if ch.app_done {
                    trace!("discarding data for closing channel");
                } else {
                    ch.rx.extend_from_slice(p.data.0);
                }
            }

            Packet::ChannelDataExt(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                ch.consume_window(p.data.0.len())?;
                if p.code == SSH_EXTENDED_DATA_STDERR {
                    debug!("channel {} stderr: {}", p.num, String::from_utf8_lossy(p.data.0));
                } else {
                    debug!("Ignoring unexpected dt data, code {}", p.code);
                }
                ch.finished_input(p.data.0.len());
                if let Some(p) = ch.check_window_adjust()? {
                    s.send(p)?;
                }
            }

            Packet::ChannelEof(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                trace!("channel {} eof", p.num);
                if !ch.is_closed() {
                    ch.state = ChanState::RecvEof;
                }
            }

            Packet::ChannelClose(p) => {
                let num = ChanNum(p.num);
                let ch = self.get_mut(num)?;
                trace!("channel {num} close");
                if !ch.sent_close {
                    s.send(packets::ChannelClose { num: ch.send_num()? })?;
                    ch.sent_close = true;
                }
                ch.state = ChanState::RecvClose;
                self.maybe_remove(num);
            }

            Packet::ChannelRequest(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                let success = match p.req {
                    ChannelReqType::ExitStatus(e) => {
                        debug!("channel {} exit status {}", p.num, e.status);
                        ch.exit_status = Some(e.status);
                        true
                    }
                    ChannelReqType::Unknown(u) => {
                        debug!("Ignoring channel request \"{u}\"");
                        false
                    }
                    ChannelReqType::Subsystem(_) => {
                        warn!("Server sent a subsystem request");
                        false
                    }
                };
                if p.want_reply {
                    let num = ch.send_num()?;
                    if success {
                        s.send(packets::ChannelSuccess { num })?;
                    } else {
                        s.send(packets::ChannelFailure { num })?;
                    }
                }
            }

            Packet::ChannelSuccess(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                if ch.req != ReqStatus::Pending {
                    return Err(Error::SSHProtoError);
                }
                ch.req = ReqStatus::Success;
            }

            Packet::ChannelFailure(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                if ch.req != ReqStatus::Pending {
                    return Err(Error::SSHProtoError);
                }
                ch.req = ReqStatus::Failure;
            }

            _ => Error::bug_msg("unreachable")?,
        };
        Ok(())
    }

    /// Handles a channel packet. Unknown channel numbers are ignored.
    pub fn dispatch(&mut self, packet: Packet<'_>, s: &mut TrafSend) -> Result<()> {
        let r = self.dispatch_inner(packet, s);

        match r {
            Err(Error::BadChannel { num }) => {
                warn!("Ignoring bad channel number {num}");
                Ok(())
            }
            r => r,
        }
    }
}

#[derive(Debug)]
struct ChanDir {
    num: u32,
    max_packet: usize,
    window: usize,
}

#[derive(Debug)]
enum ChanState {
    /// Waiting for the peer to confirm
    Opening,
    OpenFailed { reason: u32, desc: String },
    Normal,
    RecvEof,
    RecvClose,
}

struct Channel {
    state: ChanState,
    sent_close: bool,
    sent_eof: bool,

    /// Our side
    recv: ChanDir,
    /// The peer's side, set once the channel is open
    send: Option<ChanDir>,

    /// Bytes read by the application, not yet advertised in a window adjustment
    pending_adjust: usize,
    full_window: usize,

    /// Data waiting for the application
    rx: Vec<u8>,

    req: ReqStatus,
    exit_status: Option<u32>,

    /// The application has closed the channel
    app_done: bool,
}

impl Channel {
    fn new(num: ChanNum) -> Self {
        Channel {
            state: ChanState::Opening,
            sent_close: false,
            sent_eof: false,
            recv: ChanDir {
                num: num.0,
                max_packet: config::DEFAULT_MAX_PACKET,
                window: config::DEFAULT_WINDOW,
            },
            send: None,
            pending_adjust: 0,
            full_window: config::DEFAULT_WINDOW,
            rx: Vec::new(),
            req: ReqStatus::None,
            exit_status: None,
            app_done: false,
        }
    }

    fn send_num(&self) -> Result<u32> {
        Ok(self.send.as_ref().trap()?.num)
    }

    fn consume_window(&mut self, len: usize) -> Result<()> {
        if len > self.recv.window || len > self.recv.max_packet {
            debug!("Data {len} exceeds window {} or max packet", self.recv.window);
            return Err(Error::SSHProtoError);
        }
        self.recv.window -= len;
        Ok(())
    }

    fn finished_input(&mut self, len: usize) {
        self.pending_adjust = self.pending_adjust.saturating_add(len)
    }

    fn have_recv_eof(&self) -> bool {
        matches!(self.state, ChanState::RecvEof | ChanState::RecvClose)
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, ChanState::RecvClose)
    }

    fn check_window_adjust(&mut self) -> Result<Option<Packet<'static>>> {
        let num = self.send.as_ref().trap()?.num;
        if self.pending_adjust > self.full_window / 2 {
            let adjust = self.pending_adjust as u32;
            self.recv.window += self.pending_adjust;
            self.pending_adjust = 0;
            let p = packets::ChannelWindowAdjust { num, adjust }.into();
            Ok(Some(p))
        } else {
            Ok(None)
        }
    }
}
