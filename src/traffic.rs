//! Packet framing between the transport and decoded [`Packet`]s.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use pretty_hex::PrettyHex;
use zeroize::Zeroize;

use crate::encrypt::{KeyState, Keys, SSH_PAYLOAD_START};
use crate::ident::{self, RemoteVersion};
use crate::packets::{self, Packet};
use crate::sshwire;

/// Largest incoming packet, including framing and MAC.
///
/// RFC4253 requires 35000, channel data is limited by our
/// advertised maximum packet size.
const MAX_RX_PACKET: usize = 40 * 1024;

/// Incoming packets, one at a time.
pub(crate) struct TrafIn {
    /// Contains ciphertext or cleartext, decrypted in-place.
    /// Only contains a single SSH packet at a time.
    buf: Vec<u8>,
    state: RxState,
}

/// Outgoing packets, encrypted as they are queued.
pub(crate) struct TrafOut {
    /// May contain multiple SSH packets to write out
    buf: Vec<u8>,
    /// Bytes of `buf` already written to the transport
    idx: usize,
}

#[derive(Debug)]
enum RxState {
    /// Awaiting read, buffer is unused
    Idle,
    /// Reading initial encrypted block for packet length. idx > 0.
    ReadInitial { idx: usize },
    /// Reading remainder of encrypted packet
    Read { idx: usize, expect: usize },
    /// Whole encrypted packet has been read
    ReadComplete { len: usize },
    /// Decrypted complete input payload
    InPayload { len: usize, seq: u32 },
}

impl TrafIn {
    pub fn new() -> Self {
        Self { buf: Vec::new(), state: RxState::Idle }
    }

    pub fn ready_input(&self) -> bool {
        matches!(self.state, RxState::Idle | RxState::ReadInitial { .. } | RxState::Read { .. })
    }

    /// Returns the number of bytes consumed.
    ///
    /// Consumes nothing while a payload is waiting for
    /// [`done_payload()`](Self::done_payload).
    pub fn input(
        &mut self,
        keys: &mut KeyState,
        remote_version: &mut RemoteVersion,
        buf: &[u8],
    ) -> Result<usize> {
        if !self.ready_input() {
            return Ok(0);
        }

        let mut inlen = 0;
        if remote_version.version().is_none() {
            // Handle initial version string
            inlen += remote_version.consume(buf)?;
        }
        let buf = &buf[inlen..];

        if remote_version.version().is_some() {
            inlen += self.fill_input(keys, buf)?;
        }
        Ok(inlen)
    }

    /// Called when `payload()` is complete. Clears the plaintext.
    pub fn done_payload(&mut self) {
        if let RxState::InPayload { .. } = self.state {
            self.buf.zeroize();
            self.buf.clear();
            self.state = RxState::Idle;
        }
    }

    /// Returns a reference to the decrypted payload buffer if ready,
    /// and the `seq` of that packet.
    pub fn payload(&self) -> Option<(&[u8], u32)> {
        match self.state {
            RxState::InPayload { len, seq } => {
                Some((&self.buf[SSH_PAYLOAD_START..SSH_PAYLOAD_START + len], seq))
            }
            _ => None,
        }
    }

    fn fill_input(&mut self, keys: &mut KeyState, buf: &[u8]) -> Result<usize> {
        let size_block = keys.size_block_dec();
        // 'r' is the remaining input, a slice that moves along.
        // Used to calculate the size to return
        let mut r = buf;

        // Fill the initial block from either Idle with input,
        // partial initial block
        if let Some(idx) = match self.state {
            RxState::Idle if !r.is_empty() => Some(0),
            RxState::ReadInitial { idx } => Some(idx),
            _ => None,
        } {
            let need = (size_block - idx).min(r.len());
            let x;
            (x, r) = r.split_at(need);
            self.buf.extend_from_slice(x);
            self.state = RxState::ReadInitial { idx: idx + need }
        }

        // Have enough input now to decrypt the packet length
        if let RxState::ReadInitial { idx } = self.state {
            if idx >= size_block {
                let total_len = keys.decrypt_first_block(&mut self.buf[..size_block])? as usize;
                if total_len > MAX_RX_PACKET || total_len < size_block {
                    return Err(Error::BigPacket { size: total_len });
                }
                self.state = RxState::Read { idx, expect: total_len }
            }
        }

        // Know expected length, read until the end of the packet.
        if let RxState::Read { ref mut idx, expect } = self.state {
            let need = (expect - *idx).min(r.len());
            let x;
            (x, r) = r.split_at(need);
            self.buf.extend_from_slice(x);
            *idx += need;
            if *idx == expect {
                self.state = RxState::ReadComplete { len: expect }
            }
        }

        if let RxState::ReadComplete { len } = self.state {
            let seq = keys.recv_seq();
            let payload_len = keys.decrypt(&mut self.buf[..len])?;
            self.state = RxState::InPayload { len: payload_len, seq }
        }

        Ok(buf.len() - r.len())
    }
}

impl TrafOut {
    pub fn new() -> Self {
        Self { buf: Vec::new(), idx: 0 }
    }

    /// Serializes and encrypts a packet to send
    pub fn send_packet(&mut self, p: Packet, keys: &mut KeyState) -> Result<()> {
        trace!("send_packet {:?}", p.message_num());

        match p.category() {
            packets::Category::All | packets::Category::Kex => (), // OK cleartext
            _ => {
                if keys.is_cleartext() {
                    return Error::bug_msg("send cleartext");
                }
            }
        }

        // Payload starts after the length and padding bytes
        // which get filled by encrypt()
        let start = self.buf.len();
        self.buf.resize(start + SSH_PAYLOAD_START, 0);
        let plen = sshwire::write_ssh_vec(&mut self.buf, &p)?;
        trace!("Sending {p:?}");
        trace!(
            "new {plen} {:?}",
            (&self.buf[start + SSH_PAYLOAD_START..]).hex_dump()
        );

        self.buf.resize(start + SSH_PAYLOAD_START + plen + keys.overhead(), 0);
        // Encrypt in place
        let elen = keys.encrypt(plen, &mut self.buf[start..])?;
        self.buf.truncate(start + elen);
        Ok(())
    }

    pub fn send_version(&mut self) {
        self.buf.extend_from_slice(&ident::our_version_line());
    }

    pub fn output_pending(&self) -> bool {
        self.idx < self.buf.len()
    }

    /// Output waiting to be written to the transport
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.idx..]
    }

    /// Marks `n` bytes of [`pending()`](Self::pending) as written
    pub fn consume(&mut self, n: usize) {
        self.idx = (self.idx + n).min(self.buf.len());
        if self.idx == self.buf.len() {
            self.buf.clear();
            self.idx = 0;
        }
    }

    #[cfg(test)]
    pub fn take_output(&mut self) -> Vec<u8> {
        let v = self.pending().to_vec();
        self.consume(v.len());
        v
    }

    pub fn sender<'s>(&'s mut self, keys: &'s mut KeyState) -> TrafSend<'s> {
        TrafSend { out: self, keys }
    }
}

/// Convenience to pass TrafOut with keys
pub(crate) struct TrafSend<'s> {
    out: &'s mut TrafOut,
    keys: &'s mut KeyState,
}

impl TrafSend<'_> {
    pub fn send<'p, P: Into<Packet<'p>>>(&mut self, p: P) -> Result<()> {
        self.out.send_packet(p.into(), self.keys)
    }

    pub fn send_version(&mut self) {
        self.out.send_version()
    }

    pub fn rekey(&mut self, keys: Keys) {
        self.keys.rekey(keys)
    }

    /// Resets sequence numbers after `SSH_MSG_NEWKEYS`.
    ///
    /// Must only be called when nothing has been sent since our own `NEWKEYS`.
    pub fn enable_strict_kex(&mut self) {
        self.keys.reset_seq()
    }

    pub fn recv_seq(&self) -> u32 {
        self.keys.recv_seq()
    }
}
