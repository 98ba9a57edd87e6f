//! Binary packet framing, encryption and integrity,
//! [RFC4253](https://tools.ietf.org/html/rfc4253) section 6.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use aes::cipher::{BlockSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use core::fmt;
use core::num::Wrapping;

use hmac::Mac;
use sha2::digest::OutputSizeUser;
use zeroize::Zeroizing;

use crate::kex::{self, KexOutput, SessId};
use crate::random;
use crate::ssh_chapoly::SSHChaPoly;
use crate::sshnames::*;

type Aes256Ctr32BE = ctr::Ctr32BE<aes::Aes256>;
type HmacSha256 = hmac::Hmac<sha2::Sha256>;

// RFC4253 Section 6. Including length u32 length field, excluding MAC
const SSH_MIN_PACKET_SIZE: usize = 16;
const SSH_MIN_PADLEN: usize = 4;
const SSH_MIN_BLOCK: usize = 8;
pub const SSH_LENGTH_SIZE: usize = 4;
pub const SSH_PAYLOAD_START: usize = SSH_LENGTH_SIZE + 1;

/// aes256-ctr has the largest IV
const MAX_IV_LEN: usize = 16;
/// chacha20-poly1305 has the largest key. Also covers MAC keys.
const MAX_KEY_LEN: usize = 64;

/// Current [`Keys`] and the packet sequence numbers, one per session.
#[derive(Debug)]
pub(crate) struct KeyState {
    keys: Keys,
    // Sequence numbers carry across rekeying, except for strict kex
    seq_encrypt: Wrapping<u32>,
    seq_decrypt: Wrapping<u32>,
}

impl KeyState {
    pub fn new_cleartext() -> Self {
        KeyState {
            keys: Keys::new_cleartext(),
            seq_encrypt: Wrapping(0),
            seq_decrypt: Wrapping(0),
        }
    }

    pub fn is_cleartext(&self) -> bool {
        matches!(self.keys.enc, CipherKey::NoCipher)
            || matches!(self.keys.dec, CipherKey::NoCipher)
    }

    pub fn rekey(&mut self, keys: Keys) {
        self.keys = keys
    }

    /// Strict kex resets both sequence numbers after each `SSH_MSG_NEWKEYS`
    pub fn reset_seq(&mut self) {
        self.seq_encrypt = Wrapping(0);
        self.seq_decrypt = Wrapping(0);
    }

    pub fn recv_seq(&self) -> u32 {
        self.seq_decrypt.0
    }

    /// Decrypts the first block in the buffer, returning the total packet length.
    pub fn decrypt_first_block(&mut self, buf: &mut [u8]) -> Result<u32> {
        self.keys.decrypt_first_block(buf, self.seq_decrypt.0)
    }

    /// Decrypts bytes 4 onwards of the buffer and validates the tag or MAC.
    /// Returns the payload length.
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize> {
        let e = self.keys.decrypt(buf, self.seq_decrypt.0);
        self.seq_decrypt += 1;
        e
    }

    /// Frames and encrypts a packet in-place in `buf`.
    ///
    /// The payload of `payload_len` is already written at `SSH_PAYLOAD_START`.
    /// Returns the total length to send.
    pub fn encrypt(&mut self, payload_len: usize, buf: &mut [u8]) -> Result<usize> {
        let e = self.keys.encrypt(payload_len, buf, self.seq_encrypt.0);
        self.seq_encrypt += 1;
        e
    }

    pub fn size_block_dec(&self) -> usize {
        self.keys.dec.size_block()
    }

    /// Bytes of framing added to a payload, at most.
    pub fn overhead(&self) -> usize {
        SSH_PAYLOAD_START
            + SSH_MIN_PADLEN
            + 2 * self.keys.enc.size_block()
            + self.keys.integ_enc.size_out()
    }
}

/// Keys for both directions
#[derive(Debug)]
pub(crate) struct Keys {
    enc: CipherKey,
    dec: CipherKey,

    integ_enc: IntegKey,
    integ_dec: IntegKey,
}

impl Keys {
    fn new_cleartext() -> Self {
        Keys {
            enc: CipherKey::NoCipher,
            dec: CipherKey::NoCipher,
            integ_enc: IntegKey::NoInteg,
            integ_dec: IntegKey::NoInteg,
        }
    }

    /// Derives keys for negotiated `algos` from a completed exchange.
    pub fn derive(output: &KexOutput, sess_id: &SessId, algos: &kex::Algos) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; MAX_KEY_LEN]);
        let mut iv = Zeroizing::new([0u8; MAX_IV_LEN]);

        // RFC4253 7.2 letters are from the client's perspective
        let (iv_e, iv_d, k_e, k_d, i_e, i_d) = if algos.is_client {
            ('A', 'B', 'C', 'D', 'E', 'F')
        } else {
            ('B', 'A', 'D', 'C', 'F', 'E')
        };

        let enc = {
            let i = output.compute_key(iv_e, algos.cipher_enc.iv_len(), &mut iv[..], sess_id)?;
            let k = output.compute_key(k_e, algos.cipher_enc.key_len(), &mut key[..], sess_id)?;
            CipherKey::from_cipher(&algos.cipher_enc, k, i)?
        };

        let dec = {
            let i = output.compute_key(iv_d, algos.cipher_dec.iv_len(), &mut iv[..], sess_id)?;
            let k = output.compute_key(k_d, algos.cipher_dec.key_len(), &mut key[..], sess_id)?;
            CipherKey::from_cipher(&algos.cipher_dec, k, i)?
        };

        let integ_enc = {
            let k = output.compute_key(i_e, algos.integ_enc.key_len(), &mut key[..], sess_id)?;
            IntegKey::from_integ(&algos.integ_enc, k)?
        };

        let integ_dec = {
            let k = output.compute_key(i_d, algos.integ_dec.key_len(), &mut key[..], sess_id)?;
            IntegKey::from_integ(&algos.integ_dec, k)?
        };

        Ok(Keys { enc, dec, integ_enc, integ_dec })
    }

    /// Decrypts the first block in the buffer, returning the length of the
    /// total SSH packet (including length and mac).
    ///
    /// For aes256-ctr the whole first block is decrypted in place, chacha
    /// only reads the length and leaves `buf` untouched.
    fn decrypt_first_block(&mut self, buf: &mut [u8], seq: u32) -> Result<u32> {
        let block = self.dec.size_block();
        if buf.len() < block {
            return Err(Error::bug());
        }

        let len = match &mut self.dec {
            CipherKey::ChaPoly(k) => k.packet_length(seq, buf)?,
            CipherKey::Aes256Ctr(a) => {
                a.apply_keystream(&mut buf[..block]);
                read_length(buf)?
            }
            CipherKey::NoCipher => read_length(buf)?,
        };

        let total_len = len
            .checked_add((SSH_LENGTH_SIZE + self.integ_dec.size_out()) as u32)
            .ok_or(Error::BadDecrypt)?;

        Ok(total_len)
    }

    /// Decrypts the whole packet buffer and validates the tag or MAC.
    /// Returns the payload length.
    fn decrypt(&mut self, buf: &mut [u8], seq: u32) -> Result<usize> {
        let size_block = self.dec.size_block();
        let size_integ = self.integ_dec.size_out();

        if buf.len() < size_block + size_integ
            || buf.len() < SSH_MIN_PACKET_SIZE + size_integ
        {
            debug!("Bad packet, {} is too short", buf.len());
            return Err(Error::SSHProtoError);
        }

        // AEAD ciphers don't count the length field in the block multiple
        let sublength = if self.dec.is_aead() { SSH_LENGTH_SIZE } else { 0 };
        let len = buf.len() - size_integ - sublength;
        if len % size_block != 0 {
            debug!("Bad packet, not multiple of block size");
            return Err(Error::SSHProtoError);
        }

        let (data, mac) = buf.split_at_mut(buf.len() - size_integ);

        match &mut self.dec {
            CipherKey::ChaPoly(k) => {
                k.decrypt(seq, data, mac).map_err(|_| {
                    info!("Packet integrity failed");
                    Error::BadDecrypt
                })?;
            }
            CipherKey::Aes256Ctr(a) => {
                // first block was done by decrypt_first_block()
                a.apply_keystream(&mut data[size_block..]);
            }
            CipherKey::NoCipher => {}
        }

        if let IntegKey::HmacSha256(k) = &self.integ_dec {
            let mut h = HmacSha256::new_from_slice(&k[..]).trap()?;
            h.update(&seq.to_be_bytes());
            h.update(data);
            h.verify_slice(mac).map_err(|_| {
                info!("Packet integrity failed");
                Error::BadDecrypt
            })?;
        }

        let padlen = data[SSH_LENGTH_SIZE] as usize;
        if padlen < SSH_MIN_PADLEN {
            debug!("Packet padding too short");
            return Err(Error::SSHProtoError);
        }

        let payload_len = data.len().checked_sub(SSH_PAYLOAD_START + padlen).ok_or_else(|| {
            debug!("Bad padding length");
            Error::SSHProtoError
        })?;

        Ok(payload_len)
    }

    /// Padding must meet the minimum packet length and minimum padding size,
    /// and make the encrypted length a multiple of the block length
    fn calc_encrypt_pad(&self, payload_len: usize) -> usize {
        let size_block = self.enc.size_block();
        let len = 1 + payload_len + if self.enc.is_aead() { 0 } else { SSH_LENGTH_SIZE };

        let mut padlen = size_block - len % size_block;
        if padlen < SSH_MIN_PADLEN {
            padlen += size_block
        }
        if SSH_PAYLOAD_START + payload_len + padlen < SSH_MIN_PACKET_SIZE {
            padlen += size_block;
        }
        padlen
    }

    fn encrypt(&mut self, payload_len: usize, buf: &mut [u8], seq: u32) -> Result<usize> {
        let size_integ = self.integ_enc.size_out();
        let padlen = self.calc_encrypt_pad(payload_len);
        // len is everything except the MAC
        let len = SSH_PAYLOAD_START + payload_len + padlen;

        if len + size_integ > buf.len() {
            error!("Output buffer {} is too small for packet", buf.len());
            return Err(Error::NoRoom);
        }

        buf[..SSH_LENGTH_SIZE].copy_from_slice(&((len - SSH_LENGTH_SIZE) as u32).to_be_bytes());
        buf[SSH_LENGTH_SIZE] = padlen as u8;
        let pad_start = SSH_PAYLOAD_START + payload_len;
        random::fill_random(&mut buf[pad_start..len])?;

        let (enc, rest) = buf.split_at_mut(len);
        let mac = &mut rest[..size_integ];

        // encrypt-and-mac, the MAC is over cleartext
        if let IntegKey::HmacSha256(k) = &self.integ_enc {
            let mut h = HmacSha256::new_from_slice(&k[..]).trap()?;
            h.update(&seq.to_be_bytes());
            h.update(enc);
            mac.copy_from_slice(&h.finalize().into_bytes());
        }

        match &mut self.enc {
            CipherKey::ChaPoly(k) => k.encrypt(seq, enc, mac)?,
            CipherKey::Aes256Ctr(a) => a.apply_keystream(enc),
            CipherKey::NoCipher => {}
        }

        Ok(len + size_integ)
    }
}

fn read_length(buf: &[u8]) -> Result<u32> {
    let b = buf.get(..SSH_LENGTH_SIZE).and_then(|b| b.try_into().ok()).trap()?;
    Ok(u32::from_be_bytes(b))
}

/// A negotiated cipher, prior to keying.
#[derive(Debug, Clone)]
pub(crate) enum Cipher {
    ChaPoly,
    Aes256Ctr,
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => SSH_NAME_CHAPOLY,
            Self::Aes256Ctr => SSH_NAME_AES256_CTR,
        };
        write!(f, "{n}")
    }
}

impl Cipher {
    /// Must be passed a known name
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_CHAPOLY => Ok(Cipher::ChaPoly),
            SSH_NAME_AES256_CTR => Ok(Cipher::Aes256Ctr),
            _ => Err(Error::bug_fmt(format_args!("unknown cipher {name}"))),
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Cipher::ChaPoly => SSHChaPoly::KEY_LEN,
            Cipher::Aes256Ctr => aes::Aes256::key_size(),
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            Cipher::ChaPoly => 0,
            Cipher::Aes256Ctr => aes::Aes256::block_size(),
        }
    }

    /// Returns the [`Integ`] for an AEAD cipher
    pub fn integ(&self) -> Option<Integ> {
        match self {
            Cipher::ChaPoly => Some(Integ::ChaPoly),
            Cipher::Aes256Ctr => None,
        }
    }
}

/// A keyed cipher for one direction.
pub(crate) enum CipherKey {
    ChaPoly(SSHChaPoly),
    Aes256Ctr(Aes256Ctr32BE),
    NoCipher,
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly(_) => "ChaPoly",
            Self::Aes256Ctr(_) => "Aes256Ctr",
            Self::NoCipher => "NoCipher",
        };
        write!(f, "CipherKey::{n}")
    }
}

impl CipherKey {
    fn from_cipher(cipher: &Cipher, key: &[u8], iv: &[u8]) -> Result<Self> {
        match cipher {
            Cipher::ChaPoly => Ok(CipherKey::ChaPoly(SSHChaPoly::new(key)?)),
            Cipher::Aes256Ctr => {
                Ok(CipherKey::Aes256Ctr(Aes256Ctr32BE::new_from_slices(key, iv).trap()?))
            }
        }
    }

    fn is_aead(&self) -> bool {
        matches!(self, CipherKey::ChaPoly(_))
    }

    fn size_block(&self) -> usize {
        match self {
            CipherKey::Aes256Ctr(_) => aes::Aes256::block_size(),
            CipherKey::ChaPoly(_) | CipherKey::NoCipher => SSH_MIN_BLOCK,
        }
    }
}

/// A negotiated MAC, prior to keying
#[derive(Debug, Clone)]
pub(crate) enum Integ {
    /// Provided by the AEAD cipher
    ChaPoly,
    HmacSha256,
}

impl Integ {
    /// Matches a MAC name. AEAD ciphers use [`Cipher::integ`] instead.
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_HMAC_SHA256 => Ok(Integ::HmacSha256),
            _ => Err(Error::bug_fmt(format_args!("unknown mac {name}"))),
        }
    }

    fn key_len(&self) -> usize {
        match self {
            Integ::ChaPoly => 0,
            Integ::HmacSha256 => 32,
        }
    }
}

impl fmt::Display for Integ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => SSH_NAME_CHAPOLY,
            Self::HmacSha256 => SSH_NAME_HMAC_SHA256,
        };
        write!(f, "{n}")
    }
}

enum IntegKey {
    ChaPoly,
    HmacSha256(Zeroizing<[u8; 32]>),
    NoInteg,
}

impl fmt::Debug for IntegKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => "ChaPoly",
            Self::HmacSha256(_) => "HmacSha256",
            Self::NoInteg => "NoInteg",
        };
        write!(f, "IntegKey::{n}")
    }
}

impl IntegKey {
    fn from_integ(integ: &Integ, key: &[u8]) -> Result<Self> {
        match integ {
            Integ::ChaPoly => Ok(IntegKey::ChaPoly),
            Integ::HmacSha256 => {
                let k: [u8; 32] = key.try_into().trap()?;
                Ok(IntegKey::HmacSha256(Zeroizing::new(k)))
            }
        }
    }

    fn size_out(&self) -> usize {
        match self {
            IntegKey::ChaPoly => SSHChaPoly::TAG_LEN,
            IntegKey::HmacSha256(_) => sha2::Sha256::output_size(),
            IntegKey::NoInteg => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::dusklog::init_test_log;
    use crate::encrypt::*;
    use crate::error::Error;
    use crate::kex::{Algos, SharedSecret};
    use crate::sign::SigType;

    // with `corrupt` set, checks that a flipped bit is detected
    fn do_roundtrips(keys_enc: &mut KeyState, keys_dec: &mut KeyState, corrupt: bool) {
        for i in 0usize..80 {
            let mut v: std::vec::Vec<u8> = (0u8..i as u8 + 60).collect();
            let orig_payload = v[SSH_PAYLOAD_START..SSH_PAYLOAD_START + i].to_vec();

            let written = keys_enc.encrypt(i, v.as_mut_slice()).unwrap();
            v.truncate(written);

            if corrupt {
                v[SSH_PAYLOAD_START] ^= 4;
            }

            let l = keys_dec.decrypt_first_block(v.as_mut_slice()).unwrap() as usize;
            assert_eq!(l, v.len());

            let dec = keys_dec.decrypt(v.as_mut_slice());
            if corrupt {
                assert!(matches!(dec, Err(Error::BadDecrypt)));
                return;
            }
            assert_eq!(dec.unwrap(), i);
            assert_eq!(orig_payload, &v[SSH_PAYLOAD_START..SSH_PAYLOAD_START + i]);
        }
    }

    /// Keys for both ends of a connection, client first
    pub(crate) fn keyed_pair() -> (KeyState, KeyState) {
        let mut algos = algo_combos().next().flatten().unwrap();
        let out = test_output();
        let mut serv = KeyState::new_cleartext();
        serv.rekey(Keys::derive(&out, &out.h.clone(), &algos).unwrap());
        algos.is_client = true;
        core::mem::swap(&mut algos.cipher_enc, &mut algos.cipher_dec);
        core::mem::swap(&mut algos.integ_enc, &mut algos.integ_dec);
        let mut cli = KeyState::new_cleartext();
        cli.rekey(Keys::derive(&out, &out.h.clone(), &algos).unwrap());
        (cli, serv)
    }

    fn test_output() -> KexOutput {
        KexOutput::new_test(b"a shared secret", b"exchange hash")
    }

    // Each cipher combination, plus None for cleartext.
    fn algo_combos() -> impl Iterator<Item = Option<Algos>> {
        let combos = [
            (Cipher::Aes256Ctr, Integ::HmacSha256, Cipher::Aes256Ctr, Integ::HmacSha256),
            (Cipher::ChaPoly, Integ::ChaPoly, Cipher::ChaPoly, Integ::ChaPoly),
            (Cipher::Aes256Ctr, Integ::HmacSha256, Cipher::ChaPoly, Integ::ChaPoly),
            (Cipher::ChaPoly, Integ::ChaPoly, Cipher::Aes256Ctr, Integ::HmacSha256),
        ];
        combos
            .into_iter()
            .map(|(ce, ie, cd, id)| {
                Some(Algos {
                    kex: SharedSecret::from_name(SSH_NAME_CURVE25519).unwrap(),
                    hostsig: SigType::Ed25519,
                    cipher_enc: ce,
                    cipher_dec: cd,
                    integ_enc: ie,
                    integ_dec: id,
                    discard_next: false,
                    is_client: false,
                    strict_kex: false,
                })
            })
            .chain(core::iter::once(None))
    }

    #[test]
    fn algo_roundtrips() {
        init_test_log();

        for mut algos in algo_combos() {
            let mut keys_enc = KeyState::new_cleartext();
            let mut keys_dec = KeyState::new_cleartext();
            if let Some(ref mut algos) = algos {
                let out = test_output();
                let sess_id = out.h.clone();
                trace!("algos enc {algos}");
                keys_enc.rekey(Keys::derive(&out, &sess_id, algos).unwrap());

                // the peer derives with swapped roles
                algos.is_client = !algos.is_client;
                core::mem::swap(&mut algos.cipher_enc, &mut algos.cipher_dec);
                core::mem::swap(&mut algos.integ_enc, &mut algos.integ_dec);
                keys_dec.rekey(Keys::derive(&out, &sess_id, algos).unwrap());
            }

            do_roundtrips(&mut keys_enc, &mut keys_dec, false);
            if algos.is_some() {
                do_roundtrips(&mut keys_enc, &mut keys_dec, true);
            }
        }
    }

    #[test]
    fn wrong_sequence() {
        let mut algos = algo_combos().next().flatten().unwrap();
        let out = test_output();
        let sess_id = out.h.clone();
        let mut ke = KeyState::new_cleartext();
        ke.rekey(Keys::derive(&out, &sess_id, &algos).unwrap());
        algos.is_client = true;
        let mut kd = KeyState::new_cleartext();
        kd.rekey(Keys::derive(&out, &sess_id, &algos).unwrap());

        // skip a packet on the sending side
        let mut v = vec![0u8; 100];
        ke.encrypt(10, &mut v).unwrap();
        let l = ke.encrypt(10, &mut v).unwrap();
        v.truncate(l);
        kd.decrypt_first_block(&mut v).unwrap();
        assert!(matches!(kd.decrypt(&mut v), Err(Error::BadDecrypt)));
    }
}
