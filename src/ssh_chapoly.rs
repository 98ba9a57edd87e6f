//! `chacha20-poly1305@openssh.com` packet cipher.
//!
//! OpenSSH PROTOCOL.chacha20poly1305. The 64 byte key is split in two,
//! the second half encrypts the length field and the first half
//! encrypts the remainder and keys the Poly1305 tag.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use digest::KeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::encrypt::SSH_LENGTH_SIZE;

#[derive(Clone, ZeroizeOnDrop)]
pub(crate) struct SSHChaPoly {
    /// Length key
    k_len: [u8; 32],
    /// Payload and tag key
    k_main: [u8; 32],
}

impl SSHChaPoly {
    pub const TAG_LEN: usize = 16;
    pub const KEY_LEN: usize = 64;

    /// `key` must be [`KEY_LEN`](Self::KEY_LEN) bytes
    pub fn new(key: &[u8]) -> Result<Self> {
        let (main, len) = key.split_at(key.len().min(32));
        let k_len = len.try_into().map_err(|_| Error::BadKey)?;
        let k_main = main.try_into().map_err(|_| Error::BadKey)?;
        Ok(Self { k_len, k_main })
    }

    fn cipher(key: &[u8; 32], seq: u32) -> ChaCha20 {
        let mut nonce = [0u8; 12];
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        ChaCha20::new(key.into(), (&nonce).into())
    }

    /// Returns the poly1305 key, leaves `c` at block 1
    fn poly_key(c: &mut ChaCha20) -> Zeroizing<[u8; 32]> {
        let mut k = Zeroizing::new([0u8; 32]);
        c.seek(0u32);
        c.apply_keystream(&mut k[..]);
        c.seek(64u32);
        k
    }

    /// Decrypts the packet length from the first 4 bytes of `buf`.
    pub fn packet_length(&self, seq: u32, buf: &[u8]) -> Result<u32> {
        let mut b: [u8; SSH_LENGTH_SIZE] = buf
            .get(..SSH_LENGTH_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::BadDecrypt)?;
        Self::cipher(&self.k_len, seq).apply_keystream(&mut b);
        Ok(u32::from_be_bytes(b))
    }

    /// Checks the tag then decrypts `msg` after the length field in-place.
    pub fn decrypt(&self, seq: u32, msg: &mut [u8], tag: &[u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || tag.len() != Self::TAG_LEN {
            return Err(Error::BadDecrypt);
        }

        let mut c = Self::cipher(&self.k_main, seq);
        let poly_key = Self::poly_key(&mut c);
        let pk: &[u8; 32] = &poly_key;
        let expect = Poly1305::new(pk.into()).compute_unpadded(msg);
        let good: bool = expect.as_slice().ct_eq(tag).into();
        if !good {
            return Err(Error::BadDecrypt);
        }

        c.apply_keystream(&mut msg[SSH_LENGTH_SIZE..]);
        Ok(())
    }

    /// Encrypts `msg` (length field included) in-place and writes the tag.
    pub fn encrypt(&self, seq: u32, msg: &mut [u8], tag: &mut [u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || tag.len() != Self::TAG_LEN {
            return Err(Error::BadDecrypt);
        }

        Self::cipher(&self.k_len, seq).apply_keystream(&mut msg[..SSH_LENGTH_SIZE]);

        let mut c = Self::cipher(&self.k_main, seq);
        let poly_key = Self::poly_key(&mut c);
        c.apply_keystream(&mut msg[SSH_LENGTH_SIZE..]);

        let pk: &[u8; 32] = &poly_key;
        let t = Poly1305::new(pk.into()).compute_unpadded(msg);
        tag.copy_from_slice(t.as_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ssh_chapoly::*;

    #[test]
    fn tag_covers_length() {
        let key: std::vec::Vec<u8> = (0..64).collect();
        let c = SSHChaPoly::new(&key).unwrap();
        let mut msg = [0u8, 0, 0, 12, 4, 1, 2, 3, 9, 9, 9, 9, 9, 9, 9, 9];
        let mut tag = [0u8; 16];
        c.encrypt(7, &mut msg, &mut tag).unwrap();
        assert_eq!(c.packet_length(7, &msg).unwrap(), 12);

        let mut bad = msg;
        bad[1] ^= 1;
        assert!(c.decrypt(7, &mut bad, &tag).is_err());
        // wrong sequence number
        let mut m2 = msg;
        assert!(c.decrypt(8, &mut m2, &tag).is_err());

        c.decrypt(7, &mut msg, &tag).unwrap();
        assert_eq!(&msg[4..8], &[4, 1, 2, 3]);
    }

    #[test]
    fn short_key() {
        assert!(SSHChaPoly::new(&[0u8; 32]).is_err());
    }
}
