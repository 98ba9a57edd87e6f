//! Host key verification and client key signing.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use crate::packets::{Ed25519PubKey, PubKey, Signature};
use crate::random;
use crate::sshnames::*;
use crate::sshwire::{self, BinString, SSHEncode};

use core::mem::discriminant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SigType {
    Ed25519,
}

impl SigType {
    /// Must be a valid name
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_ED25519 => Ok(SigType::Ed25519),
            _ => Err(Error::bug()),
        }
    }

    /// Returns a valid name
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            SigType::Ed25519 => SSH_NAME_ED25519,
        }
    }

    /// Returns `Ok(())` on success
    pub fn verify(&self, pubkey: &PubKey, msg: &impl SSHEncode, sig: &Signature) -> Result<()> {
        // Check that the signature type is known
        let sig_type = sig.sig_type().map_err(|_| Error::BadSig)?;

        // `self` is the expected signature type from kex/auth packet
        if discriminant(&sig_type) != discriminant(self) {
            warn!(
                "Received {:?} signature, expecting {}",
                sig.algorithm_name(),
                self.algorithm_name()
            );
            return Err(Error::BadSig);
        }

        match (self, pubkey, sig) {
            (SigType::Ed25519, PubKey::Ed25519(k), Signature::Ed25519(s)) => {
                let k: &[u8; 32] = k.key.0.try_into().map_err(|_| Error::BadKey)?;
                let k = VerifyingKey::from_bytes(k).map_err(|_| Error::BadKey)?;
                let s: &[u8; 64] = s.sig.0.try_into().map_err(|_| Error::BadSig)?;
                let s = ed25519_dalek::Signature::from_bytes(s);
                let mut m = Vec::new();
                sshwire::write_ssh_vec(&mut m, msg)?;
                k.verify(&m, &s).map_err(|_| Error::BadSig)
            }

            _ => {
                warn!(
                    "Signature \"{:?}\" doesn't match key type \"{:?}\"",
                    sig.algorithm_name(),
                    pubkey.algorithm_name(),
                );
                Err(Error::BadSig)
            }
        }
    }
}

/// A signature produced by a [`SignKey`]
#[derive(Debug, Clone)]
pub enum OwnedSig {
    Ed25519([u8; 64]),
}

impl From<ed25519_dalek::Signature> for OwnedSig {
    fn from(s: ed25519_dalek::Signature) -> Self {
        OwnedSig::Ed25519(s.to_bytes())
    }
}

/// A SSH signing key, a client identity or a host key.
///
/// Private key material is zeroized on drop.
pub enum SignKey {
    Ed25519(SigningKey),
}

impl SignKey {
    /// Generates a new random ed25519 key
    pub fn generate() -> Result<Self> {
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(random::random_array()?);
        Ok(Self::Ed25519(SigningKey::from_bytes(&seed)))
    }

    pub fn pubkey(&self) -> PubKey<'_> {
        match self {
            SignKey::Ed25519(k) => {
                PubKey::Ed25519(Ed25519PubKey { key: BinString(k.as_ref().as_bytes()) })
            }
        }
    }

    /// Parses an OpenSSH format private key.
    ///
    /// An encrypted key requires `passphrase`.
    pub fn from_openssh(k: impl AsRef<[u8]>, passphrase: Option<&str>) -> Result<Self> {
        let k = ssh_key::PrivateKey::from_openssh(k).map_err(|e| Error::KeyFile {
            msg: format!("Unsupported OpenSSH key: {e}"),
        })?;

        let k = if k.is_encrypted() {
            let Some(pw) = passphrase else {
                return Err(Error::KeyFile { msg: "Key is encrypted, no passphrase given".into() });
            };
            k.decrypt(pw).map_err(|e| Error::KeyFile { msg: format!("Decrypting key: {e}") })?
        } else {
            k
        };

        k.try_into()
    }

    /// Loads a private key file, checking it against a public key file if given.
    pub fn load(
        pub_path: Option<&Path>,
        priv_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        let data = Zeroizing::new(std::fs::read(priv_path).map_err(|e| Error::KeyFile {
            msg: format!("{}: {e}", priv_path.display()),
        })?);
        let key = Self::from_openssh(&*data, passphrase)?;

        if let Some(pub_path) = pub_path {
            let pk = ssh_key::PublicKey::read_openssh_file(pub_path).map_err(|e| {
                Error::KeyFile { msg: format!("{}: {e}", pub_path.display()) }
            })?;
            if !key.pubkey().matches_openssh(&pk) {
                return Err(Error::KeyFile {
                    msg: format!("{} doesn't match the private key", pub_path.display()),
                });
            }
        }
        debug!("Loaded key {}", priv_path.display());
        Ok(key)
    }

    /// Returns whether this `SignKey` can create a given signature type
    #[cfg(test)]
    pub(crate) fn can_sign(&self, sig_type: SigType) -> bool {
        match self {
            SignKey::Ed25519(_) => matches!(sig_type, SigType::Ed25519),
        }
    }

    pub(crate) fn sign(&self, msg: &impl SSHEncode) -> Result<OwnedSig> {
        let mut m = Vec::new();
        sshwire::write_ssh_vec(&mut m, msg)?;
        let sig: OwnedSig = match self {
            SignKey::Ed25519(k) => k.try_sign(&m).trap()?.into(),
        };

        {
            // Faults in signing can expose the private key. We verify the signature
            // just created to avoid this problem.
            let vsig: Signature = (&sig).into();
            let sig_type = vsig.sig_type()?;
            sig_type.verify(&self.pubkey(), msg, &vsig)?;
        }

        Ok(sig)
    }
}

impl core::fmt::Debug for SignKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignKey").field("Ed25519", &"...").finish()
    }
}

impl TryFrom<ssh_key::PrivateKey> for SignKey {
    type Error = Error;
    fn try_from(k: ssh_key::PrivateKey) -> Result<Self> {
        match k.key_data() {
            ssh_key::private::KeypairData::Ed25519(k) => {
                let secret = Zeroizing::new(k.private.to_bytes());
                let key = SigningKey::from_bytes(&secret);
                if key.verifying_key().as_bytes() != &k.public.0 {
                    return Err(Error::BadKey);
                }
                Ok(SignKey::Ed25519(key))
            }
            _ => Err(Error::KeyFile { msg: format!("{} keys are not supported", k.algorithm()) }),
        }
    }
}
