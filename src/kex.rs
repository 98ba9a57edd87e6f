//! Key exchange, [RFC4253](https://tools.ietf.org/html/rfc4253) sections 7 and 8.
//!
//! Only curve25519-sha256 is implemented. The client role is what a
//! [`Session`](crate::Session) uses, the server role exists for the
//! in-process test server.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use digest::Digest;
use pretty_hex::PrettyHex;
use rand_core::OsRng;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::encrypt::{Cipher, Integ, Keys};
use crate::ident::{self, RemoteVersion};
use crate::namelist::{LocalNames, NameList};
use crate::packets::{self, Packet, PubKey};
use crate::random;
use crate::sign::SigType;
use crate::sshnames::*;
use crate::sshwire::{hash_mpint, hash_ser_length, BinString};
#[cfg(test)]
use {crate::sign::SignKey, crate::sshwire::Blob};
use crate::traffic::TrafSend;

const MAX_SESSID: usize = 32;
/// An exchange hash `H`. The first one is the session identifier.
pub type SessId = heapless::Vec<u8, MAX_SESSID>;

const OPTIONS_KEX: &[&str] = &[SSH_NAME_CURVE25519, SSH_NAME_CURVE25519_LIBSSH];

/// Names that only advertise a capability, negotiating one means no match
const MARKER_ONLY_KEXS: &[&str] = &[
    SSH_NAME_EXT_INFO_C,
    SSH_NAME_EXT_INFO_S,
    SSH_NAME_STRICT_KEX_C,
    SSH_NAME_STRICT_KEX_S,
];

const OPTIONS_HOSTSIG: &[&str] = &[SSH_NAME_ED25519];
const OPTIONS_CIPHER: &[&str] = &[SSH_NAME_CHAPOLY, SSH_NAME_AES256_CTR];
const OPTIONS_MAC: &[&str] = &[SSH_NAME_HMAC_SHA256];
const OPTIONS_COMP: &[&str] = &[SSH_NAME_NONE];

pub(crate) struct AlgoConfig {
    kexs: LocalNames,
    hostsig: LocalNames,
    ciphers: LocalNames,
    macs: LocalNames,
    comps: LocalNames,
}

impl AlgoConfig {
    pub fn new(is_client: bool) -> Result<Self> {
        let mut kexs: LocalNames = OPTIONS_KEX.try_into()?;
        // we always offer strict kex
        let strict = if is_client { SSH_NAME_STRICT_KEX_C } else { SSH_NAME_STRICT_KEX_S };
        kexs.0.push(strict).map_err(|_| Error::NoRoom)?;

        Ok(AlgoConfig {
            kexs,
            hostsig: OPTIONS_HOSTSIG.try_into()?,
            ciphers: OPTIONS_CIPHER.try_into()?,
            macs: OPTIONS_MAC.try_into()?,
            comps: OPTIONS_COMP.try_into()?,
        })
    }
}

/// The current state of the Kex
#[derive(Debug)]
pub(crate) enum Kex {
    /// No key exchange in progress
    Idle,

    /// Have sent a KexInit, waiting for the peer's.
    KexInit {
        // Kept to reproduce our KexInit packet for the exchange hash
        our_cookie: KexCookie,
    },
    /// Waiting for KexDHInit (server) or KexDHReply (client)
    KexDH { algos: Algos, kex_hash: KexHash },
    /// Waiting for NewKeys. `output` is new keys to take into use
    NewKeys { output: KexOutput, algos: Algos },

    /// Only set transiently inside a method, see [`take()`](Self::take)
    Taken,
}

pub(crate) type KexCookie = [u8; 16];

/// Progressively hashes version idents, kexinit payloads, host key,
/// exchange values and the shared secret.
#[derive(Debug)]
pub(crate) struct KexHash {
    hash_ctx: Sha256,
}

impl KexHash {
    fn new(
        algos: &Algos,
        algo_conf: &AlgoConfig,
        our_cookie: &KexCookie,
        remote_version: &RemoteVersion,
        remote_kexinit: &Packet,
    ) -> Result<Self> {
        // RFC4253 section 8:
        //    string    V_C, the client's identification string (CR and LF
        //              excluded)
        //    string    V_S, the server's identification string (CR and LF
        //              excluded)
        //    string    I_C, the payload of the client's SSH_MSG_KEXINIT
        //    string    I_S, the payload of the server's SSH_MSG_KEXINIT
        //    string    K_S, the host key
        //    mpint     e, exchange value sent by the client (aka q_c)
        //    mpint     f, exchange value sent by the server (aka q_s)
        //    mpint     K, the shared secret

        let mut kh = KexHash { hash_ctx: Sha256::new() };
        let remote_version = remote_version.version().trap()?;
        let own_kexinit = Kex::make_kexinit(our_cookie, algo_conf);
        if algos.is_client {
            kh.hash_slice(ident::OUR_VERSION);
            kh.hash_slice(remote_version);
            hash_ser_length(&mut kh.hash_ctx, &own_kexinit)?;
            hash_ser_length(&mut kh.hash_ctx, remote_kexinit)?;
        } else {
            kh.hash_slice(remote_version);
            kh.hash_slice(ident::OUR_VERSION);
            hash_ser_length(&mut kh.hash_ctx, remote_kexinit)?;
            hash_ser_length(&mut kh.hash_ctx, &own_kexinit)?;
        }
        Ok(kh)
    }

    /// Fill everything except K.
    fn prefinish(&mut self, host_key: &PubKey, q_c: &[u8], q_s: &[u8]) -> Result<()> {
        hash_ser_length(&mut self.hash_ctx, host_key)?;
        // curve25519 sends these as strings, not mpints
        self.hash_slice(q_c);
        self.hash_slice(q_s);
        Ok(())
    }

    /// `k` is raw bytes, it is hashed as a mpint.
    fn finish(mut self, k: &[u8]) -> Result<SessId> {
        hash_mpint(&mut self.hash_ctx, k);
        SessId::from_slice(&self.hash_ctx.finalize()).map_err(|_| Error::bug())
    }

    fn hash_slice(&mut self, v: &[u8]) {
        self.hash_ctx.update((v.len() as u32).to_be_bytes());
        self.hash_ctx.update(v);
    }
}

/// Records the chosen algorithms while key exchange proceeds
#[derive(Debug)]
pub(crate) struct Algos {
    pub kex: SharedSecret,
    pub hostsig: SigType,
    pub cipher_enc: Cipher,
    pub cipher_dec: Cipher,
    pub integ_enc: Integ,
    pub integ_dec: Integ,

    // first_kex_packet_follows was set but the guess was wrong,
    // the next kex packet is discarded (RFC4253 Sec 7).
    pub discard_next: bool,

    pub is_client: bool,

    // Peer offered strict kex. Only matters for the first exchange.
    pub strict_kex: bool,
}

impl fmt::Display for Algos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cc, cs, mc, ms) = if self.is_client {
            (&self.cipher_enc, &self.cipher_dec, &self.integ_enc, &self.integ_dec)
        } else {
            (&self.cipher_dec, &self.cipher_enc, &self.integ_dec, &self.integ_enc)
        };

        write!(
            f,
            "Negotiated algorithms {{\nkex {}\nhostkey {}\ncipher c->s {}\ncipher s->c {}\nmac c->s {}\nmac s->c {}\nstrict {}\n}}",
            self.kex,
            self.hostsig.algorithm_name(),
            cc,
            cs,
            mc,
            ms,
            self.strict_kex
        )
    }
}

impl Kex {
    pub fn new() -> Self {
        Kex::Idle
    }

    fn take(&mut self) -> Self {
        debug_assert!(!matches!(self, Kex::Taken));
        core::mem::replace(self, Kex::Taken)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Kex::Idle)
    }

    /// Sends a `KexInit` message. Must be called from `Idle` state
    pub fn send_kexinit(&mut self, conf: &AlgoConfig, s: &mut TrafSend) -> Result<()> {
        if !self.is_idle() {
            return Err(Error::bug());
        }
        let our_cookie = random::random_array()?;
        s.send(Kex::make_kexinit(&our_cookie, conf))?;
        *self = Kex::KexInit { our_cookie };
        Ok(())
    }

    pub fn handle_kexinit(
        &mut self,
        remote_kexinit: packets::KexInit,
        is_client: bool,
        algo_conf: &AlgoConfig,
        remote_version: &RemoteVersion,
        first_kex: bool,
        s: &mut TrafSend,
    ) -> Result<()> {
        if self.is_idle() {
            self.send_kexinit(algo_conf, s)?;
        }

        let Kex::KexInit { our_cookie } = self else {
            debug!("Duplicate kexinit");
            return Err(Error::PacketWrong);
        };
        let our_cookie = *our_cookie;

        let algos = Self::algo_negotiation(is_client, &remote_kexinit, algo_conf)?;
        debug!("{algos}");

        // The peer's kexinit must have been the very first packet
        if first_kex && algos.strict_kex && s.recv_seq() != 1 {
            debug!("kexinit has strict kex but wasn't first packet");
            return Err(Error::PacketWrong);
        }

        if is_client {
            s.send(algos.kex.make_kexdhinit())?;
        }
        let kex_hash =
            KexHash::new(&algos, algo_conf, &our_cookie, remote_version, &remote_kexinit.into())?;
        *self = Kex::KexDH { algos, kex_hash };
        Ok(())
    }

    fn make_kexinit<'a>(cookie: &KexCookie, conf: &'a AlgoConfig) -> Packet<'a> {
        packets::KexInit {
            cookie: *cookie,
            kex: (&conf.kexs).into(),
            hostsig: (&conf.hostsig).into(),
            cipher_c2s: (&conf.ciphers).into(),
            cipher_s2c: (&conf.ciphers).into(),
            mac_c2s: (&conf.macs).into(),
            mac_s2c: (&conf.macs).into(),
            comp_c2s: (&conf.comps).into(),
            comp_s2c: (&conf.comps).into(),
            lang_c2s: NameList::empty(),
            lang_s2c: NameList::empty(),
            first_follows: false,
            reserved: 0,
        }
        .into()
    }

    /// Server only, replies with the signed exchange hash.
    #[cfg(test)]
    pub fn handle_kexdhinit(
        &mut self,
        p: &packets::KexDHInit,
        s: &mut TrafSend,
        hostkey: &SignKey,
    ) -> Result<()> {
        if self.take_discard(false)? {
            return Ok(());
        }

        let Kex::KexDH { mut algos, mut kex_hash } = self.take() else {
            return Err(Error::PacketWrong);
        };

        if !hostkey.can_sign(algos.hostsig) {
            return Error::bug_msg("hostkey can't sign");
        }
        kex_hash.prefinish(&hostkey.pubkey(), p.q_c.0, algos.kex.pubkey())?;
        let output = algos.kex.secret(p.q_c.0, kex_hash)?;

        trace!("sign kexreply h {:?}", output.h.hex_dump());
        let sig = hostkey.sign(&output.h.as_slice())?;
        s.send(packets::KexDHReply {
            k_s: Blob(hostkey.pubkey()),
            q_s: BinString(algos.kex.pubkey()),
            sig: Blob((&sig).into()),
        })?;
        s.send(packets::NewKeys {})?;
        *self = Kex::NewKeys { output, algos };
        Ok(())
    }

    /// Client only. Verifies the host key signature over the exchange hash.
    ///
    /// Whether the host key itself is trusted is left to the caller,
    /// using its fingerprint.
    pub fn handle_kexdhreply(&mut self, p: &packets::KexDHReply, s: &mut TrafSend) -> Result<()> {
        if self.take_discard(true)? {
            return Ok(());
        }

        let Kex::KexDH { mut algos, mut kex_hash } = self.take() else {
            return Err(Error::PacketWrong);
        };

        kex_hash.prefinish(&p.k_s.0, algos.kex.pubkey(), p.q_s.0)?;
        let output = algos.kex.secret(p.q_s.0, kex_hash)?;

        let h: &[u8] = output.h.as_ref();
        trace!("verify h {:?}", h.hex_dump());
        algos.hostsig.verify(&p.k_s.0, &h, &p.sig.0)?;
        debug!("Hostkey signature is valid");

        s.send(packets::NewKeys {})?;
        *self = Kex::NewKeys { output, algos };
        Ok(())
    }

    /// Returns `true` when a wrongly guessed packet should be ignored
    fn take_discard(&mut self, want_client: bool) -> Result<bool> {
        match self {
            Kex::KexDH { algos, .. } => {
                if algos.is_client != want_client {
                    return Err(Error::PacketWrong);
                }
                let d = algos.discard_next;
                algos.discard_next = false;
                Ok(d)
            }
            _ => Err(Error::PacketWrong),
        }
    }

    /// Takes the new keys into use. Our own NewKeys has already been sent.
    pub fn handle_newkeys(
        &mut self,
        sess_id: &mut Option<SessId>,
        s: &mut TrafSend,
    ) -> Result<()> {
        let Kex::NewKeys { output, algos } = self.take() else {
            return Err(Error::PacketWrong);
        };

        // The first exchange's H is the persistent session identifier
        let sess_id = sess_id.get_or_insert_with(|| output.h.clone());
        let keys = Keys::derive(&output, sess_id, &algos)?;
        s.rekey(keys);
        if algos.strict_kex {
            s.enable_strict_kex()
        }
        *self = Kex::Idle;
        Ok(())
    }

    /// Whether the exchange in progress negotiated strict kex
    pub fn is_strict(&self) -> bool {
        match self {
            Kex::KexDH { algos, .. } | Kex::NewKeys { algos, .. } => algos.strict_kex,
            _ => false,
        }
    }

    fn algo_negotiation(is_client: bool, p: &packets::KexInit, conf: &AlgoConfig) -> Result<Algos> {
        // Each algorithm is the first in the client's list that the
        // server also has.
        let kex_method = p
            .kex
            .first_match(is_client, &conf.kexs)?
            .ok_or(Error::AlgoNoMatch { algo: "kex" })?;

        if MARKER_ONLY_KEXS.contains(&kex_method) {
            return Err(Error::AlgoNoMatch { algo: "kex" });
        }

        let kex = SharedSecret::from_name(kex_method)?;
        let goodguess_kex = p.kex.first() == conf.kexs.first();

        // we always send strict-kex, so just check if the other had it
        let other_strict = if is_client { SSH_NAME_STRICT_KEX_S } else { SSH_NAME_STRICT_KEX_C };
        let strict_kex = p.kex.has_algo(other_strict)?;

        trace!("hostsig {:?} vs {:?}", p.hostsig, conf.hostsig);
        let hostsig_method = p
            .hostsig
            .first_match(is_client, &conf.hostsig)?
            .ok_or(Error::AlgoNoMatch { algo: "hostkey" })?;
        let hostsig = SigType::from_name(hostsig_method)?;
        let goodguess_hostkey = p.hostsig.first() == conf.hostsig.first();

        // Switch between client/server tx/rx
        let c2s = (&p.cipher_c2s, &p.mac_c2s, &p.comp_c2s);
        let s2c = (&p.cipher_s2c, &p.mac_s2c, &p.comp_s2c);
        let ((cipher_tx, mac_tx, comp_tx), (cipher_rx, mac_rx, comp_rx)) =
            if is_client { (c2s, s2c) } else { (s2c, c2s) };

        let n = cipher_tx
            .first_match(is_client, &conf.ciphers)?
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
        let cipher_enc = Cipher::from_name(n)?;
        let n = cipher_rx
            .first_match(is_client, &conf.ciphers)?
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
        let cipher_dec = Cipher::from_name(n)?;

        // MAC lists are ignored for AEAD ciphers
        let integ_enc = match cipher_enc.integ() {
            Some(integ) => integ,
            None => {
                let n = mac_tx
                    .first_match(is_client, &conf.macs)?
                    .ok_or(Error::AlgoNoMatch { algo: "mac" })?;
                Integ::from_name(n)?
            }
        };
        let integ_dec = match cipher_dec.integ() {
            Some(integ) => integ,
            None => {
                let n = mac_rx
                    .first_match(is_client, &conf.macs)?
                    .ok_or(Error::AlgoNoMatch { algo: "mac" })?;
                Integ::from_name(n)?
            }
        };

        // Compression can only be "none"
        comp_tx
            .first_match(is_client, &conf.comps)?
            .ok_or(Error::AlgoNoMatch { algo: "compression" })?;
        comp_rx
            .first_match(is_client, &conf.comps)?
            .ok_or(Error::AlgoNoMatch { algo: "compression" })?;

        let discard_next = p.first_follows && !(goodguess_kex && goodguess_hostkey);

        Ok(Algos {
            kex,
            hostsig,
            cipher_enc,
            cipher_dec,
            integ_enc,
            integ_dec,
            discard_next,
            is_client,
            strict_kex,
        })
    }
}

#[derive(Debug, ZeroizeOnDrop)]
pub(crate) enum SharedSecret {
    KexCurve25519(KexCurve25519),
}

impl fmt::Display for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::KexCurve25519(_) => SSH_NAME_CURVE25519,
        };
        write!(f, "{n}")
    }
}

impl SharedSecret {
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_CURVE25519 | SSH_NAME_CURVE25519_LIBSSH => {
                Ok(SharedSecret::KexCurve25519(KexCurve25519::new()))
            }
            _ => Err(Error::bug_fmt(format_args!("unknown kex {name}"))),
        }
    }

    fn hash(&self) -> Sha256 {
        match self {
            SharedSecret::KexCurve25519(_) => Sha256::new(),
        }
    }

    fn make_kexdhinit(&self) -> Packet {
        packets::KexDHInit { q_c: BinString(self.pubkey()) }.into()
    }

    fn pubkey(&self) -> &[u8] {
        match self {
            SharedSecret::KexCurve25519(k) => k.pubkey(),
        }
    }

    /// Consumes our ephemeral secret
    fn secret(&mut self, theirs: &[u8], kex_hash: KexHash) -> Result<KexOutput> {
        let hash = self.hash();
        let k = match self {
            SharedSecret::KexCurve25519(k) => k.secret(theirs)?,
        };
        KexOutput::new(k.as_bytes(), hash, kex_hash)
    }
}

/// The result of a completed exchange.
pub(crate) struct KexOutput {
    /// `H` for this exchange
    pub h: SessId,
    /// Has already hashed `K || H`, see [`compute_key()`](Self::compute_key).
    partial_hash: Sha256,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput").finish_non_exhaustive()
    }
}

impl KexOutput {
    fn new(k: &[u8], mut partial_hash: Sha256, kex_hash: KexHash) -> Result<Self> {
        let h = kex_hash.finish(k)?;
        hash_mpint(&mut partial_hash, k);
        Digest::update(&mut partial_hash, &h);
        Ok(KexOutput { h, partial_hash })
    }

    #[cfg(test)]
    pub fn new_test(k: &[u8], h: &[u8]) -> Self {
        let h = SessId::from_slice(&Sha256::digest(h)).unwrap();
        let mut partial_hash = Sha256::new();
        hash_mpint(&mut partial_hash, k);
        Digest::update(&mut partial_hash, &h);
        KexOutput { h, partial_hash }
    }

    /// RFC4253 7.2. `K1 = HASH(K || H || "A" || session_id)` etc
    pub fn compute_key<'a>(
        &self,
        letter: char,
        len: usize,
        out: &'a mut [u8],
        sess_id: &SessId,
    ) -> Result<&'a [u8]> {
        let hsz = <Sha256 as Digest>::output_size();
        // two rounds is enough for the largest key
        if len > out.len() || len > 2 * hsz {
            return Err(Error::bug());
        }

        let l = len.min(hsz);
        let (k1, rest) = out.split_at_mut(l);
        let k2 = &mut rest[..len - l];

        let mut hash_ctx = self.partial_hash.clone();
        Digest::update(&mut hash_ctx, [letter as u8]);
        Digest::update(&mut hash_ctx, sess_id.as_slice());
        let w = hash_ctx.finalize();
        k1.copy_from_slice(&w[..k1.len()]);

        if !k2.is_empty() {
            // K2 = HASH(K || H || K1)
            let mut hash_ctx = self.partial_hash.clone();
            Digest::update(&mut hash_ctx, &*k1);
            let w = hash_ctx.finalize();
            k2.copy_from_slice(&w[..k2.len()]);
        }
        Ok(&out[..len])
    }
}

#[derive(ZeroizeOnDrop)]
pub(crate) struct KexCurve25519 {
    // Cleared after deriving the secret
    #[zeroize(skip)]
    ours: Option<x25519_dalek::EphemeralSecret>,
    pubkey: [u8; 32],
}

impl fmt::Debug for KexCurve25519 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KexCurve25519")
            .field("ours", &if self.ours.is_some() { "Some" } else { "None" })
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

impl KexCurve25519 {
    fn new() -> Self {
        let ours = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let pubkey = x25519_dalek::PublicKey::from(&ours).to_bytes();
        KexCurve25519 { ours: Some(ours), pubkey }
    }

    fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    fn secret(&mut self, theirs: &[u8]) -> Result<x25519_dalek::SharedSecret> {
        let theirs: [u8; 32] = theirs.try_into().map_err(|_| Error::BadKex)?;
        let theirs = x25519_dalek::PublicKey::from(theirs);
        let ours = self.ours.take().ok_or_else(|| Error::bug_err_msg("kex secret reused"))?;
        let k = ours.diffie_hellman(&theirs);
        // RFC7748 6.1, an all-zero output means a low order point
        if !k.was_contributory() {
            return Err(Error::BadKex);
        }
        Ok(k)
    }
}

#[cfg(test)]
mod tests {
    use crate::dusklog::init_test_log;
    use crate::encrypt::{self, KeyState};
    use crate::ident::RemoteVersion;
    use crate::kex::*;
    use crate::packets::{Packet, ParseContext};
    use crate::sign::{self, SignKey};
    use crate::sshwire;
    use crate::traffic::{TrafIn, TrafOut};

    // Names must all be known, otherwise from_name() hits a bug
    #[test]
    fn algorithm_names() {
        for k in OPTIONS_KEX.iter() {
            SharedSecret::from_name(k).unwrap();
        }
        for k in OPTIONS_HOSTSIG.iter() {
            sign::SigType::from_name(k).unwrap();
        }
        for k in OPTIONS_CIPHER.iter() {
            encrypt::Cipher::from_name(k).unwrap();
        }
        for k in OPTIONS_MAC.iter() {
            encrypt::Integ::from_name(k).unwrap();
        }
    }

    #[test]
    #[should_panic]
    fn unknown_cipher() {
        encrypt::Cipher::from_name("bad").unwrap();
    }

    /// Captures sent packets and parses them back.
    ///
    /// Payloads are leaked so that parsed packets can outlive the catcher.
    struct TrafCatcher {
        traf_out: TrafOut,
        traf_in: TrafIn,
        keys: KeyState,
        rv: RemoteVersion,
        buf: Vec<u8>,
    }

    impl TrafCatcher {
        fn new() -> Self {
            // the version line is already done
            let rv = version(b"SSH-2.0-thing");
            Self { traf_out: TrafOut::new(), traf_in: TrafIn::new(), keys: KeyState::new_cleartext(), rv, buf: vec![] }
        }

        fn sender(&mut self) -> TrafSend<'_> {
            self.traf_out.sender(&mut self.keys)
        }

        /// Returns the next sent packet
        fn next(&mut self) -> Option<Packet<'static>> {
            self.buf.extend(self.traf_out.take_output());
            let l = self.traf_in.input(&mut self.keys, &mut self.rv, &self.buf).unwrap();
            self.buf.drain(..l);
            let (payload, _seq) = self.traf_in.payload()?;
            let payload = Vec::from(payload).leak();
            self.traf_in.done_payload();
            Some(sshwire::packet_from_bytes(payload, &ParseContext::default()).unwrap())
        }
    }

    fn version(v: &[u8]) -> RemoteVersion {
        let mut rv = RemoteVersion::new();
        let mut s = v.to_vec();
        s.extend_from_slice(b"\r\n");
        rv.consume(&s).unwrap();
        rv
    }

    #[test]
    fn agree_kex() {
        init_test_log();
        let cli_conf = AlgoConfig::new(true).unwrap();
        let serv_conf = AlgoConfig::new(false).unwrap();
        // Both ends see the other's version as ours
        let rv = version(crate::ident::OUR_VERSION);

        let hostkey = SignKey::generate().unwrap();

        let mut ts = TrafCatcher::new();
        let mut tc = TrafCatcher::new();

        let mut cli = Kex::new();
        let mut serv = Kex::new();

        serv.send_kexinit(&serv_conf, &mut ts.sender()).unwrap();
        cli.send_kexinit(&cli_conf, &mut tc.sender()).unwrap();

        let Some(Packet::KexInit(cli_init)) = tc.next() else { panic!() };
        let Some(Packet::KexInit(serv_init)) = ts.next() else { panic!() };

        // not first_kex, recv_seq doesn't line up in this harness
        serv.handle_kexinit(cli_init, false, &serv_conf, &rv, false, &mut ts.sender()).unwrap();
        cli.handle_kexinit(serv_init, true, &cli_conf, &rv, false, &mut tc.sender()).unwrap();
        assert!(cli.is_strict() && serv.is_strict());

        let Some(Packet::KexDHInit(dhinit)) = tc.next() else { panic!() };
        serv.handle_kexdhinit(&dhinit, &mut ts.sender(), &hostkey).unwrap();

        let Some(Packet::KexDHReply(dhreply)) = ts.next() else { panic!() };
        let Some(Packet::NewKeys(_)) = ts.next() else { panic!() };

        cli.handle_kexdhreply(&dhreply, &mut tc.sender()).unwrap();
        let Some(Packet::NewKeys(_)) = tc.next() else { panic!() };

        let (Kex::NewKeys { output: oc, .. }, Kex::NewKeys { output: os, .. }) = (&cli, &serv) else {
            panic!()
        };
        assert_eq!(oc.h, os.h);

        let mut cs = None;
        let mut ss = None;
        cli.handle_newkeys(&mut cs, &mut tc.sender()).unwrap();
        serv.handle_newkeys(&mut ss, &mut ts.sender()).unwrap();
        assert_eq!(cs, ss);
        assert!(cli.is_idle() && serv.is_idle());
        assert!(!tc.keys.is_cleartext());
    }

    #[test]
    fn bad_hostkey_sig() {
        init_test_log();
        let cli_conf = AlgoConfig::new(true).unwrap();
        let serv_conf = AlgoConfig::new(false).unwrap();
        let rv = version(crate::ident::OUR_VERSION);
        let hostkey = SignKey::generate().unwrap();
        let other_key = SignKey::generate().unwrap();

        let mut ts = TrafCatcher::new();
        let mut tc = TrafCatcher::new();
        let mut cli = Kex::new();
        let mut serv = Kex::new();
        serv.send_kexinit(&serv_conf, &mut ts.sender()).unwrap();
        cli.send_kexinit(&cli_conf, &mut tc.sender()).unwrap();
        let Some(Packet::KexInit(cli_init)) = tc.next() else { panic!() };
        let Some(Packet::KexInit(serv_init)) = ts.next() else { panic!() };
        serv.handle_kexinit(cli_init, false, &serv_conf, &rv, false, &mut ts.sender()).unwrap();
        cli.handle_kexinit(serv_init, true, &cli_conf, &rv, false, &mut tc.sender()).unwrap();
        let Some(Packet::KexDHInit(dhinit)) = tc.next() else { panic!() };
        serv.handle_kexdhinit(&dhinit, &mut ts.sender(), &hostkey).unwrap();
        let Some(Packet::KexDHReply(dhreply)) = ts.next() else { panic!() };

        // claim a different host key
        let dhreply = packets::KexDHReply { k_s: Blob(other_key.pubkey()), ..dhreply };
        let r = cli.handle_kexdhreply(&dhreply, &mut tc.sender());
        assert!(matches!(r, Err(Error::BadSig)));
    }

    #[test]
    fn no_common_cipher() {
        let conf = AlgoConfig::new(true).unwrap();
        let other: LocalNames = [SSH_NAME_NONE].as_slice().try_into().unwrap();
        let cookie = [0u8; 16];
        let Packet::KexInit(mut ki) = Kex::make_kexinit(&cookie, &conf) else { panic!() };
        // round trip to get remote String namelists
        let mut buf = vec![];
        ki.cipher_s2c = (&other).into();
        sshwire::write_ssh_vec(&mut buf, &Packet::KexInit(ki)).unwrap();
        let Packet::KexInit(ki) =
            sshwire::packet_from_bytes(&buf, &ParseContext::default()).unwrap()
        else {
            panic!()
        };
        let r = Kex::algo_negotiation(true, &ki, &conf);
        assert!(matches!(r, Err(Error::AlgoNoMatch { algo: "encryption" })));
    }
}
