//! A SSH client session over a [`Transport`].
//!
//! [`Session`] owns the transport and drives the sans-IO connection state.
//! Each public operation makes as much progress as the transport allows.
//! Without blocking mode it returns [`Error::WouldBlock`] when stalled, and
//! the identical call should be retried once the transport is ready.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use digest::Digest;

use crate::channel::{ChanNum, OpenStatus, ReqStatus};
use crate::cliauth::AuthStatus;
use crate::config::{AuthMethod, Config, HashKind};
use crate::conn::{Conn, DispatchEvent};
use crate::encrypt::KeyState;
use crate::packets;
use crate::sftp::channel::SftpOpen;
use crate::sftp::client::ChanIo;
use crate::sign::SignKey;
use crate::sshnames::DisconnectReason;
use crate::traffic::{TrafIn, TrafOut};
use crate::transport::Transport;

const READ_BUF: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SessState {
    Running,
    /// A fatal error occurred
    Failed,
    /// Disconnected by the application
    Closed,
}

/// A host key digest, from [`Session::fingerprint`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    kind: HashKind,
    digest: Vec<u8>,
}

impl Fingerprint {
    /// Hashes a SSH wire format public key blob
    pub fn new(kind: HashKind, key_blob: &[u8]) -> Self {
        let digest = match kind {
            HashKind::Md5 => md5::Md5::digest(key_blob).to_vec(),
            HashKind::Sha1 => sha1::Sha1::digest(key_blob).to_vec(),
            HashKind::Sha256 => sha2::Sha256::digest(key_blob).to_vec(),
        };
        Self { kind, digest }
    }

    pub fn kind(&self) -> HashKind {
        self.kind
    }

    /// The raw digest, [`HashKind::len()`] bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }
}

/// Colon separated hex for MD5 and SHA-1, OpenSSH's `SHA256:` base64 form for SHA-256.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            HashKind::Sha256 => write!(f, "SHA256:{}", STANDARD_NO_PAD.encode(&self.digest)),
            HashKind::Md5 | HashKind::Sha1 => {
                for (i, b) in self.digest.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Credentials for [`Session::authenticate`].
///
/// Which fields are needed depends on [`Config::auth_method`].
#[derive(Default, Clone, Copy)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: Option<&'a str>,
    /// OpenSSH format public key, checked against the private key if given
    pub pubkey_path: Option<&'a Path>,
    pub privkey_path: Option<&'a Path>,
    /// Passphrase for an encrypted private key
    pub passphrase: Option<&'a str>,
}

// Don't print secrets
impl fmt::Debug for Credentials<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("pubkey_path", &self.pubkey_path)
            .field("privkey_path", &self.privkey_path)
            .finish_non_exhaustive()
    }
}

/// A SSH client session.
///
/// Dropping a running session sends a disconnect, best effort,
/// and closes the transport.
pub struct Session<T: Transport> {
    transport: T,
    config: Config,
    conn: Conn,

    traf_in: TrafIn,
    traf_out: TrafOut,
    keys: KeyState,

    /// Bytes read from the transport, `rpos..rlen` not yet consumed
    rbuf: Vec<u8>,
    rpos: usize,
    rlen: usize,

    state: SessState,
    disconnect_sent: bool,

    /// A `SftpChannel::open()` that returned `WouldBlock`
    pub(crate) sftp_open: Option<SftpOpen>,
}

impl<T: Transport> Session<T> {
    /// Creates a session. No IO is performed until [`handshake()`](Self::handshake).
    pub fn new(transport: T, config: Config) -> Result<Self> {
        Ok(Session {
            transport,
            config,
            conn: Conn::new()?,
            traf_in: TrafIn::new(),
            traf_out: TrafOut::new(),
            keys: KeyState::new_cleartext(),
            rbuf: vec![0u8; READ_BUF],
            rpos: 0,
            rlen: 0,
            state: SessState::Running,
            disconnect_sent: false,
            sftp_open: None,
        })
    }

    /// Creates a session and completes the handshake, waiting on the
    /// transport as needed.
    pub fn connect(transport: T, config: Config) -> Result<Self> {
        let mut sess = Self::new(transport, config)?;
        sess.drive(true, Self::handshake_step)?;
        Ok(sess)
    }

    /// Progresses version exchange and key exchange.
    ///
    /// Returns `Ok(())` once the first key exchange has completed.
    pub fn handshake(&mut self) -> Result<()> {
        self.drive(self.config.blocking_mode, Self::handshake_step)
    }

    fn handshake_step(&mut self) -> Result<Option<()>> {
        Ok(self.conn.kex_done().then_some(()))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.config.blocking_mode = blocking
    }

    /// Returns `true` after a fatal error.
    pub fn is_failed(&self) -> bool {
        self.state == SessState::Failed
    }

    /// Returns the server host key digest.
    ///
    /// Fails with [`Error::InvalidState`] before the key exchange.
    pub fn fingerprint(&self, kind: HashKind) -> Result<Fingerprint> {
        let blob = self.conn.hostkey().ok_or(Error::InvalidState { what: "no host key yet" })?;
        Ok(Fingerprint::new(kind, blob))
    }

    /// [`fingerprint()`](Self::fingerprint) with the configured [`HashKind`]
    pub fn host_fingerprint(&self) -> Result<Fingerprint> {
        self.fingerprint(self.config.hash_kind)
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn.auth.is_authed()
    }

    /// The method that authenticated the session
    pub fn auth_method(&self) -> Option<AuthMethod> {
        self.conn.auth.method()
    }

    pub fn authenticate_password(&mut self, username: &str, password: &str) -> Result<()> {
        self.drive(self.config.blocking_mode, |sess| {
            sess.auth_step(|sess| {
                let c = &mut sess.conn;
                c.auth.request_password(
                    username,
                    password,
                    &mut c.parse_ctx,
                    &mut sess.traf_out.sender(&mut sess.keys),
                )
            })
        })
    }

    /// Authenticates with an OpenSSH format private key file.
    ///
    /// If `pubkey_path` is given it must match the private key.
    pub fn authenticate_publickey(
        &mut self,
        username: &str,
        pubkey_path: Option<&Path>,
        privkey_path: &Path,
        passphrase: Option<&str>,
    ) -> Result<()> {
        self.drive(self.config.blocking_mode, |sess| {
            sess.auth_step(|sess| {
                let key = SignKey::load(pubkey_path, privkey_path, passphrase)?;
                let c = &mut sess.conn;
                let sess_id = c.sess_id().trap()?.clone();
                c.auth.request_pubkey(
                    username,
                    &key,
                    &sess_id,
                    &mut c.parse_ctx,
                    &mut sess.traf_out.sender(&mut sess.keys),
                )
            })
        })
    }

    /// Authenticates with the method chosen by [`Config::auth_method`].
    pub fn authenticate(&mut self, creds: &Credentials) -> Result<()> {
        match self.config.auth_method {
            AuthMethod::Password => {
                let pw = creds.password.ok_or(Error::BadUsage { what: "password required" })?;
                self.authenticate_password(creds.username, pw)
            }
            AuthMethod::PublicKey => {
                let k = creds.privkey_path.ok_or(Error::BadUsage { what: "private key required" })?;
                self.authenticate_publickey(creds.username, creds.pubkey_path, k, creds.passphrase)
            }
        }
    }

    /// Starts an attempt with `start` if none is in progress, otherwise
    /// checks on the current one.
    fn auth_step(&mut self, start: impl FnOnce(&mut Self) -> Result<()>) -> Result<Option<()>> {
        if !self.conn.kex_done() {
            return Err(Error::InvalidState { what: "handshake isn't complete" });
        }
        match self.conn.auth.poll() {
            AuthStatus::Idle => {
                start(self)?;
                Ok(None)
            }
            AuthStatus::Pending => Ok(None),
            AuthStatus::Success => Ok(Some(())),
            AuthStatus::Failed { methods } => Err(Error::AuthFailed { methods }),
            AuthStatus::PasswordExpired => Err(Error::PasswordExpired),
        }
    }

    /// Sends `SSH_MSG_DISCONNECT` and closes the transport.
    ///
    /// Can be retried after `WouldBlock`, and calling it again once
    /// closed has no effect.
    pub fn disconnect(&mut self, desc: &str) -> Result<()> {
        if self.state == SessState::Closed {
            return Ok(());
        }

        if self.state == SessState::Running {
            self.queue_disconnect(desc)?;
            loop {
                match self.flush_output() {
                    Ok(()) => break,
                    Err(Error::WouldBlock) if self.config.blocking_mode => self.transport.wait()?,
                    Err(Error::WouldBlock) => return Err(Error::WouldBlock),
                    Err(e) => {
                        // Closing regardless
                        debug!("Error sending disconnect: {e}");
                        break;
                    }
                }
            }
        }

        info!("Disconnected: {desc}");
        self.state = SessState::Closed;
        self.transport.close()
    }

    fn queue_disconnect(&mut self, desc: &str) -> Result<()> {
        if self.disconnect_sent || !self.conn.initial_sent() {
            return Ok(());
        }
        let p = packets::Disconnect {
            reason: DisconnectReason::SSH_DISCONNECT_BY_APPLICATION as u32,
            desc: desc.into(),
            lang: "".into(),
        };
        self.traf_out.sender(&mut self.keys).send(p)?;
        self.disconnect_sent = true;
        Ok(())
    }

    /// Writes pending output, `WouldBlock` if some remains.
    fn flush_output(&mut self) -> Result<()> {
        while self.traf_out.output_pending() {
            let n = self.transport.try_write(self.traf_out.pending())?;
            if n == 0 {
                return Err(Error::WouldBlock);
            }
            self.traf_out.consume(n);
        }
        Ok(())
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        match self.state {
            SessState::Running => Ok(()),
            SessState::Failed => Err(Error::SessionFailed),
            SessState::Closed => Err(Error::InvalidState { what: "session is closed" }),
        }
    }

    /// Marks the session failed if `e` is fatal
    pub(crate) fn fail(&mut self, e: Error) -> Error {
        if e.is_fatal() && self.state == SessState::Running {
            warn!("Session failed: {e}");
            self.state = SessState::Failed;
        }
        e
    }

    /// Runs `step` until it returns a result.
    ///
    /// A step returns `Ok(None)` or `WouldBlock` while waiting. Without
    /// `blocking` that is returned to the caller as `WouldBlock` once
    /// the transport is stalled.
    pub(crate) fn drive<R>(
        &mut self,
        blocking: bool,
        mut step: impl FnMut(&mut Self) -> Result<Option<R>>,
    ) -> Result<R> {
        loop {
            self.check_running()?;
            let mut progressed = self.pump()?;
            match step(self) {
                Ok(Some(r)) => return Ok(r),
                Ok(None) | Err(Error::WouldBlock) => (),
                Err(e) => return Err(self.fail(e)),
            }
            progressed |= self.pump()?;

            if !progressed {
                if !blocking {
                    return Err(Error::WouldBlock);
                }
                self.transport.wait().map_err(|e| self.fail(e))?;
            }
        }
    }

    /// Moves data between the transport and the connection until
    /// neither can progress. Returns whether anything happened.
    pub(crate) fn pump(&mut self) -> Result<bool> {
        self.check_running()?;
        let mut progressed = false;
        loop {
            match self.pump_once() {
                Ok(true) => progressed = true,
                Ok(false) => return Ok(progressed),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn pump_once(&mut self) -> Result<bool> {
        let mut progressed = false;

        while self.conn.progress(&mut self.traf_out.sender(&mut self.keys))?
            != DispatchEvent::None
        {
            progressed = true;
        }

        if let Some((payload, seq)) = self.traf_in.payload() {
            let ev =
                self.conn.handle_payload(payload, seq, &mut self.traf_out.sender(&mut self.keys));
            self.traf_in.done_payload();
            if let DispatchEvent::Disconnect { reason, desc } = ev? {
                return Err(Error::PeerDisconnected { reason, desc });
            }
            progressed = true;
        }

        if self.rpos < self.rlen {
            let n = self.traf_in.input(
                &mut self.keys,
                &mut self.conn.remote_version,
                &self.rbuf[self.rpos..self.rlen],
            )?;
            self.rpos += n;
            progressed |= n > 0;
        }

        while self.traf_out.output_pending() {
            match self.transport.try_write(self.traf_out.pending()) {
                Ok(0) | Err(Error::WouldBlock) => break,
                Ok(n) => {
                    self.traf_out.consume(n);
                    progressed = true;
                }
                Err(e) => return Err(e),
            }
        }

        if self.rpos == self.rlen && self.traf_in.ready_input() {
            match self.transport.try_read(&mut self.rbuf) {
                Ok(0) => return Err(Error::TransportClosed),
                Ok(n) => {
                    trace!("read {n}");
                    self.rpos = 0;
                    self.rlen = n;
                    progressed = true;
                }
                Err(Error::WouldBlock) => (),
                Err(e) => return Err(e),
            }
        }

        Ok(progressed)
    }

    pub(crate) fn open_channel(&mut self) -> Result<ChanNum> {
        if !self.conn.is_authed() {
            return Err(Error::InvalidState { what: "not authenticated" });
        }
        let (num, p) = self.conn.channels.open_session()?;
        self.traf_out.sender(&mut self.keys).send(p)?;
        Ok(num)
    }

    pub(crate) fn channel_open_status(&self, num: ChanNum) -> Result<OpenStatus> {
        self.conn.channels.open_status(num)
    }

    pub(crate) fn request_subsystem(&mut self, num: ChanNum, name: &str) -> Result<()> {
        self.conn.channels.request_subsystem(num, name, &mut self.traf_out.sender(&mut self.keys))
    }

    pub(crate) fn channel_req_status(&self, num: ChanNum) -> Result<ReqStatus> {
        self.conn.channels.req_status(num)
    }

    pub(crate) fn channel_exit_status(&self, num: ChanNum) -> Option<u32> {
        self.conn.channels.exit_status(num)
    }

    /// Closes a channel, best effort
    pub(crate) fn close_channel(&mut self, num: ChanNum) {
        if self.check_running().is_err() {
            return;
        }
        let r = self.conn.channels.close(num, &mut self.traf_out.sender(&mut self.keys));
        if let Err(e) = r.and_then(|_| self.pump()) {
            debug!("Closing channel {num}: {e}");
        }
    }

    pub(crate) fn chan_io(&mut self, num: ChanNum) -> SessChan<'_, T> {
        SessChan { sess: self, num }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.state != SessState::Running {
            return;
        }
        let r = self.queue_disconnect("Session closed").and_then(|_| self.flush_output());
        if let Err(e) = r {
            debug!("Disconnect on drop: {e}");
        }
        let _ = self.transport.close();
    }
}

/// Channel data through a session, for the SFTP client
pub(crate) struct SessChan<'s, T: Transport> {
    sess: &'s mut Session<T>,
    num: ChanNum,
}

impl<T: Transport> ChanIo for SessChan<'_, T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let sess = &mut *self.sess;
        sess.pump()?;
        let r = sess.conn.channels.send_data(self.num, buf, &mut sess.traf_out.sender(&mut sess.keys));
        sess.pump()?;
        r
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let sess = &mut *self.sess;
        sess.pump()?;
        sess.conn.channels.read(self.num, buf, &mut sess.traf_out.sender(&mut sess.keys))
    }

    fn wait(&mut self) -> Result<()> {
        let sess = &mut *self.sess;
        sess.transport.wait().map_err(|e| sess.fail(e))
    }
}
