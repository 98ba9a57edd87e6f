//! Sessions against an in-process server, over an in-memory transport.

use std::path::PathBuf;

use crate::config::{AuthMethod, Config, HashKind};
use crate::dusklog::init_test_log;
use crate::encrypt::KeyState;
use crate::error::{Error, ErrorKind, Result, SftpError};
use crate::ident::RemoteVersion;
use crate::kex::{AlgoConfig, Kex, SessId};
use crate::packets::{self, *};
use crate::session::{Credentials, Fingerprint, Session};
use crate::sftp::client::tests::{three_entries, MockServer};
use crate::sftp::client::ChanIo;
use crate::sftp::{ReadEntry, SftpChannel};
use crate::sign::tests::openssh_test_key;
use crate::sign::{SigType, SignKey};
use crate::sshnames::{DisconnectReason, SSH_SUBSYSTEM_SFTP};
use crate::sshwire::{self, BinString};
use crate::traffic::{TrafIn, TrafOut};
use crate::transport::Transport;

/// A SSH server with one user, serving SFTP from a [`MockServer`]
struct TestServer {
    traf_in: TrafIn,
    traf_out: TrafOut,
    keys: KeyState,
    remote_version: RemoteVersion,
    kex: Kex,
    algo_conf: AlgoConfig,
    hostkey: SignKey,
    sess_id: Option<SessId>,

    password: &'static str,
    allowed_key: Option<SignKey>,
    refuse_subsystem: bool,
    disconnect_on_auth_failure: bool,

    /// The client's number for the open channel
    chan: Option<u32>,
    window: usize,
    max_packet: usize,
    sftp: MockServer,
    /// SFTP output not yet sent as channel data
    sftp_out: Vec<u8>,

    auth_attempts: usize,
    closed_channels: usize,
    /// Description of the client's disconnect
    got_disconnect: Option<String>,
    sent_disconnect: bool,
}

impl TestServer {
    fn new() -> Self {
        let mut s = Self {
            traf_in: TrafIn::new(),
            traf_out: TrafOut::new(),
            keys: KeyState::new_cleartext(),
            remote_version: RemoteVersion::new(),
            kex: Kex::new(),
            algo_conf: AlgoConfig::new(false).unwrap(),
            hostkey: SignKey::generate().unwrap(),
            sess_id: None,
            password: "password",
            allowed_key: None,
            refuse_subsystem: false,
            disconnect_on_auth_failure: false,
            chan: None,
            window: 0,
            max_packet: 0,
            sftp: MockServer::new(vec![three_entries()]),
            sftp_out: vec![],
            auth_attempts: 0,
            closed_channels: 0,
            got_disconnect: None,
            sent_disconnect: false,
        };
        s.traf_out.send_version();
        s.kex.send_kexinit(&s.algo_conf, &mut s.traf_out.sender(&mut s.keys)).unwrap();
        s
    }

    fn input(&mut self, mut buf: &[u8]) {
        while !buf.is_empty() {
            let n = self.traf_in.input(&mut self.keys, &mut self.remote_version, buf).unwrap();
            buf = &buf[n..];
            let payload = self.traf_in.payload().map(|(p, _seq)| p.to_vec());
            self.traf_in.done_payload();
            match payload {
                Some(p) => self.handle(&p),
                None => assert!(n > 0, "stuck on input"),
            }
        }
    }

    fn send<'p>(&mut self, p: impl Into<Packet<'p>>) {
        self.traf_out.sender(&mut self.keys).send(p).unwrap()
    }

    fn handle(&mut self, payload: &[u8]) {
        let p = sshwire::packet_from_bytes(payload, &ParseContext::new()).unwrap();
        match p {
            Packet::KexInit(k) => {
                let first = self.sess_id.is_none();
                let s = &mut self.traf_out.sender(&mut self.keys);
                self.kex
                    .handle_kexinit(k, false, &self.algo_conf, &self.remote_version, first, s)
                    .unwrap();
            }
            Packet::KexDHInit(p) => {
                let s = &mut self.traf_out.sender(&mut self.keys);
                self.kex.handle_kexdhinit(&p, s, &self.hostkey).unwrap();
            }
            Packet::NewKeys(_) => {
                let s = &mut self.traf_out.sender(&mut self.keys);
                self.kex.handle_newkeys(&mut self.sess_id, s).unwrap();
            }
            Packet::ServiceRequest(p) => self.send(ServiceAccept { name: p.name }),
            Packet::UserauthRequest(r) => {
                self.auth_attempts += 1;
                let ok = match r.method {
                    packets::AuthMethod::Password(ref m) => {
                        m.password.as_str().unwrap() == self.password
                    }
                    packets::AuthMethod::PubKey(ref m) => self.check_pubkey(&r, m),
                    _ => false,
                };
                if ok {
                    self.send(UserauthSuccess {});
                } else {
                    self.send(UserauthFailure {
                        methods: "publickey,password".try_into().unwrap(),
                        partial: false,
                    });
                    if self.disconnect_on_auth_failure {
                        self.send(Disconnect {
                            reason: DisconnectReason::SSH_DISCONNECT_BY_APPLICATION as u32,
                            desc: "go away".into(),
                            lang: "".into(),
                        });
                        self.sent_disconnect = true;
                    }
                }
            }
            Packet::ChannelOpen(p) => {
                assert!(matches!(p.ty, ChannelOpenType::Session));
                self.chan = Some(p.num);
                self.window = p.initial_window as usize;
                self.max_packet = p.max_packet as usize;
                self.send(ChannelOpenConfirmation {
                    num: p.num,
                    sender_num: 0,
                    initial_window: 100_000,
                    max_packet: 32768,
                });
            }
            Packet::ChannelRequest(r) => {
                let num = self.chan.unwrap();
                let ChannelReqType::Subsystem(sub) = &r.req else { panic!("{r:?}") };
                assert_eq!(sub.subsystem.as_str().unwrap(), SSH_SUBSYSTEM_SFTP);
                assert!(r.want_reply);
                if self.refuse_subsystem {
                    self.send(ChannelFailure { num })
                } else {
                    self.send(ChannelSuccess { num })
                }
            }
            Packet::ChannelData(d) => {
                let mut data = d.data.0;
                while !data.is_empty() {
                    let n = self.sftp.write(data).unwrap();
                    data = &data[n..];
                }
                let mut buf = [0u8; 1024];
                loop {
                    match self.sftp.read(&mut buf) {
                        Ok(n) => self.sftp_out.extend_from_slice(&buf[..n]),
                        Err(Error::WouldBlock) => break,
                        Err(e) => panic!("{e}"),
                    }
                }
                self.flush_sftp();
            }
            Packet::ChannelWindowAdjust(a) => {
                self.window += a.adjust as usize;
                self.flush_sftp();
            }
            Packet::ChannelEof(_) => (),
            Packet::ChannelClose(_) => {
                let num = self.chan.take().unwrap();
                self.send(ChannelClose { num });
                self.closed_channels += 1;
            }
            Packet::Disconnect(d) => self.got_disconnect = Some(d.desc.to_lossy()),
            p => panic!("unexpected {p:?}"),
        }
    }

    fn check_pubkey(&self, r: &UserauthRequest, m: &MethodPubKey) -> bool {
        let Some(allowed) = &self.allowed_key else { return false };
        if m.pubkey.0 != allowed.pubkey() {
            return false;
        }
        let Some(sig) = &m.sig else { return false };
        let msg = AuthSigMsg {
            sess_id: BinString(self.sess_id.as_ref().unwrap()),
            username: r.username.clone(),
            service: r.service,
            sig_algo: m.sig_algo,
            pubkey: m.pubkey.clone(),
        };
        SigType::Ed25519.verify(&m.pubkey.0, &msg, &sig.0).is_ok()
    }

    fn flush_sftp(&mut self) {
        let Some(num) = self.chan else { return };
        while !self.sftp_out.is_empty() && self.window > 0 {
            let n = self.sftp_out.len().min(self.window).min(self.max_packet);
            self.traf_out
                .sender(&mut self.keys)
                .send(ChannelData { num, data: BinString(&self.sftp_out[..n]) })
                .unwrap();
            self.sftp_out.drain(..n);
            self.window -= n;
        }
    }
}

/// The client end of a connection to a [`TestServer`]
struct Pipe {
    server: TestServer,
    /// `WouldBlock` on every nth read or write, when non-zero
    block_every: usize,
    calls: usize,
    would_blocks: usize,
    /// Largest read or write per call
    max_io: usize,
    waits: usize,
    closed: bool,
}

impl Pipe {
    fn new(server: TestServer) -> Self {
        Self {
            server,
            block_every: 0,
            calls: 0,
            would_blocks: 0,
            max_io: usize::MAX,
            waits: 0,
            closed: false,
        }
    }

    fn blocked(&mut self) -> bool {
        self.calls += 1;
        let b = self.block_every > 0 && self.calls % self.block_every == 0;
        if b {
            self.would_blocks += 1;
        }
        b
    }
}

impl Transport for Pipe {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        assert!(!self.closed, "read after close");
        if self.blocked() {
            return Err(Error::WouldBlock);
        }
        let out = self.server.traf_out.pending();
        if out.is_empty() {
            return if self.server.sent_disconnect { Ok(0) } else { Err(Error::WouldBlock) };
        }
        let n = out.len().min(buf.len()).min(self.max_io);
        buf[..n].copy_from_slice(&out[..n]);
        self.server.traf_out.consume(n);
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<usize> {
        assert!(!self.closed, "write after close");
        if self.blocked() {
            return Err(Error::WouldBlock);
        }
        let n = buf.len().min(self.max_io);
        self.server.input(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        self.waits += 1;
        assert!(self.waits < 10_000, "waiting forever");
        Ok(())
    }
}

fn blocking() -> Config {
    Config::new().blocking(true)
}

/// Retries a non-blocking operation until it completes
fn retry<R>(sess: &mut Session<Pipe>, mut f: impl FnMut(&mut Session<Pipe>) -> Result<R>) -> R {
    for _ in 0..100_000 {
        match f(sess) {
            Err(Error::WouldBlock) => continue,
            r => return r.unwrap(),
        }
    }
    panic!("no progress")
}

fn names(sftp: &mut SftpChannel<'_, Pipe>, path: &str) -> Vec<String> {
    let h = sftp.open_directory(path).unwrap();
    let ents = sftp.read_all(&h).unwrap();
    sftp.close_directory(&h).unwrap();
    ents.iter().map(|e| e.name_lossy().into_owned()).collect()
}

#[test]
fn password_listing() {
    init_test_log();
    let mut sess = Session::connect(Pipe::new(TestServer::new()), blocking()).unwrap();

    let mut blob = vec![];
    sshwire::write_ssh_vec(&mut blob, &sess.transport().server.hostkey.pubkey()).unwrap();
    assert_eq!(sess.fingerprint(HashKind::Md5).unwrap(), Fingerprint::new(HashKind::Md5, &blob));
    assert_eq!(sess.host_fingerprint().unwrap().as_bytes().len(), HashKind::Md5.len());
    let f = sess.fingerprint(HashKind::Sha256).unwrap();
    assert!(f.to_string().starts_with("SHA256:"));

    let e = sess.authenticate_password("username", "wrong").unwrap_err();
    let Error::AuthFailed { methods } = &e else { panic!("{e:?}") };
    assert!(methods.contains("password"));
    assert!(!sess.is_failed());
    assert!(!sess.is_authenticated());

    sess.authenticate_password("username", "password").unwrap();
    assert!(sess.is_authenticated());
    assert_eq!(sess.auth_method(), Some(AuthMethod::Password));
    assert_eq!(sess.transport().server.auth_attempts, 2);

    {
        let mut sftp = SftpChannel::open(&mut sess).unwrap();
        assert_eq!(sftp.server_version(), 3);
        assert!(sftp.extensions().iter().any(|(n, _)| n == "limits@openssh.com"));

        let h = sftp.open_directory("/tmp/d").unwrap();
        let mut ents = vec![];
        while let ReadEntry::Entry(e) = sftp.read_entry(&h).unwrap() {
            ents.push(e);
        }
        assert_eq!(ents.len(), 3);
        assert_eq!(ents[0].name, b"a");
        assert_eq!(ents[0].attrs.size, Some(10));
        assert_eq!(ents[1].attrs.uidgid.map(|i| i.uid), Some(1000));
        assert_eq!(ents[1].attrs.size, None);
        assert_eq!(ents[2].name, b".");

        sftp.close_directory(&h).unwrap();
        assert!(matches!(sftp.close_directory(&h), Err(Error::AlreadyClosed)));

        assert_eq!(sftp.realpath("x").unwrap(), "/home/user/x");
        assert!(!sftp.is_failed());
        assert_eq!(sftp.exit_status(), None);
    }
    assert_eq!(sess.transport().server.closed_channels, 1);

    sess.disconnect("Normal Shutdown, Thank you for playing").unwrap();
    assert!(sess.transport().closed);
    assert_eq!(
        sess.transport().server.got_disconnect.as_deref(),
        Some("Normal Shutdown, Thank you for playing")
    );
    sess.disconnect("again").unwrap();

    let e = sess.authenticate_password("username", "password").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Usage);
}

#[test]
fn nonblocking_listing() {
    init_test_log();
    let mut pipe = Pipe::new(TestServer::new());
    pipe.block_every = 3;
    pipe.max_io = 7;
    let mut sess = Session::new(pipe, Config::new()).unwrap();

    retry(&mut sess, |s| s.handshake());
    assert!(sess.fingerprint(HashKind::Sha1).is_ok());
    retry(&mut sess, |s| s.authenticate_password("username", "password"));

    let mut sftp = loop {
        match SftpChannel::open(&mut sess) {
            Err(Error::WouldBlock) => continue,
            r => break r.unwrap(),
        }
    };
    assert!(!sftp.is_blocking());

    let h = loop {
        match sftp.open_directory("/tmp/d") {
            Err(Error::WouldBlock) => continue,
            r => break r.unwrap(),
        }
    };
    let mut got = vec![];
    loop {
        match sftp.read_entry(&h) {
            Err(Error::WouldBlock) => continue,
            Ok(ReadEntry::Entry(e)) => got.push(e.name),
            Ok(ReadEntry::EndOfListing) => break,
            Err(e) => panic!("{e}"),
        }
    }
    assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b".".to_vec()]);
    loop {
        match sftp.close_directory(&h) {
            Err(Error::WouldBlock) => continue,
            r => break r.unwrap(),
        }
    }
    drop(sftp);

    assert!(sess.transport().would_blocks > 0);
    retry(&mut sess, |s| s.disconnect("done"));
    assert!(sess.transport().closed);
}

#[test]
fn missing_directory() {
    init_test_log();
    let mut sess = Session::connect(Pipe::new(TestServer::new()), blocking()).unwrap();
    sess.authenticate_password("username", "password").unwrap();
    let mut sftp = SftpChannel::open(&mut sess).unwrap();

    let e = sftp.open_directory("/nonexistent").unwrap_err();
    assert_eq!(e.sftp_code(), Some(SftpError::NoSuchFile));
    assert!(!e.is_fatal());

    // The channel is still usable
    assert_eq!(names(&mut sftp, "/tmp/d"), ["a", "b", "."]);
}

#[test]
fn shutdown_after_failed_listing() {
    init_test_log();
    let mut sess = Session::connect(Pipe::new(TestServer::new()), blocking()).unwrap();
    sess.authenticate_password("username", "password").unwrap();
    {
        let mut sftp = SftpChannel::open(&mut sess).unwrap();
        assert!(sftp.open_directory("/nonexistent").is_err());
    }
    // the session still shuts down with its own description, not Drop's
    sess.disconnect("Normal Shutdown, Thank you for playing").unwrap();
    assert!(sess.transport().closed);
    assert_eq!(
        sess.transport().server.got_disconnect.as_deref(),
        Some("Normal Shutdown, Thank you for playing")
    );
}

fn key_file(name: &str, pem: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!("dusk-{}-{name}", std::process::id()));
    std::fs::write(&p, pem).unwrap();
    p
}

#[test]
fn publickey_auth() {
    init_test_log();
    let pem = openssh_test_key(7, Some("hunter2"));
    let path = key_file("pk_good", &pem);

    let mut server = TestServer::new();
    server.allowed_key = Some(SignKey::from_openssh(&pem, Some("hunter2")).unwrap());
    let conf = blocking().auth_method(AuthMethod::PublicKey);
    let mut sess = Session::connect(Pipe::new(server), conf).unwrap();

    // Missing private key path
    let r = sess.authenticate(&Credentials { username: "username", ..Default::default() });
    assert!(matches!(r, Err(Error::BadUsage { .. })));

    let creds = Credentials {
        username: "username",
        privkey_path: Some(&path),
        passphrase: Some("hunter2"),
        ..Default::default()
    };
    sess.authenticate(&creds).unwrap();
    assert_eq!(sess.auth_method(), Some(AuthMethod::PublicKey));

    let mut sftp = SftpChannel::open(&mut sess).unwrap();
    assert_eq!(names(&mut sftp, "/tmp/d").len(), 3);
    drop(sftp);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn publickey_rejected() {
    init_test_log();
    let path = key_file("pk_other", &openssh_test_key(8, None));

    let mut server = TestServer::new();
    let allowed = openssh_test_key(9, None);
    server.allowed_key = Some(SignKey::from_openssh(&allowed, None).unwrap());
    let mut sess = Session::connect(Pipe::new(server), blocking()).unwrap();

    let e = sess.authenticate_publickey("username", None, &path, None).unwrap_err();
    assert!(matches!(e, Error::AuthFailed { .. }));
    assert!(!sess.is_failed());
    std::fs::remove_file(path).unwrap();
}

#[test]
fn before_handshake() {
    init_test_log();
    let mut pipe = Pipe::new(TestServer::new());
    // Stalled until the handshake below
    pipe.block_every = 1;
    let mut sess = Session::new(pipe, Config::new()).unwrap();

    assert!(matches!(sess.fingerprint(HashKind::Md5), Err(Error::InvalidState { .. })));
    let e = sess.authenticate_password("username", "password").unwrap_err();
    assert!(matches!(e, Error::InvalidState { .. }));
    assert!(!sess.is_failed());
    assert!(matches!(SftpChannel::open(&mut sess), Err(Error::InvalidState { .. })));

    sess.transport_mut().block_every = 0;
    retry(&mut sess, |s| s.handshake());
    // Not authenticated yet
    assert!(matches!(SftpChannel::open(&mut sess), Err(Error::InvalidState { .. })));
    assert!(!sess.is_failed());
}

#[test]
fn peer_disconnect() {
    init_test_log();
    let mut server = TestServer::new();
    server.disconnect_on_auth_failure = true;
    let mut sess = Session::connect(Pipe::new(server), blocking()).unwrap();

    let mut e = sess.authenticate_password("username", "wrong").unwrap_err();
    if matches!(e, Error::AuthFailed { .. }) {
        e = sess.authenticate_password("username", "wrong").unwrap_err();
    }
    assert!(matches!(e, Error::PeerDisconnected { .. }), "{e:?}");
    assert!(sess.is_failed());

    let e = sess.authenticate_password("username", "password").unwrap_err();
    assert!(matches!(e, Error::SessionFailed));
    assert!(sess.fingerprint(HashKind::Md5).is_ok());
}

#[test]
fn subsystem_refused() {
    init_test_log();
    let mut server = TestServer::new();
    server.refuse_subsystem = true;
    let mut sess = Session::connect(Pipe::new(server), blocking()).unwrap();
    sess.authenticate_password("username", "password").unwrap();

    let e = SftpChannel::open(&mut sess).err().unwrap();
    assert!(matches!(e, Error::SubsystemRefused { name: "sftp" }));
    assert!(!sess.is_failed());
    // The refused channel was closed
    assert_eq!(sess.transport().server.closed_channels, 1);
}
