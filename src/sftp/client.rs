//! SFTP request engine and directory listing.
//!
//! [`SftpClient`] is sans-IO. It queues framed requests and parses
//! responses, moving bytes through a [`ChanIo`] which is the SSH channel
//! in a session, or a mock server in tests.
//!
//! Every operation is retry-safe. A call that returns [`Error::WouldBlock`]
//! keeps its request queued or in flight, and the identical call later
//! picks up the same request id.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::Wrapping;

use crate::config::MAX_SFTP_PACKET;
use crate::sftp::proto::{self, *};
use crate::sshwire::{self, BinString};

const READ_CHUNK: usize = 16 * 1024;

/// Byte transport for SFTP packets.
pub(crate) trait ChanIo {
    /// Writes some of `buf`, returning the length written.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Reads available data. Returns [`Error::WouldBlock`] when none is
    /// available and [`Error::ChannelEOF`] at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Waits for the transport to become ready, used in blocking mode.
    fn wait(&mut self) -> Result<()>;
}

/// An open remote directory.
///
/// Returned by [`SftpChannel::open_directory`](crate::SftpChannel::open_directory),
/// valid until closed with
/// [`close_directory`](crate::SftpChannel::close_directory).
#[derive(Debug, PartialEq, Eq)]
pub struct DirHandle {
    token: u64,
}

/// Result of [`SftpChannel::read_entry`](crate::SftpChannel::read_entry)
#[derive(Debug)]
pub enum ReadEntry {
    Entry(DirEntry),
    /// The server has no more entries. Only close is valid afterwards.
    EndOfListing,
}

/// Lifecycle of a directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    Idle,
    Opening,
    Open,
    Reading,
    Closed,
    Failed,
}

/// A directory entry.
///
/// Names are bytes as sent by the server, they needn't be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    /// `ls -l` style line from the server
    pub longname: Vec<u8>,
    pub attrs: Attrs,
}

impl DirEntry {
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// `SSH_FILEXFER_ATTR_*` flags, derived from which attributes are present
    pub fn flags(&self) -> u32 {
        self.attrs.flags()
    }

    /// `None` if the server didn't send permissions
    pub fn is_dir(&self) -> Option<bool> {
        self.attrs.permissions.map(|p| p & 0o170000 == 0o040000)
    }
}

impl From<NameEntry<'_>> for DirEntry {
    fn from(e: NameEntry) -> Self {
        Self {
            name: e.filename.as_bytes().to_vec(),
            longname: e.longname.as_bytes().to_vec(),
            attrs: e.attrs,
        }
    }
}

/// A response, copied out of the receive buffer
#[derive(Debug)]
enum Reply {
    Status { code: StatusCode, msg: String },
    Handle(Vec<u8>),
    Name(Vec<DirEntry>),
}

impl Reply {
    fn into_error(self) -> Error {
        match self {
            Reply::Status { code, msg } => Error::Sftp { code: code.into(), msg },
            _ => Error::SftpProto { msg: "Unexpected reply type" },
        }
    }
}

#[derive(Debug)]
struct ServerVersion {
    version: u32,
    extensions: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
struct Lister {
    path: Vec<u8>,
    state: DirState,
    /// Server's handle, set once opened
    handle: Option<Vec<u8>>,
    open_id: u32,
    entries: VecDeque<DirEntry>,
    /// Outstanding `SSH_FXP_READDIR`. At most one per handle.
    readdir: Option<u32>,
    eof: bool,
    close_id: Option<u32>,
}

impl Lister {
    fn new(path: &[u8], open_id: u32) -> Self {
        Self {
            path: path.to_vec(),
            state: DirState::Idle,
            handle: None,
            open_id,
            entries: VecDeque::new(),
            readdir: None,
            eof: false,
            close_id: None,
        }
    }

    fn set_state(&mut self, state: DirState) {
        trace!("dir {:?} {:?} -> {state:?}", String::from_utf8_lossy(&self.path), self.state);
        self.state = state;
    }
}

pub(crate) struct SftpClient {
    next_id: Wrapping<u32>,
    /// Framed requests waiting to be written
    out: Vec<u8>,
    /// Partial incoming packets
    rx: Vec<u8>,
    inflight: HashSet<u32>,
    /// Requests whose response will be dropped
    abandoned: HashSet<u32>,
    replies: HashMap<u32, Reply>,

    init_sent: bool,
    version: Option<ServerVersion>,

    dirs: HashMap<u64, Lister>,
    next_token: u64,
    pending_open: Option<u64>,
    pending_realpath: Option<(Vec<u8>, u32)>,

    failed: bool,
    pub blocking: bool,
}

impl SftpClient {
    pub fn new(blocking: bool) -> Self {
        Self {
            next_id: Wrapping(0),
            out: Vec::new(),
            rx: Vec::new(),
            inflight: HashSet::new(),
            abandoned: HashSet::new(),
            replies: HashMap::new(),
            init_sent: false,
            version: None,
            dirs: HashMap::new(),
            next_token: 0,
            pending_open: None,
            pending_realpath: None,
            failed: false,
            blocking,
        }
    }

    /// Sends `SSH_FXP_INIT` and waits for the server's version.
    pub fn init(&mut self, io: &mut impl ChanIo) -> Result<()> {
        self.run(io, |c, io| c.init_step(io))
    }

    pub fn open_directory(&mut self, io: &mut impl ChanIo, path: &str) -> Result<DirHandle> {
        self.run(io, |c, io| c.open_directory_step(io, path))
    }

    pub fn read_entry(&mut self, io: &mut impl ChanIo, h: &DirHandle) -> Result<ReadEntry> {
        self.run(io, |c, io| c.read_entry_step(io, h))
    }

    pub fn close_directory(&mut self, io: &mut impl ChanIo, h: &DirHandle) -> Result<()> {
        self.run(io, |c, io| c.close_directory_step(io, h))
    }

    pub fn realpath(&mut self, io: &mut impl ChanIo, path: &str) -> Result<String> {
        self.run(io, |c, io| c.realpath_step(io, path))
    }

    pub fn state(&self, h: &DirHandle) -> DirState {
        self.dirs.get(&h.token).map(|l| l.state).unwrap_or(DirState::Closed)
    }

    pub fn server_version(&self) -> Option<u32> {
        self.version.as_ref().map(|v| v.version)
    }

    pub fn extensions(&self) -> &[(String, Vec<u8>)] {
        self.version.as_ref().map(|v| v.extensions.as_slice()).unwrap_or(&[])
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Runs a step, looping on `WouldBlock` in blocking mode.
    fn run<IO, R>(
        &mut self,
        io: &mut IO,
        mut f: impl FnMut(&mut Self, &mut IO) -> Result<R>,
    ) -> Result<R>
    where
        IO: ChanIo,
    {
        if self.failed {
            return Err(Error::SessionFailed);
        }
        loop {
            match f(self, io) {
                Err(Error::WouldBlock) if self.blocking => io.wait()?,
                Err(e) => {
                    if e.is_fatal() || matches!(e, Error::ChannelEOF) {
                        debug!("SFTP failed: {e}");
                        self.failed = true;
                    }
                    return Err(e);
                }
                Ok(r) => return Ok(r),
            }
        }
    }

    fn check_ready(&self) -> Result<()> {
        if self.version.is_none() {
            return Err(Error::InvalidState { what: "SFTP isn't initialised" });
        }
        Ok(())
    }

    fn init_step(&mut self, io: &mut impl ChanIo) -> Result<()> {
        if self.version.is_some() {
            return Ok(());
        }
        if !self.init_sent {
            let p = SftpPacket::Init(Init { version: SFTP_VERSION, extensions: vec![] });
            proto::write_framed(&mut self.out, &p)?;
            self.init_sent = true;
        }
        self.progress(io)?;
        match &self.version {
            Some(v) => {
                debug!("SFTP version {}, extensions {:?}", v.version, v.extensions);
                Ok(())
            }
            None => Err(Error::WouldBlock),
        }
    }

    fn open_directory_step(&mut self, io: &mut impl ChanIo, path: &str) -> Result<DirHandle> {
        self.check_ready()?;

        let token = match self.pending_open {
            Some(t) => {
                let l = self.dirs.get(&t).trap()?;
                if l.path != path.as_bytes() {
                    return Err(Error::BadUsage { what: "another directory open is in progress" });
                }
                t
            }
            None => {
                let token = self.next_token;
                self.next_token += 1;
                let id = self.alloc_id();
                let mut l = Lister::new(path.as_bytes(), id);
                self.queue(&SftpPacket::OpenDir(ReqId(id), OpenDir { path: path.into() }))?;
                l.set_state(DirState::Opening);
                self.dirs.insert(token, l);
                self.pending_open = Some(token);
                token
            }
        };

        self.progress(io)?;

        let open_id = self.dirs.get(&token).trap()?.open_id;
        let Some(reply) = self.replies.remove(&open_id) else {
            return Err(Error::WouldBlock);
        };
        self.pending_open = None;

        match reply {
            Reply::Handle(handle) => {
                let l = self.dirs.get_mut(&token).trap()?;
                l.handle = Some(handle);
                l.set_state(DirState::Open);
                Ok(DirHandle { token })
            }
            r => {
                // never handed out, nothing can refer to it
                self.dirs.remove(&token);
                Err(r.into_error())
            }
        }
    }

    fn read_entry_step(&mut self, io: &mut impl ChanIo, h: &DirHandle) -> Result<ReadEntry> {
        self.check_ready()?;

        loop {
            let l = self.lister_mut(h)?;
            match l.state {
                DirState::Open | DirState::Reading => (),
                DirState::Closed => return Err(Error::InvalidState { what: "directory is closed" }),
                DirState::Failed => return Err(Error::InvalidState { what: "directory failed" }),
                DirState::Idle | DirState::Opening => return Error::bug_msg("unopened handle"),
            }
            if l.close_id.is_some() {
                return Err(Error::InvalidState { what: "directory is closing" });
            }
            if let Some(e) = l.entries.pop_front() {
                return Ok(ReadEntry::Entry(e));
            }
            if l.eof {
                return Err(Error::InvalidState { what: "listing has ended" });
            }

            let readdir = l.readdir;
            let id = match readdir {
                Some(id) => id,
                None => {
                    let handle = l.handle.clone().trap()?;
                    let id = self.alloc_id();
                    self.queue(&SftpPacket::ReadDir(
                        ReqId(id),
                        ReadDir { handle: FileHandle(BinString(&handle)) },
                    ))?;
                    let l = self.lister_mut(h)?;
                    l.readdir = Some(id);
                    if l.state == DirState::Open {
                        l.set_state(DirState::Reading);
                    }
                    id
                }
            };

            self.progress(io)?;

            let Some(reply) = self.replies.remove(&id) else {
                return Err(Error::WouldBlock);
            };
            let l = self.lister_mut(h)?;
            l.readdir = None;

            match reply {
                Reply::Name(names) => {
                    trace!("{} entries", names.len());
                    l.entries.extend(names);
                    // An empty NAME sends another READDIR
                }
                Reply::Status { code: StatusCode::SSH_FX_EOF, .. } => {
                    l.eof = true;
                    return Ok(ReadEntry::EndOfListing);
                }
                r => {
                    l.set_state(DirState::Failed);
                    return Err(r.into_error());
                }
            }
        }
    }

    fn close_directory_step(&mut self, io: &mut impl ChanIo, h: &DirHandle) -> Result<()> {
        self.check_ready()?;

        if self.is_forgotten(h) {
            return Err(Error::AlreadyClosed);
        }
        let l = self.lister_mut(h)?;

        let close_id = l.close_id;
        let close_id = match close_id {
            Some(id) => id,
            None => {
                l.entries.clear();
                let readdir = l.readdir.take();
                let handle = l.handle.take();
                if let Some(id) = readdir {
                    self.abandon(id);
                }
                let Some(handle) = handle else {
                    self.forget(h);
                    return Ok(());
                };
                let id = self.alloc_id();
                self.queue(&SftpPacket::Close(
                    ReqId(id),
                    Close { handle: FileHandle(BinString(&handle)) },
                ))?;
                self.lister_mut(h)?.close_id = Some(id);
                id
            }
        };

        self.progress(io)?;

        let Some(reply) = self.replies.remove(&close_id) else {
            return Err(Error::WouldBlock);
        };
        self.forget(h);
        match reply {
            Reply::Status { code: StatusCode::SSH_FX_OK, .. } => Ok(()),
            r => Err(r.into_error()),
        }
    }

    fn realpath_step(&mut self, io: &mut impl ChanIo, path: &str) -> Result<String> {
        self.check_ready()?;

        let id = match &self.pending_realpath {
            Some((p, id)) => {
                if p != path.as_bytes() {
                    return Err(Error::BadUsage { what: "another realpath is in progress" });
                }
                *id
            }
            None => {
                let id = self.alloc_id();
                self.queue(&SftpPacket::RealPath(ReqId(id), RealPath { path: path.into() }))?;
                self.pending_realpath = Some((path.as_bytes().to_vec(), id));
                id
            }
        };

        self.progress(io)?;

        let Some(reply) = self.replies.remove(&id) else {
            return Err(Error::WouldBlock);
        };
        self.pending_realpath = None;
        match reply {
            Reply::Name(mut names) if names.len() == 1 => {
                let n = names.pop().trap()?;
                Ok(String::from_utf8_lossy(&n.name).into_owned())
            }
            Reply::Name(_) => Err(Error::SftpProto { msg: "realpath returned multiple names" }),
            r => Err(r.into_error()),
        }
    }

    fn lister_mut(&mut self, h: &DirHandle) -> Result<&mut Lister> {
        if self.is_forgotten(h) {
            return Err(Error::InvalidState { what: "directory is closed" });
        }
        self.dirs.get_mut(&h.token).ok_or(Error::BadUsage { what: "unknown directory handle" })
    }

    /// Closed listers are removed. Tokens only increase, so a missing
    /// token that was already handed out belonged to a closed directory.
    fn is_forgotten(&self, h: &DirHandle) -> bool {
        h.token < self.next_token && !self.dirs.contains_key(&h.token)
    }

    fn forget(&mut self, h: &DirHandle) {
        if let Some(mut l) = self.dirs.remove(&h.token) {
            l.set_state(DirState::Closed);
        }
    }

    /// Returns an id that isn't in flight, abandoned, or awaiting collection.
    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id.0;
            self.next_id += 1;
            if !self.inflight.contains(&id)
                && !self.abandoned.contains(&id)
                && !self.replies.contains_key(&id)
            {
                self.inflight.insert(id);
                return id;
            }
        }
    }

    fn abandon(&mut self, id: u32) {
        if self.replies.remove(&id).is_none() && self.inflight.remove(&id) {
            trace!("abandoned request {id}");
            self.abandoned.insert(id);
        }
    }

    fn queue(&mut self, p: &SftpPacket) -> Result<()> {
        trace!("queue {p:?}");
        proto::write_framed(&mut self.out, p)
    }

    /// Writes pending requests and handles any available responses.
    ///
    /// Never returns `WouldBlock`, callers check for their reply.
    fn progress(&mut self, io: &mut impl ChanIo) -> Result<()> {
        while !self.out.is_empty() {
            match io.write(&self.out) {
                Ok(0) => break,
                Ok(n) => {
                    self.out.drain(..n);
                }
                // Still read, the peer may be waiting for us to consume
                Err(Error::WouldBlock) => break,
                Err(e) => return Err(e),
            }
        }

        loop {
            let start = self.rx.len();
            self.rx.resize(start + READ_CHUNK, 0);
            match io.read(&mut self.rx[start..]) {
                Ok(n) => {
                    self.rx.truncate(start + n);
                    if n == 0 {
                        break;
                    }
                }
                Err(Error::WouldBlock) => {
                    self.rx.truncate(start);
                    break;
                }
                Err(e) => {
                    self.rx.truncate(start);
                    return Err(e);
                }
            }
            self.handle_input()?;
        }
        Ok(())
    }

    fn handle_input(&mut self) -> Result<()> {
        let mut rx = core::mem::take(&mut self.rx);
        let mut pos = 0;
        let r = self.handle_packets(&rx, &mut pos);
        rx.drain(..pos);
        self.rx = rx;
        r
    }

    fn handle_packets(&mut self, rx: &[u8], pos: &mut usize) -> Result<()> {
        while let Some(len) = proto::framed_len(&rx[*pos..], MAX_SFTP_PACKET)? {
            self.handle_packet(&rx[*pos + 4..*pos + len])?;
            *pos += len;
        }
        Ok(())
    }

    fn handle_packet(&mut self, buf: &[u8]) -> Result<()> {
        let p: SftpPacket = sshwire::read_ssh(buf, None)?;
        trace!("received {p:?}");

        let (id, reply) = match p {
            SftpPacket::Version(v) => {
                if !self.init_sent || self.version.is_some() {
                    return Err(Error::SftpProto { msg: "Unexpected VERSION" });
                }
                if v.version < SFTP_VERSION {
                    debug!("Server SFTP version {}", v.version);
                    return Err(Error::SftpProto { msg: "Unsupported SFTP version" });
                }
                let extensions =
                    v.extensions.iter().map(|e| (e.name.to_lossy(), e.data.0.to_vec())).collect();
                self.version = Some(ServerVersion { version: v.version, extensions });
                return Ok(());
            }
            SftpPacket::Status(id, s) => {
                (id, Reply::Status { code: s.code, msg: s.message.to_lossy() })
            }
            SftpPacket::Handle(id, h) => (id, Reply::Handle(h.handle.0 .0.to_vec())),
            SftpPacket::Name(id, n) => {
                (id, Reply::Name(n.0.into_iter().map(DirEntry::from).collect()))
            }
            _ => return Err(Error::SftpProto { msg: "Unexpected packet from server" }),
        };

        let id = id.0;
        if self.abandoned.remove(&id) {
            debug!("Dropping late response for {id}");
            return Ok(());
        }
        if !self.inflight.remove(&id) {
            debug!("Response id {id} isn't in flight");
            return Err(Error::SftpProto { msg: "Unexpected response id" });
        }
        self.replies.insert(id, reply);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dusklog::init_test_log;
    use crate::error::SftpError;
    use crate::sshwire::{read_ssh, TextString};

    pub(crate) type MockDir = (Vec<u8>, Vec<(Vec<u8>, Attrs)>);

    /// A SFTP server answering as soon as requests are written.
    pub(crate) struct MockServer {
        dirs: Vec<MockDir>,
        /// Entries per NAME response
        chunk: usize,
        open: HashMap<Vec<u8>, (usize, usize)>,
        next_handle: u32,

        input: Vec<u8>,
        output: Vec<u8>,

        /// READDIR responses are held back while set
        hold_readdir: bool,
        held: Vec<Vec<u8>>,
        fail_readdir: Option<StatusCode>,

        block_writes: usize,
        block_reads: usize,
        /// WouldBlock on every third call
        every_third: bool,
        calls: usize,
        max_write: usize,
        max_read: usize,

        waits: usize,
        /// Request message numbers and ids, in arrival order
        seen: Vec<(SftpNum, u32)>,
    }

    impl MockServer {
        pub(crate) fn new(dirs: Vec<MockDir>) -> Self {
            Self {
                dirs,
                chunk: 100,
                open: HashMap::new(),
                next_handle: 0,
                input: vec![],
                output: vec![],
                hold_readdir: false,
                held: vec![],
                fail_readdir: None,
                block_writes: 0,
                block_reads: 0,
                every_third: false,
                calls: 0,
                max_write: usize::MAX,
                max_read: usize::MAX,
                waits: 0,
                seen: vec![],
            }
        }

        /// Releases held responses, last first
        fn release_reversed(&mut self) {
            while let Some(r) = self.held.pop() {
                self.output.extend(r);
            }
        }

        fn periodic_block(&mut self) -> bool {
            self.calls += 1;
            self.every_third && self.calls % 3 == 0
        }

        fn serve(&mut self) {
            while let Some(len) = proto::framed_len(&self.input, 1 << 20).unwrap() {
                let pkt: Vec<u8> = self.input.drain(..len).collect();
                self.respond(&pkt[4..]);
            }
        }

        fn respond(&mut self, buf: &[u8]) {
            let p: SftpPacket = read_ssh(buf, None).unwrap();
            if let Some(id) = p.req_id() {
                self.seen.push((p.sftp_num(), id.0));
            }
            let mut out = vec![];
            match p {
                SftpPacket::Init(i) => {
                    assert_eq!(i.version, 3);
                    let v = SftpPacket::Version(Version {
                        version: 3,
                        extensions: vec![ExtPair {
                            name: "limits@openssh.com".into(),
                            data: BinString(b"1"),
                        }],
                    });
                    proto::write_framed(&mut out, &v).unwrap();
                }
                SftpPacket::OpenDir(id, o) => {
                    let path = o.path.as_bytes();
                    if let Some(i) = self.dirs.iter().position(|(p, _)| p == path) {
                        let handle = format!("h{}", self.next_handle).into_bytes();
                        self.next_handle += 1;
                        self.open.insert(handle.clone(), (i, 0));
                        let r = Handle { handle: FileHandle(BinString(&handle)) };
                        proto::write_framed(&mut out, &SftpPacket::Handle(id, r)).unwrap();
                    } else {
                        status(&mut out, id, StatusCode::SSH_FX_NO_SUCH_FILE, "No such file");
                    }
                }
                SftpPacket::ReadDir(id, r) => {
                    let cur = self.open.get_mut(r.handle.0 .0);
                    match (cur, self.fail_readdir) {
                        (_, Some(code)) => status(&mut out, id, code, "nope"),
                        (None, _) => status(&mut out, id, StatusCode::SSH_FX_FAILURE, "bad handle"),
                        (Some((i, pos)), None) => {
                            let ents = &self.dirs[*i].1;
                            if *pos >= ents.len() {
                                status(&mut out, id, StatusCode::SSH_FX_EOF, "")
                            } else {
                                let end = (*pos + self.chunk).min(ents.len());
                                name_reply(&mut out, id, &ents[*pos..end]);
                                *pos = end;
                            }
                        }
                    }
                    if self.hold_readdir {
                        self.held.push(out);
                        return;
                    }
                }
                SftpPacket::Close(id, c) => {
                    let known = self.open.remove(c.handle.0 .0).is_some();
                    let code =
                        if known { StatusCode::SSH_FX_OK } else { StatusCode::SSH_FX_FAILURE };
                    status(&mut out, id, code, "");
                }
                SftpPacket::RealPath(id, r) => {
                    let mut p = b"/home/user/".to_vec();
                    p.extend_from_slice(r.path.as_bytes());
                    name_reply(&mut out, id, &[(p, Attrs::default())]);
                }
                p => panic!("unexpected {p:?}"),
            }
            self.output.extend(out);
        }
    }

    fn status(out: &mut Vec<u8>, id: ReqId, code: StatusCode, msg: &str) {
        let s = Status { code, message: msg.into(), lang: TextString(b"") };
        proto::write_framed(out, &SftpPacket::Status(id, s)).unwrap();
    }

    fn name_reply(out: &mut Vec<u8>, id: ReqId, ents: &[(Vec<u8>, Attrs)]) {
        let names = ents
            .iter()
            .map(|(n, a)| NameEntry {
                filename: Filename(BinString(n)),
                longname: Filename(BinString(n)),
                attrs: a.clone(),
            })
            .collect();
        proto::write_framed(out, &SftpPacket::Name(id, Name(names))).unwrap();
    }

    impl ChanIo for MockServer {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            if self.block_writes > 0 {
                self.block_writes -= 1;
                return Err(Error::WouldBlock);
            }
            if self.periodic_block() {
                return Err(Error::WouldBlock);
            }
            let n = buf.len().min(self.max_write);
            self.input.extend_from_slice(&buf[..n]);
            self.serve();
            Ok(n)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.block_reads > 0 {
                self.block_reads -= 1;
                return Err(Error::WouldBlock);
            }
            if self.periodic_block() || self.output.is_empty() {
                return Err(Error::WouldBlock);
            }
            let n = buf.len().min(self.output.len()).min(self.max_read);
            buf[..n].copy_from_slice(&self.output[..n]);
            self.output.drain(..n);
            Ok(n)
        }

        fn wait(&mut self) -> Result<()> {
            self.waits += 1;
            Ok(())
        }
    }

    /// Retries on `WouldBlock`, returning the result and retry count
    fn retry<R>(mut f: impl FnMut() -> Result<R>) -> (Result<R>, usize) {
        for n in 0..10_000 {
            match f() {
                Err(Error::WouldBlock) => continue,
                r => return (r, n),
            }
        }
        panic!("no progress");
    }

    /// The three entry listing: "a" with size only, "b" with uid/gid only, "."
    pub(crate) fn three_entries() -> MockDir {
        let a = Attrs { size: Some(10), ..Default::default() };
        let b = Attrs { uidgid: Some(UidGid { uid: 1000, gid: 1000 }), ..Default::default() };
        let dot = Attrs { permissions: Some(0o40755), ..Default::default() };
        (b"/tmp/d".to_vec(), vec![(b"a".to_vec(), a), (b"b".to_vec(), b), (b".".to_vec(), dot)])
    }

    fn ready(dirs: Vec<MockDir>) -> (SftpClient, MockServer) {
        init_test_log();
        let mut c = SftpClient::new(false);
        let mut m = MockServer::new(dirs);
        c.init(&mut m).unwrap();
        (c, m)
    }

    fn entry(r: Result<ReadEntry>) -> DirEntry {
        match r {
            Ok(ReadEntry::Entry(e)) => e,
            r => panic!("expected entry, got {r:?}"),
        }
    }

    #[test]
    fn init_version() {
        let (c, _m) = ready(vec![]);
        assert_eq!(c.server_version(), Some(3));
        assert_eq!(c.extensions()[0].0, "limits@openssh.com");
    }

    #[test]
    fn not_initialised() {
        init_test_log();
        let mut c = SftpClient::new(false);
        let mut m = MockServer::new(vec![three_entries()]);
        let r = c.open_directory(&mut m, "/tmp/d");
        assert!(matches!(r, Err(Error::InvalidState { .. })));
    }

    #[test]
    fn three_entry_listing() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();
        assert_eq!(c.state(&h), DirState::Open);

        let a = entry(c.read_entry(&mut m, &h));
        assert_eq!(a.name, b"a");
        assert_eq!(a.attrs.size, Some(10));
        assert_eq!(a.attrs.uidgid, None);
        assert_eq!(a.is_dir(), None);
        assert_eq!(c.state(&h), DirState::Reading);

        let b = entry(c.read_entry(&mut m, &h));
        assert_eq!(b.name, b"b");
        assert_eq!(b.attrs.size, None);
        assert_eq!(b.attrs.uidgid, Some(UidGid { uid: 1000, gid: 1000 }));

        let dot = entry(c.read_entry(&mut m, &h));
        assert_eq!(dot.name_lossy(), ".");
        assert_eq!(dot.is_dir(), Some(true));

        assert!(matches!(c.read_entry(&mut m, &h), Ok(ReadEntry::EndOfListing)));
        // only close is valid now
        assert!(matches!(c.read_entry(&mut m, &h), Err(Error::InvalidState { .. })));
        c.close_directory(&mut m, &h).unwrap();
        assert_eq!(c.state(&h), DirState::Closed);
    }

    #[test]
    fn nonexistent_path() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let r = c.open_directory(&mut m, "/nonexistent");
        let Err(e) = r else { panic!("opened") };
        assert_eq!(e.sftp_code(), Some(SftpError::NoSuchFile));
        assert!(!e.is_fatal());
        assert!(c.dirs.is_empty());
        assert!(c.pending_open.is_none());

        // the client is still usable
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();
        entry(c.read_entry(&mut m, &h));
    }

    #[test]
    fn would_block_keeps_request_id() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();

        m.block_writes = 5;
        let mut blocked = 0;
        let e = loop {
            match c.read_entry(&mut m, &h) {
                Err(Error::WouldBlock) => blocked += 1,
                r => break entry(r),
            }
        };
        assert_eq!(blocked, 5);
        assert_eq!(e.name, b"a");

        let readdirs: Vec<_> =
            m.seen.iter().filter(|(n, _)| *n == SftpNum::SSH_FXP_READDIR).collect();
        assert_eq!(readdirs.len(), 1);

        // same again with reads blocking after the request was written
        let h2 = c.open_directory(&mut m, "/tmp/d").unwrap();
        m.block_reads = 5;
        let (r, n) = retry(|| c.read_entry(&mut m, &h2));
        assert_eq!(n, 5);
        assert_eq!(entry(r).name, b"a");
        let ids: Vec<_> = m
            .seen
            .iter()
            .filter(|(n, _)| *n == SftpNum::SSH_FXP_READDIR)
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn blocking_mode_waits() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();
        c.blocking = true;
        m.block_reads = 5;
        let e = entry(c.read_entry(&mut m, &h));
        assert_eq!(e.name, b"a");
        assert_eq!(m.waits, 5);

        m.block_writes = 3;
        c.close_directory(&mut m, &h).unwrap();
        assert_eq!(m.waits, 8);
    }

    #[test]
    fn close_twice() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();
        entry(c.read_entry(&mut m, &h));
        c.close_directory(&mut m, &h).unwrap();
        assert!(matches!(c.close_directory(&mut m, &h), Err(Error::AlreadyClosed)));
        assert!(matches!(c.read_entry(&mut m, &h), Err(Error::InvalidState { .. })));
        // one CLOSE on the wire
        let closes = m.seen.iter().filter(|(n, _)| *n == SftpNum::SSH_FXP_CLOSE).count();
        assert_eq!(closes, 1);
        assert!(m.open.is_empty());
    }

    #[test]
    fn closed_listers_released() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let mut old = vec![];
        for _ in 0..500 {
            let h = c.open_directory(&mut m, "/tmp/d").unwrap();
            entry(c.read_entry(&mut m, &h));
            c.close_directory(&mut m, &h).unwrap();
            old.push(h);
        }
        assert!(c.dirs.is_empty());
        assert!(m.open.is_empty());

        // released handles still report as closed
        for h in [&old[0], &old[499]] {
            assert_eq!(c.state(h), DirState::Closed);
            assert!(matches!(c.close_directory(&mut m, h), Err(Error::AlreadyClosed)));
            assert!(matches!(c.read_entry(&mut m, h), Err(Error::InvalidState { .. })));
        }
        let closes = m.seen.iter().filter(|(n, _)| *n == SftpNum::SSH_FXP_CLOSE).count();
        assert_eq!(closes, 500);
    }

    #[test]
    fn readdir_issuance_order() {
        let many: Vec<_> = (0..6)
            .map(|i| (format!("f{i}").into_bytes(), Attrs { size: Some(i), ..Default::default() }))
            .collect();
        let (mut c, mut m) = ready(vec![(b"/many".to_vec(), many)]);
        m.chunk = 1;

        let h = c.open_directory(&mut m, "/many").unwrap();
        let mut names = vec![];
        while let ReadEntry::Entry(e) = c.read_entry(&mut m, &h).unwrap() {
            names.push(e.name);
        }
        assert_eq!(names.len(), 6);
        c.close_directory(&mut m, &h).unwrap();

        let readdirs: Vec<u32> = m
            .seen
            .iter()
            .filter(|(n, _)| *n == SftpNum::SSH_FXP_READDIR)
            .map(|(_, id)| *id)
            .collect();
        // one per entry, then the EOF
        assert_eq!(readdirs.len(), 7);
        assert!(readdirs.windows(2).all(|w| w[0] < w[1]), "{readdirs:?}");
    }

    #[test]
    fn late_response_dropped() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();
        m.hold_readdir = true;
        assert!(matches!(c.read_entry(&mut m, &h), Err(Error::WouldBlock)));
        c.close_directory(&mut m, &h).unwrap();
        assert_eq!(c.abandoned.len(), 1);

        // the READDIR response arrives after the handle is gone
        m.hold_readdir = false;
        m.release_reversed();
        let h2 = c.open_directory(&mut m, "/tmp/d").unwrap();
        assert!(c.abandoned.is_empty());
        assert_eq!(entry(c.read_entry(&mut m, &h2)).name, b"a");
    }

    #[test]
    fn responses_out_of_order() {
        let other = (b"/other".to_vec(), vec![(b"x".to_vec(), Attrs::default())]);
        let (mut c, mut m) = ready(vec![three_entries(), other]);
        let h1 = c.open_directory(&mut m, "/tmp/d").unwrap();
        let h2 = c.open_directory(&mut m, "/other").unwrap();

        m.hold_readdir = true;
        assert!(matches!(c.read_entry(&mut m, &h1), Err(Error::WouldBlock)));
        assert!(matches!(c.read_entry(&mut m, &h2), Err(Error::WouldBlock)));
        // no pipelining, a retry doesn't send another READDIR
        assert!(matches!(c.read_entry(&mut m, &h1), Err(Error::WouldBlock)));
        let readdirs = m.seen.iter().filter(|(n, _)| *n == SftpNum::SSH_FXP_READDIR).count();
        assert_eq!(readdirs, 2);

        m.hold_readdir = false;
        m.release_reversed();
        assert_eq!(entry(c.read_entry(&mut m, &h1)).name, b"a");
        assert_eq!(entry(c.read_entry(&mut m, &h2)).name, b"x");
        assert!(matches!(c.read_entry(&mut m, &h2), Ok(ReadEntry::EndOfListing)));
        assert_eq!(entry(c.read_entry(&mut m, &h1)).name, b"b");
    }

    #[test]
    fn readdir_failure() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        let h = c.open_directory(&mut m, "/tmp/d").unwrap();
        m.fail_readdir = Some(StatusCode::SSH_FX_PERMISSION_DENIED);
        let e = c.read_entry(&mut m, &h).unwrap_err();
        assert_eq!(e.sftp_code(), Some(SftpError::PermissionDenied));
        assert_eq!(c.state(&h), DirState::Failed);
        assert!(matches!(c.read_entry(&mut m, &h), Err(Error::InvalidState { .. })));
        // the server handle is still closed
        c.close_directory(&mut m, &h).unwrap();
        assert!(m.open.is_empty());
    }

    #[test]
    fn concurrent_open_other_path() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        m.block_writes = 1;
        assert!(matches!(c.open_directory(&mut m, "/tmp/d"), Err(Error::WouldBlock)));
        let r = c.open_directory(&mut m, "/elsewhere");
        assert!(matches!(r, Err(Error::BadUsage { .. })));
        c.open_directory(&mut m, "/tmp/d").unwrap();
        let opens = m.seen.iter().filter(|(n, _)| *n == SftpNum::SSH_FXP_OPENDIR).count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn liveness_with_fragments() {
        init_test_log();
        let many: Vec<_> = (0..20)
            .map(|i| {
                let a = Attrs {
                    size: Some(i),
                    acmodtime: Some(AcModTime { atime: 7, mtime: 7 }),
                    ..Default::default()
                };
                (format!("file{i}").into_bytes(), a)
            })
            .collect();
        let mut m = MockServer::new(vec![(b"/big".to_vec(), many)]);
        m.every_third = true;
        m.chunk = 3;
        m.max_write = 7;
        m.max_read = 5;
        let mut c = SftpClient::new(false);

        retry(|| c.init(&mut m)).0.unwrap();
        let h = retry(|| c.open_directory(&mut m, "/big")).0.unwrap();
        let mut names = vec![];
        loop {
            match retry(|| c.read_entry(&mut m, &h)).0.unwrap() {
                ReadEntry::Entry(e) => names.push(e.name_lossy().into_owned()),
                ReadEntry::EndOfListing => break,
            }
        }
        assert_eq!(names.len(), 20);
        assert_eq!(names[19], "file19");
        retry(|| c.close_directory(&mut m, &h)).0.unwrap();
    }

    #[test]
    fn realpath() {
        let (mut c, mut m) = ready(vec![]);
        assert_eq!(c.realpath(&mut m, ".").unwrap(), "/home/user/.");
    }

    #[test]
    fn unexpected_id_is_fatal() {
        let (mut c, mut m) = ready(vec![three_entries()]);
        status(&mut m.output, ReqId(999), StatusCode::SSH_FX_OK, "");
        let r = c.open_directory(&mut m, "/tmp/d");
        assert!(matches!(r, Err(Error::SftpProto { .. })));
        assert!(c.is_failed());
        assert!(matches!(c.realpath(&mut m, "."), Err(Error::SessionFailed)));
    }

    #[test]
    fn ids_skip_in_flight() {
        let mut c = SftpClient::new(false);
        c.next_id = Wrapping(u32::MAX);
        c.inflight.insert(0);
        c.abandoned.insert(1);
        assert_eq!(c.alloc_id(), u32::MAX);
        assert_eq!(c.alloc_id(), 2);
    }
}
