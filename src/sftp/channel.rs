#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::channel::{ChanNum, OpenStatus, ReqStatus};
use crate::session::{SessChan, Session};
use crate::sftp::client::{DirEntry, DirHandle, DirState, ReadEntry, SftpClient};
use crate::sshnames::SSH_SUBSYSTEM_SFTP;
use crate::transport::Transport;

#[derive(Debug)]
enum OpenStage {
    /// `CHANNEL_OPEN` sent
    Opening,
    /// Subsystem request sent
    Requested,
    /// `SSH_FXP_INIT` sent
    Init,
}

/// Progress of an SFTP channel open, kept by the session between retries
pub(crate) struct SftpOpen {
    num: ChanNum,
    stage: OpenStage,
    client: SftpClient,
}

/// The `sftp` subsystem on a session channel.
///
/// Borrows the [`Session`] for its lifetime. Dropping it closes the
/// channel.
pub struct SftpChannel<'a, T: Transport> {
    sess: &'a mut Session<T>,
    num: ChanNum,
    client: SftpClient,
    version: u32,
}

impl<'a, T: Transport> SftpChannel<'a, T> {
    /// Opens a session channel, starts the `sftp` subsystem and
    /// exchanges SFTP versions.
    ///
    /// The session must be authenticated. After `WouldBlock` the next
    /// call resumes the same open.
    pub fn open(sess: &'a mut Session<T>) -> Result<Self> {
        let blocking = sess.config().blocking_mode;
        let (num, mut client) = sess.drive(blocking, Self::open_step)?;
        client.blocking = blocking;
        let version = client.server_version().trap()?;
        debug!("SFTP channel {num} open");
        Ok(Self { sess, num, client, version })
    }

    fn open_step(sess: &mut Session<T>) -> Result<Option<(ChanNum, SftpClient)>> {
        let mut st = match sess.sftp_open.take() {
            Some(st) => st,
            None => {
                let num = sess.open_channel()?;
                // the session loop handles blocking until open() returns
                SftpOpen { num, stage: OpenStage::Opening, client: SftpClient::new(false) }
            }
        };

        match Self::advance(sess, &mut st) {
            Ok(true) => Ok(Some((st.num, st.client))),
            Ok(false) => {
                sess.sftp_open = Some(st);
                Ok(None)
            }
            Err(e) => {
                sess.close_channel(st.num);
                Err(e)
            }
        }
    }

    /// Returns `true` once the open has completed
    fn advance(sess: &mut Session<T>, st: &mut SftpOpen) -> Result<bool> {
        loop {
            match st.stage {
                OpenStage::Opening => match sess.channel_open_status(st.num)? {
                    OpenStatus::Pending => return Ok(false),
                    OpenStatus::Failed { reason, desc } => {
                        return Err(Error::ChannelOpenFailed { reason, desc })
                    }
                    OpenStatus::Open => {
                        sess.request_subsystem(st.num, SSH_SUBSYSTEM_SFTP)?;
                        st.stage = OpenStage::Requested;
                    }
                },
                OpenStage::Requested => match sess.channel_req_status(st.num)? {
                    ReqStatus::Pending => return Ok(false),
                    ReqStatus::Failure => {
                        return Err(Error::SubsystemRefused { name: SSH_SUBSYSTEM_SFTP })
                    }
                    ReqStatus::Success => st.stage = OpenStage::Init,
                    ReqStatus::None => return Error::bug_msg("no subsystem request"),
                },
                OpenStage::Init => {
                    return match st.client.init(&mut sess.chan_io(st.num)) {
                        Ok(()) => Ok(true),
                        Err(Error::WouldBlock) => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            }
        }
    }

    /// In blocking mode operations wait on the transport rather than
    /// returning [`Error::WouldBlock`].
    pub fn set_blocking(&mut self, blocking: bool) {
        self.client.blocking = blocking
    }

    pub fn is_blocking(&self) -> bool {
        self.client.blocking
    }

    /// SFTP protocol version from the server
    pub fn server_version(&self) -> u32 {
        self.version
    }

    /// Extension name and data pairs from the server's version message
    pub fn extensions(&self) -> &[(String, Vec<u8>)] {
        self.client.extensions()
    }

    pub fn open_directory(&mut self, path: &str) -> Result<DirHandle> {
        self.with_io(|c, io| c.open_directory(io, path))
    }

    /// Returns the next entry, or [`ReadEntry::EndOfListing`].
    pub fn read_entry(&mut self, h: &DirHandle) -> Result<ReadEntry> {
        self.with_io(|c, io| c.read_entry(io, h))
    }

    /// Returns all remaining entries of a listing.
    ///
    /// `WouldBlock` keeps the entries read so far buffered, a retry
    /// continues the listing. Non-blocking callers should prefer
    /// [`read_entry()`](Self::read_entry).
    pub fn read_all(&mut self, h: &DirHandle) -> Result<Vec<DirEntry>> {
        let mut v = Vec::new();
        loop {
            match self.read_entry(h)? {
                ReadEntry::Entry(e) => v.push(e),
                ReadEntry::EndOfListing => return Ok(v),
            }
        }
    }

    /// Closes a listing. A second close fails with [`Error::AlreadyClosed`].
    pub fn close_directory(&mut self, h: &DirHandle) -> Result<()> {
        self.with_io(|c, io| c.close_directory(io, h))
    }

    /// Returns `true` after the SFTP stream broke, such as a malformed
    /// response. Only closing the channel is useful then.
    pub fn is_failed(&self) -> bool {
        self.client.is_failed()
    }

    /// The exit status sent by the server, usually once the subsystem ends
    pub fn exit_status(&self) -> Option<u32> {
        self.sess.channel_exit_status(self.num)
    }

    pub fn dir_state(&self, h: &DirHandle) -> DirState {
        self.client.state(h)
    }

    /// Canonicalises a path on the server
    pub fn realpath(&mut self, path: &str) -> Result<String> {
        self.with_io(|c, io| c.realpath(io, path))
    }

    fn with_io<R>(
        &mut self,
        f: impl FnOnce(&mut SftpClient, &mut SessChan<'_, T>) -> Result<R>,
    ) -> Result<R> {
        let mut io = self.sess.chan_io(self.num);
        f(&mut self.client, &mut io).map_err(|e| self.sess.fail(e))
    }
}

impl<T: Transport> Drop for SftpChannel<'_, T> {
    fn drop(&mut self) {
        trace!("closing SFTP channel {}", self.num);
        self.sess.close_channel(self.num)
    }
}
