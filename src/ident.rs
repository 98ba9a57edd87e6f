//! SSH version exchange, RFC4253 section 4.2.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

/// Sent without the trailing CRLF
pub(crate) const OUR_VERSION: &[u8] =
    concat!("SSH-2.0-dusk_", env!("CARGO_PKG_VERSION")).as_bytes();

const SSH_PREFIX: &[u8] = b"SSH-2.0-";

// RFC4253 4.2 says max length 255 incl CR LF.
const MAX_REMOTE_VERSION_LEN: usize = 253;
// Servers may send other lines before the version.
const MAX_LINES: usize = 50;

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;

/// Returns our version line including CRLF
pub(crate) fn our_version_line() -> Vec<u8> {
    let mut v = OUR_VERSION.to_vec();
    v.extend_from_slice(&[CR, LF]);
    v
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Line {
    /// Reading the start of a line, may still be a version
    Start,
    /// A line that isn't a version, skipping to LF
    Skip,
    /// Reading a `SSH-2.0-` version, up to CR
    Version,
    /// Had the CR, need LF
    CR,
    Done,
}

/// Parses the remote version line from the start of a stream.
///
/// Input can arrive in arbitrary fragments, [`consume()`](Self::consume)
/// only takes bytes up to the end of the version line.
pub(crate) struct RemoteVersion {
    line: Vec<u8>,
    st: Line,
    lines: usize,
}

impl RemoteVersion {
    pub fn new() -> Self {
        Self { line: Vec::new(), st: Line::Start, lines: 0 }
    }

    /// Returns the version (without CRLF) once complete.
    pub fn version(&self) -> Option<&[u8]> {
        (self.st == Line::Done).then_some(self.line.as_slice())
    }

    /// Returns the number of bytes consumed from `buf`.
    pub fn consume(&mut self, buf: &[u8]) -> Result<usize> {
        let mut taken = 0;
        for &b in buf {
            if self.st == Line::Done {
                break;
            }
            taken += 1;

            match self.st {
                Line::Start => {
                    self.line.push(b);
                    let l = self.line.len();
                    if self.line == SSH_PREFIX {
                        self.st = Line::Version;
                    } else if self.line[..] != SSH_PREFIX[..l] {
                        self.line.clear();
                        self.st = if b == LF { self.next_line()? } else { Line::Skip };
                    }
                }

                Line::Skip => {
                    if b == LF {
                        self.st = self.next_line()?;
                    }
                }

                Line::Version => match b {
                    CR => {
                        if !self.line.is_ascii() {
                            return Err(Error::msg("bad remote version"));
                        }
                        self.st = Line::CR;
                    }
                    LF => return Err(Error::msg("bad remote version")),
                    _ => {
                        if self.line.len() >= MAX_REMOTE_VERSION_LEN {
                            return Err(Error::NoRoom);
                        }
                        self.line.push(b);
                    }
                },

                Line::CR => {
                    if b != LF {
                        return Err(Error::msg("bad remote version"));
                    }
                    self.st = Line::Done;
                    debug!("Remote version {:?}", String::from_utf8_lossy(&self.line));
                }

                Line::Done => (),
            }
        }
        Ok(taken)
    }

    fn next_line(&mut self) -> Result<Line> {
        self.lines += 1;
        if self.lines > MAX_LINES {
            return Err(Error::NotSSH);
        }
        Ok(Line::Start)
    }
}
