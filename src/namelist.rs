//! SSH comma separated algorithm lists.
//!
//! Wire format is the "name-list" of
//! [RFC4251](https://tools.ietf.org/html/rfc4251) section 5.
#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use ascii::{AsciiChar::Comma, AsciiStr};
use heapless::{CapacityError, Vec};

use crate::sshwire::{BinString, SSHDecode, SSHEncode, SSHSink, SSHSource, WireResult};

/// Max count of [`LocalNames`] entries
///
/// The longest list is kex: curve25519 (two names) plus the
/// strict-kex marker, with some room to spare.
pub const MAX_LOCAL_NAMES: usize = 6;
static EMPTY_LOCALNAMES: LocalNames = LocalNames::new();

/// A name list received from the peer.
#[derive(Debug, Clone)]
pub struct StringNames<'a>(pub &'a AsciiStr);

/// Our own names, in preference order.
///
/// Entries are `'static` since they only come from `SSH_NAME_*`
/// constants in [`crate::sshnames`]. Contents aren't validated.
#[derive(Debug, Default, Clone)]
pub struct LocalNames(pub Vec<&'static str, MAX_LOCAL_NAMES>);

/// Either a remote or a local list.
///
/// Decoding always produces `String`, encoding is normally from `Local`.
#[derive(Debug, Clone)]
pub enum NameList<'a> {
    String(StringNames<'a>),
    Local(&'a LocalNames),
}

impl SSHEncode for StringNames<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        BinString(self.0.as_bytes()).enc(s)
    }
}

impl<'de> SSHDecode<'de> for StringNames<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(Self(SSHDecode::dec(s)?))
    }
}

impl SSHEncode for LocalNames {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let names = self.0.as_slice();
        let commas = names.len().saturating_sub(1);
        let strlen = names.iter().map(|n| n.len()).sum::<usize>() + commas;
        (strlen as u32).enc(s)?;
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                b','.enc(s)?;
            }
            n.as_bytes().enc(s)?;
        }
        Ok(())
    }
}

impl SSHEncode for NameList<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        match self {
            NameList::String(n) => n.enc(s),
            NameList::Local(n) => n.enc(s),
        }
    }
}

impl<'de> SSHDecode<'de> for NameList<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(NameList::String(SSHDecode::dec(s)?))
    }
}

impl<'a> TryFrom<&'a str> for NameList<'a> {
    type Error = Error;
    fn try_from(s: &'a str) -> Result<Self> {
        let a = AsciiStr::from_ascii(s).map_err(|_| Error::BadName)?;
        Ok(NameList::String(StringNames(a)))
    }
}

impl TryFrom<&[&'static str]> for LocalNames {
    type Error = Error;
    fn try_from(s: &[&'static str]) -> Result<Self> {
        Ok(Self(Vec::from_slice(s)?))
    }
}

impl From<CapacityError> for Error {
    fn from(_e: CapacityError) -> Error {
        Error::NoRoom
    }
}

impl<'a> From<&'a LocalNames> for NameList<'a> {
    fn from(s: &'a LocalNames) -> Self {
        NameList::Local(s)
    }
}

impl fmt::Display for NameList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameList::String(s) => f.write_str(s.0.as_str()),
            NameList::Local(l) => {
                for (i, n) in l.0.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    f.write_str(n)?;
                }
                Ok(())
            }
        }
    }
}

impl<'a> NameList<'a> {
    /// Returns the first name in this namelist that matches, based on SSH priority.
    ///
    /// The SSH client's list decides priority. `self` is the remote
    /// list, `ours` our allowed names in preference order.
    /// Fails if `self` is a `Local` list.
    pub fn first_match(&self, is_client: bool, ours: &LocalNames) -> Result<Option<&'static str>> {
        let remote = self.remote()?;
        let found = if is_client {
            ours.0.iter().find(|o| remote.contains(o)).copied()
        } else {
            remote.names().find_map(|n| ours.0.iter().find(|o| **o == n).copied())
        };
        Ok(found)
    }

    /// Returns whether `algo` is in a remote list
    pub fn has_algo(&self, algo: &str) -> Result<bool> {
        Ok(self.remote()?.contains(algo))
    }

    /// Returns the first algorithm in the list, or `""` if the list is empty.
    pub fn first(&self) -> &str {
        match self {
            NameList::String(s) => s.names().next().unwrap_or(""),
            NameList::Local(l) => l.first(),
        }
    }

    /// Returns an empty `Local` list
    pub fn empty() -> Self {
        Self::Local(&EMPTY_LOCALNAMES)
    }

    fn remote(&self) -> Result<&StringNames<'a>> {
        match self {
            NameList::String(s) => Ok(s),
            NameList::Local(_) => Error::bug_msg("remote namelist expected"),
        }
    }
}

impl StringNames<'_> {
    fn names<'s>(&'s self) -> impl Iterator<Item = &'s str> + 's {
        let a: &'s AsciiStr = self.0;
        a.split(Comma).map(|n| n.as_str())
    }

    fn contains(&self, algo: &str) -> bool {
        self.names().any(|n| n == algo)
    }
}

impl LocalNames {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn first(&self) -> &str {
        self.0.first().copied().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use crate::namelist::*;
    use crate::sshwire::{write_ssh_vec, read_ssh};

    fn local(n: &[&'static str]) -> LocalNames {
        LocalNames::try_from(n).unwrap()
    }

    #[test]
    fn negotiation_priority() {
        let remote: NameList = "rho,cog".try_into().unwrap();
        assert_eq!(remote.first_match(true, &local(&["rho", "cog"])).unwrap(), Some("rho"));
        assert_eq!(remote.first_match(false, &local(&["rho", "cog"])).unwrap(), Some("rho"));
        // as a client our order wins
        assert_eq!(remote.first_match(true, &local(&["cog", "rho"])).unwrap(), Some("cog"));
        // as a server the remote client's order wins
        assert_eq!(remote.first_match(false, &local(&["cog", "rho"])).unwrap(), Some("rho"));

        let remote: NameList = "woe".try_into().unwrap();
        assert_eq!(remote.first_match(true, &local(&["rho"])).unwrap(), None);
        assert_eq!(remote.first_match(true, &local(&["now", "woe"])).unwrap(), Some("woe"));
    }

    #[test]
    fn local_encoding_matches_join() {
        let tests: std::vec::Vec<&[&'static str]> = vec![
            &["foo", "quux", "boo"],
            &[],
            &["one"],
            &["", "2"],
        ];
        for t in tests {
            let n = local(t);
            let mut buf = vec![];
            write_ssh_vec(&mut buf, &NameList::Local(&n)).unwrap();
            assert_eq!(buf[..4], ((buf.len() - 4) as u32).to_be_bytes());
            assert_eq!(&buf[4..], t.join(",").as_bytes());

            // and it decodes back as a remote list
            let back: NameList = read_ssh(&buf, None).unwrap();
            assert_eq!(back.to_string(), t.join(","));
            assert_eq!(back.first(), n.first());
        }
    }

    #[test]
    fn has_algo() {
        fn n(list: &str, has: &str) -> bool {
            let s: NameList = list.try_into().unwrap();
            s.has_algo(has).unwrap()
        }
        assert!(n("", ""));
        assert!(!n("", "one"));
        assert!(n("zzz", "zzz"));
        assert!(!n("zzz", "zz"));
        assert!(!n("zz,more", "zzz"));
        assert!(n("zzz,boo", "boo"));
        assert!(!n("zzz,boo", "urp"));
    }

    #[test]
    fn localnames_max_size() {
        let s = vec!["one"; MAX_LOCAL_NAMES + 1];
        assert!(LocalNames::try_from(s.as_slice()).is_err());
        let s = vec!["one"; MAX_LOCAL_NAMES];
        assert!(LocalNames::try_from(s.as_slice()).is_ok());
    }
}
