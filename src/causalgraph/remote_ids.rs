//! Raw versions: ids you can pass to a remote peer. A raw version names an
//! operation as (agent name, seq), independently of the order any particular
//! replica learned about it.

use std::fmt;

use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The reserved agent name used to address the root map on the wire.
pub const ROOT_AGENT_NAME: &str = "ROOT";

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteVersionOwned(pub SmartString, pub usize);

/// Borrowed form of [`RemoteVersionOwned`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RemoteVersion<'a>(pub &'a str, pub usize);

pub type RemoteFrontier<'a> = SmallVec<[RemoteVersion<'a>; 2]>;
pub type RemoteFrontierOwned = SmallVec<[RemoteVersionOwned; 2]>;

impl RemoteVersionOwned {
    pub fn borrow(&self) -> RemoteVersion<'_> {
        RemoteVersion(self.0.as_str(), self.1)
    }
}

impl<'a> RemoteVersion<'a> {
    pub fn to_owned(&self) -> RemoteVersionOwned {
        self.into()
    }
}

impl<'a> From<&'a RemoteVersionOwned> for RemoteVersion<'a> {
    fn from(rv: &'a RemoteVersionOwned) -> Self {
        RemoteVersion(rv.0.as_str(), rv.1)
    }
}

impl<'a> From<&RemoteVersion<'a>> for RemoteVersionOwned {
    fn from(rv: &RemoteVersion) -> Self {
        RemoteVersionOwned(rv.0.into(), rv.1)
    }
}

impl<'a> From<RemoteVersion<'a>> for RemoteVersionOwned {
    fn from(rv: RemoteVersion) -> Self {
        RemoteVersionOwned(rv.0.into(), rv.1)
    }
}

impl<S> From<(S, usize)> for RemoteVersionOwned
where
    S: Into<SmartString>,
{
    fn from((agent, seq): (S, usize)) -> Self {
        Self(agent.into(), seq)
    }
}

impl fmt::Display for RemoteVersionOwned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.0, self.1)
    }
}

impl<'a> fmt::Display for RemoteVersion<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.0, self.1)
    }
}
