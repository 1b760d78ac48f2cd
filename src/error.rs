use thiserror::Error;

use crate::causalgraph::remote_ids::RemoteVersionOwned;
use crate::LV;

/// Fatal errors raised while applying an operation.
///
/// These all indicate a malformed operation or a broken transport, not a
/// legitimate concurrency outcome. The call aborts before the node table is
/// mutated; the caller is responsible for quarantining the offending op.
/// Soft conditions (duplicate delivery, a reclaimed target) are not errors -
/// they're logged and the op is acknowledged with no effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DbError {
    #[error("a CRDT node with id {0} already exists")]
    DuplicateCrdtId(LV),

    #[error("operation kind does not match the kind of node {0}")]
    InvalidTarget(LV),

    #[error("op claims version {0} is concurrent, but its parents dominate it")]
    InvalidParents(LV),

    #[error("raw version {0} has not been admitted to the causal graph")]
    UnknownRawVersion(RemoteVersionOwned),

    #[error("node {0} does not exist (reclaimed or never created)")]
    MissingTarget(LV),
}
