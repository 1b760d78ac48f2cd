//! A causal, multi-value CRDT database.
//!
//! Each replica owns a [`Database`]: a causal graph which assigns a dense
//! local version to every operation it learns about, plus a materialized tree
//! of CRDT nodes (maps, registers and collections) rooted at [`ROOT_CRDT_ID`].
//! Operations are applied through [`Database::apply_remote_op`]; concurrent
//! writes to the same register are all retained and resolved deterministically
//! at read time.

use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod causalgraph;

mod branch;
mod db;
mod error;
mod frontier;

pub use branch::{Branch, DTValue, MVRegister, RegisterState, RegisterValue};
pub use causalgraph::remote_ids::{
    RemoteFrontier, RemoteFrontierOwned, RemoteVersion, RemoteVersionOwned,
};
pub use causalgraph::{AddRawResult, CausalGraph};
pub use db::Database;
pub use error::DbError;
pub use frontier::Frontier;

/// A local version: a dense integer id for an operation on this replica.
/// Local versions are assigned in the order the replica learns of operations,
/// so they're not stable across replicas. Use [`RemoteVersionOwned`] to name
/// an operation to a peer.
pub type LV = usize;

/// An integer agent id, interned from the agent's name by the causal graph.
pub type AgentId = u32;

/// An (agent, seq) pair. The agent id maps back to the agent's name through
/// the causal graph.
pub type AgentVersion = (AgentId, usize);

/// The id of the root map. Always live; every other live node is reachable
/// from it. This value is reserved - the causal graph never assigns it.
pub const ROOT_CRDT_ID: LV = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CRDTKind {
    Map,
    Register,
    Collection,
}

/// The primitive (leaf) value domain. Fixed so that encoded operations mean
/// the same thing on every replica.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Primitive {
    Nil,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(SmartString),
}

/// The value carried by a write: either a primitive, or an instruction to
/// create a fresh (empty) CRDT node owned by the written register.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CreateValue {
    Primitive(Primitive),
    NewCRDT(CRDTKind),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CollectionOp {
    Insert(CreateValue),
    /// Removes the insertion named by this raw version. Removing an entry
    /// which is already gone is a no-op.
    Remove(RemoteVersionOwned),
}

/// What an operation does to its target node.
///
/// `old_versions` lists the register pairs the author could see when it
/// wrote - the pairs this write supersedes. Any pair the author *didn't*
/// list must be concurrent with the write, and survives the merge alongside
/// it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OpContents {
    RegisterSet {
        old_versions: RemoteFrontierOwned,
        value: CreateValue,
    },
    MapSet {
        key: SmartString,
        old_versions: RemoteFrontierOwned,
        value: CreateValue,
    },
    Collection(CollectionOp),
}

/// An operation in wire form. All ids are raw (agent, seq) versions so the
/// same op means the same thing on every replica.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteOp {
    /// This op's globally unique id.
    pub id: RemoteVersionOwned,
    /// The causal frontier the author observed when it generated the op.
    pub parents: RemoteFrontierOwned,
    /// The CRDT node the op acts on.
    pub target: RemoteVersionOwned,
    pub contents: OpContents,
}
