//! The causal graph: assigns a dense local version to every operation this
//! replica knows about, translates between local versions and raw (agent,
//! seq) versions, and answers dominance and tie-break queries.
//!
//! Causal graph entries are created once per admitted operation and never
//! destroyed, independently of CRDT node lifetimes.

pub mod agent_assignment;
pub mod graph;
pub mod remote_ids;

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::causalgraph::agent_assignment::AgentAssignment;
use crate::causalgraph::graph::Graph;
use crate::causalgraph::remote_ids::{
    RemoteFrontierOwned, RemoteVersion, RemoteVersionOwned, ROOT_AGENT_NAME,
};
use crate::frontier::Frontier;
use crate::{AgentId, DbError, LV, ROOT_CRDT_ID};

#[derive(Debug, Clone, Default)]
pub struct CausalGraph {
    pub agent_assignment: AgentAssignment,

    /// Parents of every known operation.
    pub graph: Graph,

    /// The current frontier: the set of versions not dominated by any other
    /// known version.
    pub version: Frontier,
}

/// Result of admitting a raw version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRawResult {
    /// The operation is new, and was assigned this local version.
    Added(LV),
    /// The operation has been seen before. Nothing changed.
    AlreadyKnown(LV),
}

impl AddRawResult {
    pub fn lv(self) -> LV {
        match self {
            AddRawResult::Added(v) | AddRawResult::AlreadyKnown(v) => v,
        }
    }
}

impl CausalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of operations this replica knows about.
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.graph.len(), self.agent_assignment.len());
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn get_or_create_agent_id(&mut self, name: &str) -> AgentId {
        self.agent_assignment.get_or_create_agent_id(name)
    }

    pub fn get_agent_name(&self, agent: AgentId) -> &str {
        self.agent_assignment.get_agent_name(agent)
    }

    pub fn next_seq_for(&self, agent: AgentId) -> usize {
        self.agent_assignment.next_seq_for(agent)
    }

    /// Admit an operation by raw id, declaring the causal frontier its author
    /// observed. Admission is idempotent on (agent, seq); re-delivery returns
    /// [`AddRawResult::AlreadyKnown`] and changes nothing.
    ///
    /// Parents must already be known - deliver ops in causal order.
    pub fn add_raw(
        &mut self,
        id: RemoteVersion,
        parents: &[RemoteVersionOwned],
    ) -> Result<AddRawResult, DbError> {
        let agent = self.agent_assignment.get_or_create_agent_id(id.0);
        if let Some(lv) = self.agent_assignment.client_data[agent as usize].try_seq_to_lv(id.1) {
            return Ok(AddRawResult::AlreadyKnown(lv));
        }

        let parents = self.remote_to_local_frontier(parents)?;
        Ok(AddRawResult::Added(self.admit(agent, id.1, parents)))
    }

    /// Assign the next local version to an op authored by a local agent. Its
    /// parents are the whole current frontier.
    pub fn assign_local_op(&mut self, agent: AgentId) -> LV {
        let seq = self.agent_assignment.next_seq_for(agent);
        let parents = self.version.clone();
        self.admit(agent, seq, parents)
    }

    fn admit(&mut self, agent: AgentId, seq: usize, parents: Frontier) -> LV {
        let lv = self.len();
        self.agent_assignment.assign(agent, seq, lv);
        self.version.advance_by_known_run(parents.as_ref(), lv);
        let pushed = self.graph.push(parents);
        debug_assert_eq!(pushed, lv);
        lv
    }

    // *** Version translation. These are all pure queries. ***

    pub fn try_remote_to_local_version(&self, rv: RemoteVersion) -> Option<LV> {
        self.agent_assignment.try_remote_to_local_version(rv)
    }

    pub fn remote_to_local_version(&self, rv: RemoteVersion) -> Result<LV, DbError> {
        self.try_remote_to_local_version(rv)
            .ok_or_else(|| DbError::UnknownRawVersion(rv.to_owned()))
    }

    pub fn remote_to_local_frontier(
        &self,
        rvs: &[RemoteVersionOwned],
    ) -> Result<Frontier, DbError> {
        let mut items: SmallVec<[LV; 2]> = SmallVec::with_capacity(rvs.len());
        for rv in rvs {
            items.push(self.remote_to_local_version(rv.borrow())?);
        }
        Ok(Frontier::from_unsorted(&items))
    }

    pub fn local_to_remote_version(&self, v: LV) -> RemoteVersionOwned {
        self.agent_assignment.local_to_remote_version(v)
    }

    pub fn local_to_remote_frontier(&self, lvs: &[LV]) -> RemoteFrontierOwned {
        lvs.iter().map(|&v| self.local_to_remote_version(v)).collect()
    }

    /// Translate an op's target id. The reserved ("ROOT", 0) version names
    /// the root map.
    pub fn remote_to_target(&self, rv: RemoteVersion) -> Result<LV, DbError> {
        if rv.0 == ROOT_AGENT_NAME {
            Ok(ROOT_CRDT_ID)
        } else {
            self.remote_to_local_version(rv)
        }
    }

    pub fn target_to_remote(&self, target: LV) -> RemoteVersionOwned {
        if target == ROOT_CRDT_ID {
            RemoteVersionOwned(ROOT_AGENT_NAME.into(), 0)
        } else {
            self.local_to_remote_version(target)
        }
    }

    pub(crate) fn tie_break_versions(&self, v1: LV, v2: LV) -> Ordering {
        self.agent_assignment.tie_break_versions(v1, v2)
    }

    pub fn dbg_check(&self, deep: bool) {
        assert_eq!(self.graph.len(), self.agent_assignment.len());

        assert!(self.version.is_sorted());
        for &v in self.version.as_ref() {
            assert!(v < self.len());
        }
        // Frontier items must be mutually concurrent.
        for (i, &a) in self.version.as_ref().iter().enumerate() {
            for &b in &self.version.as_ref()[i + 1..] {
                assert_eq!(self.graph.version_cmp(a, b), None);
            }
        }

        for v in 0..self.graph.len() {
            let parents = self.graph.parents_at(v);
            assert!(parents.windows(2).all(|w| w[0] < w[1]));
            for &p in parents {
                assert!(p < v);
            }
        }

        if deep {
            // The agent tables are a bijection over admitted ops.
            for (lv, &av) in self.agent_assignment.lv_to_agent.iter().enumerate() {
                assert_eq!(self.agent_assignment.try_agent_version_to_lv(av), Some(lv));
            }
            for (agent, c) in self.agent_assignment.client_data.iter().enumerate() {
                for (&seq, &lv) in c.seq_to_lv.iter() {
                    assert_eq!(
                        self.agent_assignment.lv_to_agent[lv],
                        (agent as AgentId, seq)
                    );
                }
            }

            // Every known version is dominated by the frontier.
            for v in 0..self.len() {
                assert!(self.graph.version_contains_time(self.version.as_ref(), v));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rv(agent: &str, seq: usize) -> RemoteVersionOwned {
        RemoteVersionOwned(agent.into(), seq)
    }

    #[test]
    fn add_raw_assigns_dense_versions() {
        let mut cg = CausalGraph::new();

        let a0 = cg.add_raw(RemoteVersion("a", 0), &[]).unwrap();
        assert_eq!(a0, AddRawResult::Added(0));

        let b0 = cg.add_raw(RemoteVersion("b", 0), &[]).unwrap();
        assert_eq!(b0, AddRawResult::Added(1));
        assert_eq!(cg.version.as_ref(), &[0, 1]);

        let a1 = cg
            .add_raw(RemoteVersion("a", 1), &[rv("a", 0), rv("b", 0)])
            .unwrap();
        assert_eq!(a1, AddRawResult::Added(2));
        assert_eq!(cg.version.as_ref(), &[2]);

        assert_eq!(cg.local_to_remote_version(2), rv("a", 1));
        assert_eq!(cg.remote_to_local_version(RemoteVersion("b", 0)).unwrap(), 1);

        cg.dbg_check(true);
    }

    #[test]
    fn add_raw_is_idempotent() {
        let mut cg = CausalGraph::new();

        cg.add_raw(RemoteVersion("a", 0), &[]).unwrap();
        let dup = cg.add_raw(RemoteVersion("a", 0), &[]).unwrap();
        assert_eq!(dup, AddRawResult::AlreadyKnown(0));
        assert_eq!(dup.lv(), 0);
        assert_eq!(cg.len(), 1);

        cg.dbg_check(true);
    }

    #[test]
    fn local_ops_extend_the_frontier() {
        let mut cg = CausalGraph::new();
        let seph = cg.get_or_create_agent_id("seph");

        assert_eq!(cg.assign_local_op(seph), 0);
        assert_eq!(cg.assign_local_op(seph), 1);
        assert_eq!(cg.next_seq_for(seph), 2);
        assert_eq!(cg.version.as_ref(), &[1]);

        // A remote op concurrent with seph's work, then a local op merging
        // the two branches.
        cg.add_raw(RemoteVersion("mike", 0), &[]).unwrap();
        assert_eq!(cg.version.as_ref(), &[1, 2]);

        let merge = cg.assign_local_op(seph);
        assert_eq!(cg.version.as_ref(), &[merge]);
        assert_eq!(cg.graph.parents_at(merge), &[1, 2]);

        cg.dbg_check(true);
    }

    #[test]
    fn unknown_parents_are_rejected() {
        let mut cg = CausalGraph::new();

        let err = cg
            .add_raw(RemoteVersion("a", 0), &[rv("nope", 0)])
            .unwrap_err();
        assert_eq!(err, DbError::UnknownRawVersion(rv("nope", 0)));
    }

    #[test]
    fn tie_break_orders_by_agent_then_seq() {
        let mut cg = CausalGraph::new();
        cg.add_raw(RemoteVersion("mike", 0), &[]).unwrap();
        cg.add_raw(RemoteVersion("seph", 0), &[]).unwrap();
        cg.add_raw(RemoteVersion("mike", 1), &[]).unwrap();

        assert_eq!(cg.tie_break_versions(0, 1), Ordering::Less);
        assert_eq!(cg.tie_break_versions(1, 2), Ordering::Greater);
        assert_eq!(cg.tie_break_versions(0, 2), Ordering::Less);
        assert_eq!(cg.tie_break_versions(1, 1), Ordering::Equal);
    }
}
