use std::cmp::Ordering;
use std::collections::BTreeMap;

use smartstring::alias::String as SmartString;

use crate::causalgraph::remote_ids::{RemoteVersion, RemoteVersionOwned, ROOT_AGENT_NAME};
use crate::{AgentId, AgentVersion, LV};

#[derive(Clone, Debug)]
pub(crate) struct ClientData {
    /// Used to map from the client's name to its numerical id.
    pub(crate) name: SmartString,

    /// Maps each of this agent's sequence numbers to the local version it was
    /// assigned. An agent's ops almost always arrive in seq order, but the
    /// same agent id may have been used on two concurrent branches and then
    /// transmitted along different paths, so this can't just be a dense list.
    pub(crate) seq_to_lv: BTreeMap<usize, LV>,
}

impl ClientData {
    pub fn next_seq(&self) -> usize {
        self.seq_to_lv.last_key_value().map_or(0, |(seq, _)| seq + 1)
    }

    #[inline]
    pub(crate) fn try_seq_to_lv(&self, seq: usize) -> Option<LV> {
        self.seq_to_lv.get(&seq).copied()
    }
}

/// Bidirectional mapping between local versions and the (agent, seq) pairs
/// which name them globally.
#[derive(Clone, Debug, Default)]
pub struct AgentAssignment {
    /// The author of every admitted operation, indexed by local version.
    pub(crate) lv_to_agent: Vec<AgentVersion>,

    /// Per-agent data, indexed by AgentId. Maps raw versions back to local
    /// versions.
    pub(crate) client_data: Vec<ClientData>,
}

impl AgentAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_agent_id(&self, name: &str) -> Option<AgentId> {
        self.client_data
            .iter()
            .position(|client_data| client_data.name == name)
            .map(|id| id as AgentId)
    }

    pub fn get_or_create_agent_id(&mut self, name: &str) -> AgentId {
        if name == ROOT_AGENT_NAME {
            panic!("Agent name '{}' is reserved", ROOT_AGENT_NAME);
        }

        if let Some(id) = self.get_agent_id(name) {
            id
        } else {
            self.client_data.push(ClientData {
                name: SmartString::from(name),
                seq_to_lv: BTreeMap::new(),
            });
            (self.client_data.len() - 1) as AgentId
        }
    }

    pub fn get_agent_name(&self, agent: AgentId) -> &str {
        self.client_data[agent as usize].name.as_str()
    }

    pub fn next_seq_for(&self, agent: AgentId) -> usize {
        self.client_data[agent as usize].next_seq()
    }

    /// The number of operations which have been assigned a local version.
    pub fn len(&self) -> usize {
        self.lv_to_agent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lv_to_agent.is_empty()
    }

    pub(crate) fn lv_to_agent_version(&self, v: LV) -> AgentVersion {
        self.lv_to_agent[v]
    }

    pub(crate) fn try_agent_version_to_lv(&self, (agent, seq): AgentVersion) -> Option<LV> {
        self.client_data
            .get(agent as usize)
            .and_then(|c| c.try_seq_to_lv(seq))
    }

    pub(crate) fn try_remote_to_local_version(&self, rv: RemoteVersion) -> Option<LV> {
        let agent = self.get_agent_id(rv.0)?;
        self.client_data[agent as usize].try_seq_to_lv(rv.1)
    }

    pub fn local_to_remote_version(&self, v: LV) -> RemoteVersionOwned {
        let (agent, seq) = self.lv_to_agent_version(v);
        RemoteVersionOwned(self.client_data[agent as usize].name.clone(), seq)
    }

    /// Record that `(agent, seq)` was assigned local version `lv`. The local
    /// version must be the next unused one.
    pub(crate) fn assign(&mut self, agent: AgentId, seq: usize, lv: LV) {
        debug_assert_eq!(lv, self.lv_to_agent.len());
        let old = self.client_data[agent as usize].seq_to_lv.insert(seq, lv);
        assert!(old.is_none(), "seq {} already assigned for agent {}", seq, agent);
        self.lv_to_agent.push((agent, seq));
    }

    /// A total order between raw versions, derived only from agent names and
    /// sequence numbers so every replica agrees on it. Used to pick a winner
    /// between concurrent register writes.
    pub(crate) fn tie_break_agent_versions(&self, v1: AgentVersion, v2: AgentVersion) -> Ordering {
        if v1 == v2 {
            Ordering::Equal
        } else {
            let c1 = &self.client_data[v1.0 as usize];
            let c2 = &self.client_data[v2.0 as usize];

            c1.name.cmp(&c2.name).then(v1.1.cmp(&v2.1))
        }
    }

    pub(crate) fn tie_break_versions(&self, v1: LV, v2: LV) -> Ordering {
        if v1 == v2 {
            Ordering::Equal
        } else {
            self.tie_break_agent_versions(
                self.lv_to_agent_version(v1),
                self.lv_to_agent_version(v2),
            )
        }
    }
}
