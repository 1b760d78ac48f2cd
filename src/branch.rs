//! The materialized state of a replica: a table of live CRDT nodes keyed by
//! the local version which created them, plus the register-merge primitive
//! which keeps that table causally consistent.

use std::collections::{BTreeMap, BTreeSet};

use smallvec::{smallvec, SmallVec};
use smartstring::alias::String as SmartString;

use crate::causalgraph::remote_ids::RemoteVersionOwned;
use crate::causalgraph::CausalGraph;
use crate::{CRDTKind, CreateValue, DbError, Primitive, LV, ROOT_CRDT_ID};

/// The value held by one register pair or collection entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Primitive(Primitive),
    /// An owning reference to a nested CRDT node. The referenced node is
    /// always live while the reference exists.
    InnerCRDT(LV),
}

/// One surviving write in a multi-value register.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterState {
    pub value: RegisterValue,
    pub version: LV,
}

/// The set of writes surviving in a register. Never empty. Pairs are kept
/// sorted ascending by version - a stable canonical order for traversal,
/// distinct from the read-time tie-break priority. All pairs are mutually
/// concurrent.
pub type MVRegister = SmallVec<[RegisterState; 1]>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OverlayValue {
    Register(MVRegister),
    Map(BTreeMap<SmartString, MVRegister>),
    Collection(BTreeMap<LV, RegisterValue>),
}

/// The node table. Maps the id of every live CRDT node to its state. Live
/// nodes form a tree rooted at [`ROOT_CRDT_ID`] under the ownership relation
/// induced by [`RegisterValue::InnerCRDT`].
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub(crate) data: BTreeMap<LV, OverlayValue>,
}

/// A plain, conflict-resolved value tree produced by checkout.
///
/// Collection entries are keyed by the raw version of the insertion, so two
/// replicas which have seen the same ops produce identical trees.
#[derive(Debug, Clone, PartialEq)]
pub enum DTValue {
    Primitive(Primitive),
    Map(BTreeMap<SmartString, Box<DTValue>>),
    Collection(BTreeMap<RemoteVersionOwned, Box<DTValue>>),
}

impl DTValue {
    pub fn unwrap_primitive(self) -> Primitive {
        if let DTValue::Primitive(p) = self {
            p
        } else {
            panic!("Expected primitive");
        }
    }

    pub fn unwrap_map(self) -> BTreeMap<SmartString, Box<DTValue>> {
        if let DTValue::Map(map) = self {
            map
        } else {
            panic!("Expected map");
        }
    }

    pub fn unwrap_collection(self) -> BTreeMap<RemoteVersionOwned, Box<DTValue>> {
        if let DTValue::Collection(set) = self {
            set
        } else {
            panic!("Expected collection");
        }
    }
}

impl Default for Branch {
    fn default() -> Self {
        Self::new()
    }
}

impl Branch {
    pub fn new() -> Self {
        let mut data = BTreeMap::new();
        data.insert(ROOT_CRDT_ID, OverlayValue::Map(BTreeMap::new()));
        Self { data }
    }

    pub fn contains_crdt(&self, id: LV) -> bool {
        self.data.contains_key(&id)
    }

    pub(crate) fn kind_of(&self, id: LV) -> Option<CRDTKind> {
        self.data.get(&id).map(|node| match node {
            OverlayValue::Register(_) => CRDTKind::Register,
            OverlayValue::Map(_) => CRDTKind::Map,
            OverlayValue::Collection(_) => CRDTKind::Collection,
        })
    }

    /// The versions of the pairs currently held by a register - what a local
    /// author writes into an op's `old_versions`. Pass a key to address a map
    /// entry, or `None` for a register node.
    pub(crate) fn register_versions(
        &self,
        crdt_id: LV,
        key: Option<&str>,
    ) -> Result<SmallVec<[LV; 2]>, DbError> {
        let node = self
            .data
            .get(&crdt_id)
            .ok_or(DbError::MissingTarget(crdt_id))?;

        let reg = match (node, key) {
            (OverlayValue::Map(map), Some(key)) => map.get(key),
            (OverlayValue::Register(reg), None) => Some(reg),
            _ => return Err(DbError::InvalidTarget(crdt_id)),
        };

        Ok(reg.map_or_else(SmallVec::new, |reg| {
            reg.iter().map(|state| state.version).collect()
        }))
    }

    // *** Mutation. Everything below is driven by the merge engine. ***

    fn inner_create_crdt(&mut self, id: LV, kind: CRDTKind) -> Result<(), DbError> {
        if self.data.contains_key(&id) {
            return Err(DbError::DuplicateCrdtId(id));
        }

        let node = match kind {
            CRDTKind::Map => OverlayValue::Map(BTreeMap::new()),
            CRDTKind::Collection => OverlayValue::Collection(BTreeMap::new()),
            // A fresh register holds a single nil pair at its creation
            // version.
            CRDTKind::Register => OverlayValue::Register(smallvec![RegisterState {
                value: RegisterValue::Primitive(Primitive::Nil),
                version: id,
            }]),
        };

        self.data.insert(id, node);
        Ok(())
    }

    fn create_register_value(&mut self, v: LV, value: &CreateValue) -> Result<RegisterValue, DbError> {
        Ok(match value {
            CreateValue::Primitive(p) => RegisterValue::Primitive(p.clone()),
            CreateValue::NewCRDT(kind) => {
                self.inner_create_crdt(v, *kind)?;
                RegisterValue::InnerCRDT(v)
            }
        })
    }

    /// Recursively reclaims the subtree owned by a register value. Primitives
    /// return immediately; so does a node which is already gone.
    pub(crate) fn remove_recursive(&mut self, value: &RegisterValue) {
        let RegisterValue::InnerCRDT(id) = value else {
            return;
        };
        let Some(node) = self.data.remove(id) else {
            return;
        };

        match node {
            OverlayValue::Register(reg) => {
                for state in &reg {
                    self.remove_recursive(&state.value);
                }
            }
            OverlayValue::Map(map) => {
                for reg in map.values() {
                    for state in reg {
                        self.remove_recursive(&state.value);
                    }
                }
            }
            OverlayValue::Collection(entries) => {
                for val in entries.values() {
                    self.remove_recursive(val);
                }
            }
        }
    }

    /// Validates a register merge before anything is mutated. Every old pair
    /// the op doesn't supersede must be concurrent with it: if the op's
    /// parents dominate a pair the author didn't list, the op is malformed.
    fn check_register_merge(
        cg: &CausalGraph,
        parents: &[LV],
        old: &[RegisterState],
        old_versions: &[LV],
    ) -> Result<(), DbError> {
        for state in old {
            if old_versions.contains(&state.version) {
                continue;
            }
            if cg.graph.version_contains_time(parents, state.version) {
                return Err(DbError::InvalidParents(state.version));
            }
        }
        Ok(())
    }

    /// The register merge primitive. Superseded pairs are reclaimed; the rest
    /// survive next to the new write. Callers must have validated with
    /// [`Self::check_register_merge`] first.
    fn merge_register(
        &mut self,
        old: MVRegister,
        old_versions: &[LV],
        v: LV,
        value: RegisterValue,
    ) -> MVRegister {
        let mut pairs: MVRegister = smallvec![RegisterState { value, version: v }];

        for state in old {
            if old_versions.contains(&state.version) {
                // The author observed this pair and overwrote it.
                self.remove_recursive(&state.value);
            } else {
                pairs.push(state);
            }
        }

        pairs.sort_unstable_by_key(|state| state.version);
        pairs
    }

    pub(crate) fn modify_register(
        &mut self,
        cg: &CausalGraph,
        parents: &[LV],
        v: LV,
        reg_id: LV,
        old_versions: &[LV],
        value: &CreateValue,
    ) -> Result<(), DbError> {
        {
            let Some(node) = self.data.get(&reg_id) else {
                return Err(DbError::MissingTarget(reg_id));
            };
            let OverlayValue::Register(reg) = node else {
                return Err(DbError::InvalidTarget(reg_id));
            };
            Self::check_register_merge(cg, parents, reg, old_versions)?;
        }
        if matches!(value, CreateValue::NewCRDT(_)) && self.data.contains_key(&v) {
            return Err(DbError::DuplicateCrdtId(v));
        }

        let new_value = self.create_register_value(v, value)?;
        let old = match self.data.get_mut(&reg_id) {
            Some(OverlayValue::Register(reg)) => std::mem::take(reg),
            _ => unreachable!(),
        };
        let merged = self.merge_register(old, old_versions, v, new_value);
        match self.data.get_mut(&reg_id) {
            Some(OverlayValue::Register(reg)) => *reg = merged,
            _ => unreachable!(),
        }
        Ok(())
    }

    pub(crate) fn modify_map(
        &mut self,
        cg: &CausalGraph,
        parents: &[LV],
        v: LV,
        map_id: LV,
        key: &str,
        old_versions: &[LV],
        value: &CreateValue,
    ) -> Result<(), DbError> {
        {
            let Some(node) = self.data.get(&map_id) else {
                return Err(DbError::MissingTarget(map_id));
            };
            let OverlayValue::Map(map) = node else {
                return Err(DbError::InvalidTarget(map_id));
            };
            // A missing key merges against an empty register: the op simply
            // creates the key.
            let old = map.get(key).map_or(&[] as &[RegisterState], |reg| reg.as_slice());
            Self::check_register_merge(cg, parents, old, old_versions)?;
        }
        if matches!(value, CreateValue::NewCRDT(_)) && self.data.contains_key(&v) {
            return Err(DbError::DuplicateCrdtId(v));
        }

        let new_value = self.create_register_value(v, value)?;
        let old = match self.data.get_mut(&map_id) {
            Some(OverlayValue::Map(map)) => map.remove(key).unwrap_or_default(),
            _ => unreachable!(),
        };
        let merged = self.merge_register(old, old_versions, v, new_value);
        match self.data.get_mut(&map_id) {
            Some(OverlayValue::Map(map)) => {
                map.insert(key.into(), merged);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Collection inserts never conflict: each entry is keyed by the unique
    /// version of the insert itself.
    pub(crate) fn collection_insert(
        &mut self,
        v: LV,
        set_id: LV,
        value: &CreateValue,
    ) -> Result<(), DbError> {
        match self.data.get(&set_id) {
            Some(OverlayValue::Collection(_)) => {}
            Some(_) => return Err(DbError::InvalidTarget(set_id)),
            None => return Err(DbError::MissingTarget(set_id)),
        }
        if matches!(value, CreateValue::NewCRDT(_)) && self.data.contains_key(&v) {
            return Err(DbError::DuplicateCrdtId(v));
        }

        let val = self.create_register_value(v, value)?;
        match self.data.get_mut(&set_id) {
            Some(OverlayValue::Collection(entries)) => {
                let old = entries.insert(v, val);
                debug_assert!(old.is_none(), "collection entry versions are never reused");
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    pub(crate) fn collection_remove(&mut self, set_id: LV, target: LV) -> Result<(), DbError> {
        let removed = match self.data.get_mut(&set_id) {
            Some(OverlayValue::Collection(entries)) => entries.remove(&target),
            Some(_) => return Err(DbError::InvalidTarget(set_id)),
            None => return Err(DbError::MissingTarget(set_id)),
        };

        // A missing entry is fine - concurrent removes of the same insertion
        // all try to delete it, and only the first one here does anything.
        if let Some(val) = removed {
            self.remove_recursive(&val);
        }
        Ok(())
    }

    // *** Checkout ***

    /// Picks the winning pair of a register. The winner is the maximum under
    /// the causal graph's (agent, seq) tie-break, so every replica which has
    /// seen the same ops picks the same pair regardless of local numbering.
    fn resolve_mv<'a>(&self, reg: &'a MVRegister, cg: &CausalGraph) -> &'a RegisterState {
        match reg.len() {
            0 => panic!("Internal consistency violation: register has no value"),
            1 => &reg[0],
            _ => {
                let (idx, _) = reg
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| cg.tie_break_versions(a.version, b.version))
                    .unwrap();
                &reg[idx]
            }
        }
    }

    fn register_value_to_dt(&self, val: &RegisterValue, cg: &CausalGraph) -> Option<DTValue> {
        match val {
            RegisterValue::Primitive(p) => Some(DTValue::Primitive(p.clone())),
            RegisterValue::InnerCRDT(id) => self.get_recursive_at(*id, cg),
        }
    }

    fn mv_to_single_value(&self, reg: &MVRegister, cg: &CausalGraph) -> Option<DTValue> {
        self.register_value_to_dt(&self.resolve_mv(reg, cg).value, cg)
    }

    /// Materializes the conflict-resolved value of a node. Returns `None` if
    /// the node isn't live (eg it's been reclaimed by an overwrite).
    pub fn get_recursive_at(&self, crdt_id: LV, cg: &CausalGraph) -> Option<DTValue> {
        match self.data.get(&crdt_id)? {
            OverlayValue::Register(reg) => self.mv_to_single_value(reg, cg),
            OverlayValue::Map(map) => Some(DTValue::Map(
                map.iter()
                    .filter_map(|(key, reg)| {
                        Some((key.clone(), Box::new(self.mv_to_single_value(reg, cg)?)))
                    })
                    .collect(),
            )),
            OverlayValue::Collection(entries) => Some(DTValue::Collection(
                entries
                    .iter()
                    .filter_map(|(t, val)| {
                        Some((
                            cg.local_to_remote_version(*t),
                            Box::new(self.register_value_to_dt(val, cg)?),
                        ))
                    })
                    .collect(),
            )),
        }
    }

    pub fn get_recursive(&self, cg: &CausalGraph) -> Option<DTValue> {
        self.get_recursive_at(ROOT_CRDT_ID, cg)
    }

    pub(crate) fn dbg_check(&self, cg: &CausalGraph, deep: bool) {
        // The root always exists and is a map.
        assert!(matches!(
            self.data.get(&ROOT_CRDT_ID),
            Some(OverlayValue::Map(_))
        ));

        // Live nodes form a tree under ownership: walking from the root must
        // visit every live node exactly once, and every owned reference must
        // resolve.
        let mut visited = BTreeSet::new();
        let mut stack = vec![ROOT_CRDT_ID];

        while let Some(id) = stack.pop() {
            assert!(visited.insert(id), "node {} has two owners", id);
            let node = self
                .data
                .get(&id)
                .unwrap_or_else(|| panic!("dangling reference to node {}", id));

            let check_register = |reg: &MVRegister, stack: &mut Vec<LV>| {
                assert!(!reg.is_empty(), "register in node {} is empty", id);
                assert!(
                    reg.windows(2).all(|w| w[0].version < w[1].version),
                    "register pairs out of order in node {}",
                    id
                );
                if deep {
                    for (i, a) in reg.iter().enumerate() {
                        for b in &reg[i + 1..] {
                            assert_eq!(
                                cg.graph.version_cmp(a.version, b.version),
                                None,
                                "register pairs {} and {} are ordered, not concurrent",
                                a.version,
                                b.version
                            );
                        }
                    }
                }
                for state in reg {
                    if let RegisterValue::InnerCRDT(child) = &state.value {
                        stack.push(*child);
                    }
                }
            };

            match node {
                OverlayValue::Register(reg) => check_register(reg, &mut stack),
                OverlayValue::Map(map) => {
                    for reg in map.values() {
                        check_register(reg, &mut stack);
                    }
                }
                OverlayValue::Collection(entries) => {
                    for val in entries.values() {
                        if let RegisterValue::InnerCRDT(child) = val {
                            stack.push(*child);
                        }
                    }
                }
            }
        }

        // Reachable from the root iff live.
        assert_eq!(visited.len(), self.data.len());
        for id in self.data.keys() {
            assert!(visited.contains(id), "node {} is unreachable", id);
        }
    }
}
