use log::{debug, warn};

use crate::branch::Branch;
use crate::causalgraph::remote_ids::{RemoteFrontierOwned, RemoteVersionOwned};
use crate::causalgraph::{AddRawResult, CausalGraph};
use crate::{
    AgentId, CRDTKind, CollectionOp, CreateValue, DTValue, DbError, OpContents, RemoteOp, LV,
    ROOT_CRDT_ID,
};

/// A replica: the causal graph plus the materialized node table. Access is
/// single threaded and synchronous; every call runs to completion.
#[derive(Debug, Clone, Default)]
pub struct Database {
    pub cg: CausalGraph,
    pub(crate) branch: Branch,
}

impl Database {
    pub fn new() -> Self {
        Self {
            cg: CausalGraph::new(),
            branch: Branch::new(),
        }
    }

    pub fn get_or_create_agent_id(&mut self, name: &str) -> AgentId {
        self.cg.get_or_create_agent_id(name)
    }

    /// The current causal frontier, in wire form.
    pub fn version(&self) -> RemoteFrontierOwned {
        self.cg.local_to_remote_frontier(self.cg.version.as_ref())
    }

    pub fn contains_crdt(&self, id: LV) -> bool {
        self.branch.contains_crdt(id)
    }

    pub fn get_recursive_at(&self, crdt_id: LV) -> Option<DTValue> {
        self.branch.get_recursive_at(crdt_id, &self.cg)
    }

    pub fn get_recursive(&self) -> Option<DTValue> {
        self.get_recursive_at(ROOT_CRDT_ID)
    }

    /// Applies an operation to this replica. This is the one write path: ops
    /// delivered from peers come through here directly, and local ops are
    /// routed through it by the `local_*` constructors.
    ///
    /// Returns the local version assigned to the op. Re-delivery of a known
    /// op is a no-op reported as [`AddRawResult::AlreadyKnown`], carrying the
    /// version assigned the first time. The op's parents must already have
    /// been applied; out-of-order delivery must be buffered upstream.
    pub fn apply_remote_op(&mut self, op: &RemoteOp) -> Result<AddRawResult, DbError> {
        let v = match self.cg.add_raw(op.id.borrow(), &op.parents)? {
            AddRawResult::Added(v) => v,
            AddRawResult::AlreadyKnown(v) => {
                debug!("op {} already applied as v{}; ignoring", op.id, v);
                return Ok(AddRawResult::AlreadyKnown(v));
            }
        };

        let parents = self.cg.remote_to_local_frontier(&op.parents)?;
        let target = self.cg.remote_to_target(op.target.borrow())?;

        if !self.branch.contains_crdt(target) {
            // The target was reclaimed by a concurrent overwrite. The op
            // keeps its place in the causal graph, but its effect is void.
            warn!("op {} targets reclaimed node {}; ignoring", op.id, op.target);
            return Ok(AddRawResult::Added(v));
        }

        match &op.contents {
            OpContents::RegisterSet { old_versions, value } => {
                let old_versions = self.cg.remote_to_local_frontier(old_versions)?;
                self.branch.modify_register(
                    &self.cg,
                    parents.as_ref(),
                    v,
                    target,
                    old_versions.as_ref(),
                    value,
                )?;
            }
            OpContents::MapSet {
                key,
                old_versions,
                value,
            } => {
                let old_versions = self.cg.remote_to_local_frontier(old_versions)?;
                self.branch.modify_map(
                    &self.cg,
                    parents.as_ref(),
                    v,
                    target,
                    key,
                    old_versions.as_ref(),
                    value,
                )?;
            }
            OpContents::Collection(CollectionOp::Insert(value)) => {
                self.branch.collection_insert(v, target, value)?;
            }
            OpContents::Collection(CollectionOp::Remove(entry)) => {
                let entry = self.cg.remote_to_local_version(entry.borrow())?;
                self.branch.collection_remove(target, entry)?;
            }
        }

        Ok(AddRawResult::Added(v))
    }

    // *** Local op constructors. Each one packages a locally initiated
    // change into a RemoteOp, applies it, and hands it back for transport.

    fn next_local_id(&self, agent: AgentId) -> RemoteVersionOwned {
        RemoteVersionOwned(
            self.cg.get_agent_name(agent).into(),
            self.cg.next_seq_for(agent),
        )
    }

    /// Sets `key` of the map `map_id` to a value, superseding every pair of
    /// the key's register this replica can currently see.
    pub fn local_map_insert(
        &mut self,
        agent: AgentId,
        map_id: LV,
        key: &str,
        value: CreateValue,
    ) -> Result<(RemoteOp, LV), DbError> {
        let old_versions = self.branch.register_versions(map_id, Some(key))?;
        let op = RemoteOp {
            id: self.next_local_id(agent),
            parents: self.version(),
            target: self.cg.target_to_remote(map_id),
            contents: OpContents::MapSet {
                key: key.into(),
                old_versions: self.cg.local_to_remote_frontier(&old_versions),
                value,
            },
        };

        let v = self.apply_remote_op(&op)?.lv();
        Ok((op, v))
    }

    pub fn local_register_set(
        &mut self,
        agent: AgentId,
        reg_id: LV,
        value: CreateValue,
    ) -> Result<(RemoteOp, LV), DbError> {
        let old_versions = self.branch.register_versions(reg_id, None)?;
        let op = RemoteOp {
            id: self.next_local_id(agent),
            parents: self.version(),
            target: self.cg.target_to_remote(reg_id),
            contents: OpContents::RegisterSet {
                old_versions: self.cg.local_to_remote_frontier(&old_versions),
                value,
            },
        };

        let v = self.apply_remote_op(&op)?.lv();
        Ok((op, v))
    }

    fn check_local_collection(&self, set_id: LV) -> Result<(), DbError> {
        match self.branch.kind_of(set_id) {
            Some(CRDTKind::Collection) => Ok(()),
            Some(_) => Err(DbError::InvalidTarget(set_id)),
            None => Err(DbError::MissingTarget(set_id)),
        }
    }

    pub fn local_collection_insert(
        &mut self,
        agent: AgentId,
        set_id: LV,
        value: CreateValue,
    ) -> Result<(RemoteOp, LV), DbError> {
        self.check_local_collection(set_id)?;
        let op = RemoteOp {
            id: self.next_local_id(agent),
            parents: self.version(),
            target: self.cg.target_to_remote(set_id),
            contents: OpContents::Collection(CollectionOp::Insert(value)),
        };

        let v = self.apply_remote_op(&op)?.lv();
        Ok((op, v))
    }

    /// Removes the collection entry inserted at (local) version `entry`.
    pub fn local_collection_remove(
        &mut self,
        agent: AgentId,
        set_id: LV,
        entry: LV,
    ) -> Result<(RemoteOp, LV), DbError> {
        self.check_local_collection(set_id)?;
        let op = RemoteOp {
            id: self.next_local_id(agent),
            parents: self.version(),
            target: self.cg.target_to_remote(set_id),
            contents: OpContents::Collection(CollectionOp::Remove(
                self.cg.local_to_remote_version(entry),
            )),
        };

        let v = self.apply_remote_op(&op)?.lv();
        Ok((op, v))
    }

    pub fn dbg_check(&self, deep: bool) {
        self.cg.dbg_check(deep);
        self.branch.dbg_check(&self.cg, deep);
    }
}

#[cfg(test)]
mod test {
    use crate::CreateValue::*;
    use crate::Primitive::*;
    use crate::*;

    fn rv(agent: &str, seq: usize) -> RemoteVersionOwned {
        RemoteVersionOwned(agent.into(), seq)
    }

    fn frontier(items: &[(&str, usize)]) -> RemoteFrontierOwned {
        items.iter().map(|&(agent, seq)| rv(agent, seq)).collect()
    }

    fn root_rv() -> RemoteVersionOwned {
        rv("ROOT", 0)
    }

    fn map_set(
        id: (&str, usize),
        parents: &[(&str, usize)],
        target: RemoteVersionOwned,
        key: &str,
        old_versions: &[(&str, usize)],
        value: CreateValue,
    ) -> RemoteOp {
        RemoteOp {
            id: rv(id.0, id.1),
            parents: frontier(parents),
            target,
            contents: OpContents::MapSet {
                key: key.into(),
                old_versions: frontier(old_versions),
                value,
            },
        }
    }

    fn get_key(db: &Database, key: &str) -> DTValue {
        let map = db.get_recursive().unwrap().unwrap_map();
        (**map.get(key).unwrap()).clone()
    }

    #[test]
    fn smoke() {
        let mut db = Database::new();
        let seph = db.get_or_create_agent_id("seph");
        db.local_map_insert(seph, ROOT_CRDT_ID, "name", Primitive(Str("seph".into())))
            .unwrap();

        let (_, inner) = db
            .local_map_insert(seph, ROOT_CRDT_ID, "facts", NewCRDT(CRDTKind::Map))
            .unwrap();
        db.local_map_insert(seph, inner, "cool", Primitive(I64(1)))
            .unwrap();

        assert_eq!(get_key(&db, "name").unwrap_primitive(), Str("seph".into()));
        let facts = get_key(&db, "facts").unwrap_map();
        assert_eq!(facts.get("cool").unwrap().as_ref(), &DTValue::Primitive(I64(1)));

        db.dbg_check(true);
    }

    #[test]
    fn concurrent_writes_tie_break() {
        let mut db = Database::new();

        db.apply_remote_op(&map_set(
            ("mike", 0),
            &[],
            root_rv(),
            "c",
            &[],
            Primitive(Str("mike".into())),
        ))
        .unwrap();
        db.apply_remote_op(&map_set(
            ("seph", 1),
            &[],
            root_rv(),
            "c",
            &[],
            Primitive(Str("seph".into())),
        ))
        .unwrap();

        // Both writes survive; the winner is picked by (agent, seq).
        assert_eq!(
            db.branch.register_versions(ROOT_CRDT_ID, Some("c")).unwrap().len(),
            2
        );
        assert_eq!(get_key(&db, "c"), DTValue::Primitive(Str("seph".into())));

        // Naming both pairs supersedes them.
        db.apply_remote_op(&map_set(
            ("mike", 1),
            &[("mike", 0), ("seph", 1)],
            root_rv(),
            "c",
            &[("mike", 0), ("seph", 1)],
            Primitive(Str("both".into())),
        ))
        .unwrap();

        assert_eq!(
            db.branch.register_versions(ROOT_CRDT_ID, Some("c")).unwrap().len(),
            1
        );
        assert_eq!(get_key(&db, "c"), DTValue::Primitive(Str("both".into())));

        db.dbg_check(true);
    }

    #[test]
    fn overwrite_reclaims_inner_crdt() {
        let mut db = Database::new();
        let seph = db.get_or_create_agent_id("seph");

        let (_, inner) = db
            .local_map_insert(seph, ROOT_CRDT_ID, "stuff", NewCRDT(CRDTKind::Map))
            .unwrap();
        db.local_map_insert(seph, inner, "cool", Primitive(Str("definitely".into())))
            .unwrap();
        assert!(db.contains_crdt(inner));

        db.local_map_insert(seph, ROOT_CRDT_ID, "stuff", Primitive(I64(0)))
            .unwrap();

        assert!(!db.contains_crdt(inner));
        assert_eq!(get_key(&db, "stuff"), DTValue::Primitive(I64(0)));
        db.dbg_check(true);
    }

    #[test]
    fn overwrite_reclaims_whole_subtree() {
        let mut db = Database::new();
        let seph = db.get_or_create_agent_id("seph");

        let (_, a) = db
            .local_map_insert(seph, ROOT_CRDT_ID, "a", NewCRDT(CRDTKind::Map))
            .unwrap();
        let (_, b) = db.local_map_insert(seph, a, "b", NewCRDT(CRDTKind::Map)).unwrap();
        let (_, set) = db
            .local_map_insert(seph, b, "set", NewCRDT(CRDTKind::Collection))
            .unwrap();
        let (_, elem) = db
            .local_collection_insert(seph, set, NewCRDT(CRDTKind::Map))
            .unwrap();
        db.local_map_insert(seph, elem, "deep", Primitive(Bool(true)))
            .unwrap();

        assert_eq!(db.branch.data.len(), 5);

        db.local_map_insert(seph, ROOT_CRDT_ID, "a", Primitive(Nil)).unwrap();

        // Only the root is left.
        assert_eq!(db.branch.data.len(), 1);
        for id in [a, b, set, elem] {
            assert!(!db.contains_crdt(id));
        }
        db.dbg_check(true);
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut db = Database::new();
        let op = map_set(("mike", 0), &[], root_rv(), "k", &[], Primitive(I64(7)));

        let v1 = db.apply_remote_op(&op).unwrap();
        assert_eq!(v1, AddRawResult::Added(0));
        let before = db.get_recursive();

        let v2 = db.apply_remote_op(&op).unwrap();
        assert_eq!(v2, AddRawResult::AlreadyKnown(0));
        assert_eq!(db.get_recursive(), before);
        assert_eq!(db.cg.len(), 1);

        db.dbg_check(true);
    }

    #[test]
    fn invalid_parents_are_rejected() {
        let mut db = Database::new();

        db.apply_remote_op(&map_set(("a", 0), &[], root_rv(), "k", &[], Primitive(I64(1))))
            .unwrap();
        db.apply_remote_op(&map_set(
            ("a", 1),
            &[("a", 0)],
            root_rv(),
            "k",
            &[("a", 0)],
            Primitive(I64(2)),
        ))
        .unwrap();

        // This op observed ("a", 1) but claims the register was empty.
        // Retaining that pair would break pair concurrency, so the op is
        // malformed.
        let err = db
            .apply_remote_op(&map_set(
                ("b", 0),
                &[("a", 1)],
                root_rv(),
                "k",
                &[],
                Primitive(I64(3)),
            ))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParents(_)));

        // The node table is unchanged.
        assert_eq!(get_key(&db, "k"), DTValue::Primitive(I64(2)));
        db.dbg_check(true);
    }

    #[test]
    fn mismatched_target_kind_is_rejected() {
        let mut db = Database::new();

        db.apply_remote_op(&map_set(
            ("a", 0),
            &[],
            root_rv(),
            "m",
            &[],
            NewCRDT(CRDTKind::Map),
        ))
        .unwrap();

        // A collection insert aimed at a map.
        let err = db
            .apply_remote_op(&RemoteOp {
                id: rv("b", 0),
                parents: frontier(&[("a", 0)]),
                target: rv("a", 0),
                contents: OpContents::Collection(CollectionOp::Insert(Primitive(I64(1)))),
            })
            .unwrap_err();
        assert_eq!(err, DbError::InvalidTarget(0));

        // A register set aimed at the root map.
        let err = db
            .apply_remote_op(&RemoteOp {
                id: rv("b", 1),
                parents: frontier(&[("a", 0)]),
                target: root_rv(),
                contents: OpContents::RegisterSet {
                    old_versions: frontier(&[]),
                    value: Primitive(I64(1)),
                },
            })
            .unwrap_err();
        assert_eq!(err, DbError::InvalidTarget(ROOT_CRDT_ID));

        db.dbg_check(true);
    }

    #[test]
    fn op_on_reclaimed_node_is_a_soft_noop() {
        let mut db = Database::new();

        db.apply_remote_op(&map_set(
            ("s", 0),
            &[],
            root_rv(),
            "stuff",
            &[],
            NewCRDT(CRDTKind::Map),
        ))
        .unwrap();

        // Concurrent overwrite reclaims the inner map...
        db.apply_remote_op(&map_set(
            ("m", 0),
            &[("s", 0)],
            root_rv(),
            "stuff",
            &[("s", 0)],
            Primitive(I64(1)),
        ))
        .unwrap();

        // ...and an op authored before its author saw that overwrite still
        // applies cleanly, with no effect.
        let v = db
            .apply_remote_op(&map_set(
                ("e", 0),
                &[("s", 0)],
                rv("s", 0),
                "x",
                &[],
                Primitive(I64(5)),
            ))
            .unwrap();
        assert_eq!(v, AddRawResult::Added(2));

        assert_eq!(db.cg.len(), 3);
        assert_eq!(get_key(&db, "stuff"), DTValue::Primitive(I64(1)));
        db.dbg_check(true);
    }

    #[test]
    fn unknown_target_version_is_fatal() {
        let mut db = Database::new();

        let err = db
            .apply_remote_op(&map_set(
                ("a", 0),
                &[],
                rv("ghost", 0),
                "k",
                &[],
                Primitive(I64(1)),
            ))
            .unwrap_err();
        assert_eq!(err, DbError::UnknownRawVersion(rv("ghost", 0)));

        // The op was still admitted to the causal graph.
        assert_eq!(db.cg.len(), 1);
        db.dbg_check(true);
    }

    #[test]
    fn collection_insert_and_remove() {
        let mut db = Database::new();
        let seph = db.get_or_create_agent_id("seph");

        let (_, set) = db
            .local_map_insert(seph, ROOT_CRDT_ID, "things", NewCRDT(CRDTKind::Collection))
            .unwrap();
        let (_, a) = db.local_collection_insert(seph, set, Primitive(I64(1))).unwrap();
        let (_, b) = db.local_collection_insert(seph, set, Primitive(I64(2))).unwrap();

        let things = get_key(&db, "things").unwrap_collection();
        assert_eq!(things.len(), 2);
        assert_eq!(things.get(&rv("seph", 1)).unwrap().as_ref(), &DTValue::Primitive(I64(1)));
        assert_eq!(things.get(&rv("seph", 2)).unwrap().as_ref(), &DTValue::Primitive(I64(2)));

        db.local_collection_remove(seph, set, a).unwrap();
        let things = get_key(&db, "things").unwrap_collection();
        assert_eq!(things.len(), 1);
        assert!(things.contains_key(&rv("seph", 2)));

        // A concurrent remove of the same entry is a silent no-op.
        db.apply_remote_op(&RemoteOp {
            id: rv("mike", 0),
            parents: frontier(&[("seph", 1), ("seph", 2)]),
            target: rv("seph", 0),
            contents: OpContents::Collection(CollectionOp::Remove(rv("seph", 1))),
        })
        .unwrap();

        let things = get_key(&db, "things").unwrap_collection();
        assert_eq!(things.len(), 1);
        let _ = b;

        db.dbg_check(true);
    }

    #[test]
    fn collection_remove_reclaims_owned_crdt() {
        let mut db = Database::new();
        let seph = db.get_or_create_agent_id("seph");

        let (_, set) = db
            .local_map_insert(seph, ROOT_CRDT_ID, "stuff", NewCRDT(CRDTKind::Collection))
            .unwrap();
        let (_, elem) = db
            .local_collection_insert(seph, set, NewCRDT(CRDTKind::Map))
            .unwrap();
        db.local_map_insert(seph, elem, "whoa", Primitive(I64(3214)))
            .unwrap();

        let stuff = get_key(&db, "stuff").unwrap_collection();
        let inner = (**stuff.get(&rv("seph", 1)).unwrap()).clone().unwrap_map();
        assert_eq!(inner.get("whoa").unwrap().as_ref(), &DTValue::Primitive(I64(3214)));

        db.local_collection_remove(seph, set, elem).unwrap();
        assert!(!db.contains_crdt(elem));
        assert!(get_key(&db, "stuff").unwrap_collection().is_empty());

        db.dbg_check(true);
    }

    #[test]
    fn nested_register_semantics() {
        let mut db = Database::new();
        let seph = db.get_or_create_agent_id("seph");

        let (_, reg) = db
            .local_map_insert(seph, ROOT_CRDT_ID, "r", NewCRDT(CRDTKind::Register))
            .unwrap();

        // A fresh register reads as nil.
        assert_eq!(get_key(&db, "r"), DTValue::Primitive(Nil));

        db.local_register_set(seph, reg, Primitive(Str("hi".into()))).unwrap();
        assert_eq!(get_key(&db, "r"), DTValue::Primitive(Str("hi".into())));

        // Two concurrent remote writes over seph's value.
        for (agent, val) in [("mike", "mike"), ("zed", "zed")] {
            db.apply_remote_op(&RemoteOp {
                id: rv(agent, 0),
                parents: frontier(&[("seph", 1)]),
                target: rv("seph", 0),
                contents: OpContents::RegisterSet {
                    old_versions: frontier(&[("seph", 1)]),
                    value: Primitive(Str(val.into())),
                },
            })
            .unwrap();
        }

        assert_eq!(db.branch.register_versions(reg, None).unwrap().len(), 2);
        assert_eq!(get_key(&db, "r"), DTValue::Primitive(Str("zed".into())));

        db.dbg_check(true);
    }

    #[test]
    fn delivery_order_does_not_matter() {
        let mut a = Database::new();
        let mut b = Database::new();
        let alice = a.get_or_create_agent_id("alice");
        let bob = b.get_or_create_agent_id("bob");

        let (op1, _) = a
            .local_map_insert(alice, ROOT_CRDT_ID, "x", Primitive(I64(1)))
            .unwrap();
        let (op2, _) = a
            .local_map_insert(alice, ROOT_CRDT_ID, "y", NewCRDT(CRDTKind::Map))
            .unwrap();
        let (op3, _) = b
            .local_map_insert(bob, ROOT_CRDT_ID, "x", Primitive(I64(2)))
            .unwrap();

        // Cross-deliver in different orders.
        b.apply_remote_op(&op1).unwrap();
        b.apply_remote_op(&op2).unwrap();
        a.apply_remote_op(&op3).unwrap();

        assert_eq!(a.get_recursive(), b.get_recursive());
        // Concurrent writes to "x": bob wins the tie-break on both replicas.
        assert_eq!(get_key(&a, "x"), DTValue::Primitive(I64(2)));

        // Continue editing on top of the merge.
        let y_on_b = b.cg.remote_to_local_version(op2.id.borrow()).unwrap();
        let (op4, _) = b
            .local_map_insert(bob, y_on_b, "z", Primitive(Bool(true)))
            .unwrap();
        a.apply_remote_op(&op4).unwrap();

        assert_eq!(a.get_recursive(), b.get_recursive());
        a.dbg_check(true);
        b.dbg_check(true);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn remote_op_round_trips_through_serde() {
        let op = map_set(
            ("seph", 0),
            &[("mike", 3)],
            root_rv(),
            "k",
            &[("mike", 3)],
            Primitive(F64(1.5)),
        );

        let json = serde_json::to_string(&op).unwrap();
        let back: RemoteOp = serde_json::from_str(&json).unwrap();
        assert_eq!(op, back);
    }
}
