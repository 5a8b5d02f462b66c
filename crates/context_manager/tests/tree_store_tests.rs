use std::sync::Arc;

use async_trait::async_trait;
use chat_core::state::state_from_value;
use chat_core::{SnapshotPolicy, VariableState};
use context_manager::{
    ChainIssue, ContextError, ConversationTreeStore, NewTurn, ParsedFields, TurnUpdate,
    TREES_COLLECTION,
};
use mockall::mock;
use serde_json::{json, Value};
use storage_manager::{MemoryStorage, RecordStorage, StorageError};

fn vars(value: Value) -> VariableState {
    state_from_value(value).unwrap()
}

fn store() -> (Arc<MemoryStorage>, ConversationTreeStore) {
    let storage = Arc::new(MemoryStorage::new());
    let store = ConversationTreeStore::new(storage.clone(), SnapshotPolicy::default());
    (storage, store)
}

#[tokio::test]
async fn branches_keep_their_own_state_and_delete_cascades() {
    let (_, store) = store();
    let tree = store.create_tree("story-1").await.unwrap();
    let root = tree.id.clone();

    let t1 = store
        .add_turn(&tree.id, &root, NewTurn::new("hello", "welcome, traveller"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.resolve_state(&tree.id, &t1).await.unwrap(), Some(vars(json!({}))));

    let t2 = store
        .add_turn(
            &tree.id,
            &t1,
            NewTurn::new("dig", "you find gold").with_variables(vars(json!({"gold": 10}))),
        )
        .await
        .unwrap()
        .unwrap();
    let path = store.get_path_to_turn(&tree.id, &t2).await.unwrap().unwrap();
    assert!(path[1].state_diff.as_ref().is_some_and(Vec::is_empty));
    assert!(path[2].state_diff.is_some());
    assert!(!path[2].is_snapshot());
    assert_eq!(
        store.resolve_state(&tree.id, &t2).await.unwrap(),
        Some(vars(json!({"gold": 10})))
    );

    let switched = store.switch_branch(&tree.id, &t1).await.unwrap().unwrap();
    assert_eq!(switched.tree.current_turn_id, t1);
    assert!(switched.state.is_empty());
    assert!(!switched.repaired);

    let t3 = store
        .add_turn(
            &tree.id,
            &t1,
            NewTurn::new("fight", "you win").with_variables(vars(json!({"gold": 5, "hp": 100}))),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        store.resolve_state(&tree.id, &t3).await.unwrap(),
        Some(vars(json!({"gold": 5, "hp": 100})))
    );
    assert_eq!(
        store.resolve_state(&tree.id, &t2).await.unwrap(),
        Some(vars(json!({"gold": 10})))
    );
    assert_eq!(store.get_child_turns(&tree.id, &t1).await.unwrap().len(), 2);

    let tree = store.delete_turn(&tree.id, &t1).await.unwrap().unwrap();
    assert_eq!(tree.turns.len(), 1);
    assert_eq!(tree.current_turn_id, root);
    assert!(!store.node_exists(&tree.id, &t2).await.unwrap());
    assert!(!store.node_exists(&tree.id, &t3).await.unwrap());
}

#[tokio::test]
async fn create_tree_is_idempotent_per_owner() {
    let (_, store) = store();
    let first = store.create_tree("owner").await.unwrap();
    let second = store.create_tree("owner").await.unwrap();
    let other = store.create_tree("someone-else").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_ne!(first.id, other.id);
    assert_eq!(
        store.get_tree_by_owner("owner").await.unwrap().map(|tree| tree.id),
        Some(first.id)
    );
}

#[tokio::test]
async fn root_cannot_be_deleted_and_missing_ids_are_absent() {
    let (_, store) = store();
    let tree = store.create_tree("owner").await.unwrap();

    assert!(store.delete_turn(&tree.id, &tree.id).await.unwrap().is_none());
    assert!(store.get_tree("nope").await.unwrap().is_none());
    assert!(store
        .add_turn("nope", "root", NewTurn::new("a", "b"))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .add_turn(&tree.id, "missing-parent", NewTurn::new("a", "b"))
        .await
        .unwrap()
        .is_none());
    assert!(store.switch_branch(&tree.id, "missing").await.unwrap().is_none());
    assert!(!store.node_exists("nope", "x").await.unwrap());
}

#[tokio::test]
async fn delete_outside_current_branch_keeps_pointer() {
    let (_, store) = store();
    let tree = store.create_tree("owner").await.unwrap();
    let a = store.add_turn(&tree.id, &tree.id, NewTurn::new("a", "a")).await.unwrap().unwrap();
    let b = store.add_turn(&tree.id, &tree.id, NewTurn::new("b", "b")).await.unwrap().unwrap();

    let tree = store.delete_turn(&tree.id, &a).await.unwrap().unwrap();
    assert_eq!(tree.current_turn_id, b);
    assert_eq!(tree.turns.len(), 2);
}

#[tokio::test]
async fn corrupted_ancestor_is_repaired_on_switch() {
    let (storage, store) = store();
    let tree = store.create_tree("owner").await.unwrap();
    let t1 = store.add_turn(&tree.id, &tree.id, NewTurn::new("a", "a")).await.unwrap().unwrap();
    let t2 = store
        .add_turn(&tree.id, &t1, NewTurn::new("b", "b").with_variables(vars(json!({"gold": 10}))))
        .await
        .unwrap()
        .unwrap();
    let t3 = store
        .add_turn(&tree.id, &t2, NewTurn::new("c", "c").with_variables(vars(json!({"gold": 12}))))
        .await
        .unwrap()
        .unwrap();

    let mut records = storage.read(TREES_COLLECTION).await.unwrap();
    let turns = records[0]["turns"].as_array_mut().unwrap();
    let t2_record = turns.iter_mut().find(|turn| turn["id"] == t2.as_str()).unwrap();
    t2_record["state_diff"][0]["old_value"] = json!(99);
    storage.write(TREES_COLLECTION, records).await.unwrap();

    let report = store.validate_turn(&tree.id, &t3).await.unwrap().unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.broken_at.as_deref(), Some(t2.as_str()));
    assert_eq!(report.issue, Some(ChainIssue::StaleDiff { key: "gold".into() }));

    let switched = store.switch_branch(&tree.id, &t3).await.unwrap().unwrap();
    assert!(switched.repaired);
    assert_eq!(switched.state, vars(json!({"gold": 12})));
    assert_eq!(switched.tree.current_turn_id, t3);

    assert!(store.validate_turn(&tree.id, &t3).await.unwrap().unwrap().is_valid);
    let path = store.get_path_to_turn(&tree.id, &t3).await.unwrap().unwrap();
    assert!(path[2].is_snapshot());
    assert_eq!(
        store.resolve_state(&tree.id, &t2).await.unwrap(),
        Some(vars(json!({"gold": 10})))
    );
}

#[tokio::test]
async fn editing_a_turn_keeps_descendant_states() {
    let (_, store) = store();
    let tree = store.create_tree("owner").await.unwrap();
    let t1 = store
        .add_turn(&tree.id, &tree.id, NewTurn::new("a", "a").with_variables(vars(json!({"gold": 1}))))
        .await
        .unwrap()
        .unwrap();
    let t2 = store
        .add_turn(&tree.id, &t1, NewTurn::new("b", "b").with_variables(vars(json!({"gold": 1, "hp": 5}))))
        .await
        .unwrap()
        .unwrap();
    let t3 = store
        .add_turn(&tree.id, &t2, NewTurn::new("c", "c").with_variables(vars(json!({"gold": 1, "hp": 4}))))
        .await
        .unwrap()
        .unwrap();
    let side = store
        .add_turn(&tree.id, &t1, NewTurn::new("d", "d").with_variables(vars(json!({"gold": 2}))))
        .await
        .unwrap()
        .unwrap();

    store
        .update_turn(
            &tree.id,
            &t1,
            TurnUpdate {
                variables: Some(vars(json!({"gold": 7}))),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

    let expected = [
        (&t1, json!({"gold": 7})),
        (&t2, json!({"gold": 1, "hp": 5})),
        (&t3, json!({"gold": 1, "hp": 4})),
        (&side, json!({"gold": 2})),
    ];
    for (id, state) in expected {
        assert_eq!(store.resolve_state(&tree.id, id).await.unwrap(), Some(vars(state)));
        assert!(store.validate_turn(&tree.id, id).await.unwrap().unwrap().is_valid);
    }
}

#[tokio::test]
async fn restored_state_matches_state_at_creation() {
    let (_, store) = store();
    let tree = store.create_tree("owner").await.unwrap();
    let mut parent = tree.id.clone();
    let mut expected = Vec::new();

    for step in 0..40 {
        let state = vars(json!({
            "step": step,
            "gold": step * 3,
            "log": format!("entry {step}"),
            "flag": step % 2 == 0,
        }));
        let id = store
            .add_turn(&tree.id, &parent, NewTurn::new("go", "ok").with_variables(state.clone()))
            .await
            .unwrap()
            .unwrap();
        expected.push((id.clone(), state));
        parent = id;
    }

    for (id, state) in &expected {
        assert_eq!(store.resolve_state(&tree.id, id).await.unwrap().as_ref(), Some(state));
    }

    let stats = store
        .storage_statistics(&tree.id, &parent)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_nodes, 40);
    assert_eq!(stats.snapshot_count + stats.diff_count, 40);
    // A checkpoint snapshot follows every 16 consecutive diffs.
    assert!(stats.snapshot_count >= 2);
}

#[tokio::test]
async fn init_marker_forces_snapshot() {
    let (_, store) = store();
    let tree = store.create_tree("owner").await.unwrap();
    let id = store
        .add_turn(
            &tree.id,
            &tree.id,
            NewTurn::new("start", "ok <initvar>{\"hp\": 3}</initvar>")
                .with_variables(vars(json!({"hp": 3}))),
        )
        .await
        .unwrap()
        .unwrap();

    let path = store.get_path_to_turn(&tree.id, &id).await.unwrap().unwrap();
    assert!(path[1].is_snapshot());
    assert_eq!(path[1].state_snapshot, Some(vars(json!({"hp": 3}))));
}

#[tokio::test]
async fn explicit_ids_and_read_helpers() {
    let (_, store) = store();
    let tree = store.create_tree("owner").await.unwrap();

    let first = store
        .add_turn(&tree.id, &tree.id, NewTurn::new("", "You are a ship's cook.").with_id("intro"))
        .await
        .unwrap();
    assert_eq!(first.as_deref(), Some("intro"));
    let duplicate = store
        .add_turn(&tree.id, &tree.id, NewTurn::new("again", "x").with_id("intro"))
        .await
        .unwrap();
    assert!(duplicate.is_none());

    let mut turn = NewTurn::new("next", "sure");
    turn.parsed = Some(ParsedFields {
        next_prompts: vec!["cook".into(), "sail".into()],
        events: vec![],
    });
    let next = store.add_turn(&tree.id, "intro", turn).await.unwrap().unwrap();

    assert_eq!(
        store.get_system_message(&tree.id).await.unwrap().as_deref(),
        Some("You are a ship's cook.")
    );
    assert_eq!(store.get_last_turn_id(&tree.id).await.unwrap(), Some(next.clone()));

    let updated = store
        .update_turn(
            &tree.id,
            &next,
            TurnUpdate {
                response: Some("edited".into()),
                variables: Some(vars(json!({"fish": 2}))),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    let turn = updated.get(&next).unwrap();
    assert_eq!(turn.response, "edited");
    assert_eq!(turn.user_input, "next");
    assert_eq!(turn.parsed.as_ref().unwrap().next_prompts.len(), 2);
    assert_eq!(
        store.resolve_state(&tree.id, &next).await.unwrap(),
        Some(vars(json!({"fish": 2})))
    );

    let cleared = store.clear_history(&tree.id).await.unwrap().unwrap();
    assert_eq!(cleared.turns.len(), 1);
    assert_eq!(cleared.current_turn_id, tree.id);
}

#[tokio::test]
async fn trees_are_isolated_in_one_collection() {
    let (_, store) = store();
    let a = store.create_tree("a").await.unwrap();
    let b = store.create_tree("b").await.unwrap();
    store.add_turn(&a.id, &a.id, NewTurn::new("x", "y")).await.unwrap();

    assert!(store.delete_tree(&a.id).await.unwrap());
    assert!(!store.delete_tree(&a.id).await.unwrap());
    assert_eq!(store.get_tree(&b.id).await.unwrap().unwrap().turns.len(), 1);
}

mock! {
    pub Storage {}

    #[async_trait]
    impl RecordStorage for Storage {
        async fn read(&self, collection: &str) -> storage_manager::Result<Vec<Value>>;
        async fn write(&self, collection: &str, records: Vec<Value>) -> storage_manager::Result<()>;
    }
}

#[tokio::test]
async fn storage_failures_propagate() {
    let mut storage = MockStorage::new();
    storage.expect_read().returning(|_| Ok(Vec::new()));
    storage
        .expect_write()
        .returning(|_, _| Err(StorageError::Backend("disk full".into())));

    let store = ConversationTreeStore::new(Arc::new(storage), SnapshotPolicy::default());
    let error = store.create_tree("owner").await.unwrap_err();
    assert!(matches!(error, ContextError::Storage(StorageError::Backend(_))));
}

#[tokio::test]
async fn unreadable_records_surface_as_errors() {
    let mut storage = MockStorage::new();
    storage
        .expect_read()
        .returning(|_| Ok(vec![json!({"id": 7})]));

    let store = ConversationTreeStore::new(Arc::new(storage), SnapshotPolicy::default());
    let error = store.get_tree("anything").await.unwrap_err();
    assert!(matches!(error, ContextError::Serialization(_)));
}
