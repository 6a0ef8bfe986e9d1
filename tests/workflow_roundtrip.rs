use droidflow::core::{ACTION_JUMP, ACTION_NEXT};
use droidflow::tasks::TaskRegistry;
use droidflow::workflow::{store, Card, EdgeKind, Workflow, START_TASK_TYPE};
use serde_json::json;

fn sample_workflow() -> Workflow {
    let mut wf = Workflow::new("sample");
    wf.add_card(Card::new(0, START_TASK_TYPE)).unwrap();
    wf.add_card(
        Card::new(1, "查找图片")
            .with_param("image_file", "button.png")
            .with_param("on_failure", ACTION_JUMP)
            .with_param("failure_jump_target_id", 2),
    )
    .unwrap();
    wf.add_card(
        Card::new(2, "延迟")
            .with_param("delay_mode", "固定延迟")
            .with_param("fixed_delay", 1.5),
    )
    .unwrap();
    wf.add_edge(0, 1, EdgeKind::Sequential).unwrap();
    wf.add_edge(1, 2, EdgeKind::Sequential).unwrap();
    wf.rebuild_derived_edges();
    wf
}

#[test]
fn save_load_roundtrip_preserves_persisted_subset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.json");

    let original = sample_workflow();
    let registry = TaskRegistry::with_builtins();
    store::save(&original, &path, Some(&registry)).unwrap();

    let loaded = store::load(&path).unwrap();

    // Cards survive with ids, types, and parameters intact.
    assert_eq!(loaded.card_count(), original.card_count());
    for card in original.cards() {
        let got = loaded.card(card.id).expect("card missing after roundtrip");
        assert_eq!(got.task_type, card.task_type);
        assert_eq!(got.parameters, card.parameters);
    }

    // Sequential edges survive; derived edges rebuild identically.
    assert_eq!(loaded.sequential_next(0), Some(1));
    assert_eq!(loaded.sequential_next(1), Some(2));
    assert_eq!(loaded.outgoing(1, EdgeKind::Failure), Some(2));
    assert!(loaded.outgoing(1, EdgeKind::Success).is_none());

    // Metadata survives.
    assert_eq!(loaded.meta.engine_version, original.meta.engine_version);
    assert_eq!(loaded.meta.created_date, original.meta.created_date);
}

#[test]
fn only_sequential_connections_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seq-only.json");

    let wf = sample_workflow();
    store::save(&wf, &path, None).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let connections = raw["connections"].as_array().unwrap();
    assert_eq!(connections.len(), 2);
    for conn in connections {
        assert_eq!(conn["type"], json!("sequential"));
    }
}

#[test]
fn display_string_jump_targets_parse_on_load() {
    let value = json!({
        "cards": [
            {"id": 0, "task_type": START_TASK_TYPE, "parameters": {}},
            {"id": 1, "task_type": "查找图片", "parameters": {
                "on_failure": ACTION_JUMP,
                "failure_jump_target_id": "延迟 (ID: 2)",
            }},
            {"id": 2, "task_type": "延迟", "parameters": {
                "on_success": ACTION_NEXT,
                "success_jump_target_id": "none",
            }},
        ],
        "connections": [
            {"start_card_id": 0, "end_card_id": 1, "type": "sequential"},
        ],
        "metadata": {"created_date": "2024-01-01", "engine_version": "1.0.0"},
    });

    let wf = store::from_json(&value, "strings").unwrap();
    assert_eq!(wf.outgoing(1, EdgeKind::Failure), Some(2));
    // "none" collapses to absent, so no success edge appears.
    assert!(wf.outgoing(2, EdgeKind::Success).is_none());
    assert!(!wf
        .card(2)
        .unwrap()
        .parameters
        .contains_key("success_jump_target_id"));
}

#[test]
fn unknown_fields_and_view_state_are_tolerated() {
    let value = json!({
        "cards": [{"id": 0, "task_type": START_TASK_TYPE}],
        "connections": [],
        "view_transform": [2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 10.0, 20.0, 1.0],
        "view_center": [512.0, 384.0],
        "some_future_field": {"nested": true},
    });

    let wf = store::from_json(&value, "tolerant").unwrap();
    let view = wf.view.clone().expect("view state should be preserved");
    assert_eq!(view.view_center, vec![512.0, 384.0]);

    // And it survives a save.
    let out = store::to_json(&wf, None);
    assert_eq!(out["view_transform"][0], json!(2.0));
}

#[test]
fn backup_creates_timestamped_copy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backed.json");
    store::save(&sample_workflow(), &path, None).unwrap();

    let backup_path = store::backup(&path).unwrap();
    assert!(backup_path.exists());
    assert!(backup_path.parent().unwrap().ends_with("backups"));
    let name = backup_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("backed_backup_"));

    // The backup loads like the original.
    let wf = store::load(&backup_path).unwrap();
    assert_eq!(wf.card_count(), 3);
}
