// src/workflow/store.rs
//
// =============================================================================
// DROIDFLOW: WORKFLOW PERSISTENCE
// =============================================================================
//
// The on-disk format, UTF-8 JSON:
//   cards:        [{id, task_type, pos_x, pos_y, parameters, custom_name}]
//   connections:  [{start_card_id, end_card_id, type}]  (sequential only)
//   view_transform / view_center: frontend-only, carried opaquely
//   metadata:     {created_date, engine_version, module_versions}
//
// Loads are best-effort: unreadable cards are dropped with a warning,
// unknown fields ignored, and the "module bundle" shape
// {module_info, workflow: {...}} unwraps to the inner workflow.
// Success/failure edges are never persisted; they rebuild from card
// parameters after every load.

use crate::tasks::TaskRegistry;
use crate::workflow::{Card, EdgeKind, Workflow, WorkflowMeta};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::OnceLock;

/// Frontend view state, round-tripped untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewState {
    #[serde(default)]
    pub view_transform: Vec<f64>,
    #[serde(default)]
    pub view_center: Vec<f64>,
}

/// Parameters that reference cards and may arrive as display strings.
const CARD_REF_PARAMS: &[&str] = &[
    "success_jump_target_id",
    "failure_jump_target_id",
    "next_step_card_id",
];

// ============================================================================
// SERIALIZATION
// ============================================================================

pub fn to_json(wf: &Workflow, registry: Option<&TaskRegistry>) -> Value {
    let mut cards = Vec::new();
    for card in wf.cards() {
        let mut params = card.parameters.clone();
        strip_transient_params(&mut params, &card.task_type, registry);
        cards.push(json!({
            "id": card.id,
            "task_type": card.task_type,
            "pos_x": card.pos_x,
            "pos_y": card.pos_y,
            "parameters": params,
            "custom_name": card.custom_name,
        }));
    }

    // Only sequential lines persist; branch edges rebuild from parameters.
    let connections: Vec<Value> = wf
        .edges()
        .iter()
        .filter(|e| e.kind == EdgeKind::Sequential)
        .map(|e| {
            json!({
                "start_card_id": e.from,
                "end_card_id": e.to,
                "type": "sequential",
            })
        })
        .collect();

    let view = wf.view.clone().unwrap_or(ViewState {
        view_transform: vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        view_center: vec![0.0, 0.0],
    });

    json!({
        "cards": cards,
        "connections": connections,
        "view_transform": view.view_transform,
        "view_center": view.view_center,
        "metadata": {
            "created_date": wf.meta.created_date,
            "engine_version": wf.meta.engine_version,
            "module_versions": wf.meta.module_versions,
        },
    })
}

/// Drops parameters the task module declared as transient UI state.
fn strip_transient_params(
    params: &mut Map<String, Value>,
    task_type: &str,
    registry: Option<&TaskRegistry>,
) {
    let Some(module) = registry.and_then(|r| r.get(task_type)) else {
        return;
    };
    for spec in module.params_def() {
        if !spec.save_to_workflow {
            params.remove(&spec.name);
        }
    }
}

// ============================================================================
// DESERIALIZATION
// ============================================================================

pub fn from_json(value: &Value, name: &str) -> Result<Workflow> {
    // Module bundle shape: use the inner workflow.
    let data = match value.get("workflow") {
        Some(inner) if value.get("cards").is_none() => {
            let module = value
                .get("module_info")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("未知模块");
            log::info!("module bundle detected, unwrapping workflow '{module}'");
            inner
        }
        _ => value,
    };

    let obj = data
        .as_object()
        .context("workflow data is not a JSON object")?;

    let mut wf = Workflow::new(name);

    // Metadata (best-effort).
    if let Some(meta) = obj.get("metadata") {
        wf.meta = WorkflowMeta {
            created_date: meta
                .get("created_date")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            engine_version: meta
                .get("engine_version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            module_versions: meta
                .get("module_versions")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        };
    }

    // View state rides along untouched.
    wf.view = serde_json::from_value::<ViewState>(data.clone()).ok().filter(|v| {
        !v.view_transform.is_empty() || !v.view_center.is_empty()
    });

    // Cards: drop unreadable records, keep loading.
    let cards = obj
        .get("cards")
        .and_then(Value::as_array)
        .context("workflow data missing 'cards'")?;
    for raw in cards {
        let mut card: Card = match serde_json::from_value(raw.clone()) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("dropping unreadable card record: {e}");
                continue;
            }
        };
        normalize_card_refs(&mut card.parameters);
        if let Err(e) = wf.add_card(card) {
            log::warn!("dropping card: {e}");
        }
    }

    // Connections: sequential only; others rebuild from parameters.
    let connections = obj
        .get("connections")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| {
            log::warn!("workflow missing 'connections', assuming empty");
            Vec::new()
        });
    for conn in &connections {
        let kind = conn.get("type").and_then(Value::as_str).unwrap_or("sequential");
        if kind != "sequential" {
            log::debug!("skipping persisted non-sequential line ({kind})");
            continue;
        }
        let (Some(from), Some(to)) = (
            conn.get("start_card_id").and_then(Value::as_i64),
            conn.get("end_card_id").and_then(Value::as_i64),
        ) else {
            log::warn!("dropping connection with missing endpoints: {conn}");
            continue;
        };
        if let Err(e) = wf.add_edge(from, to, EdgeKind::Sequential) {
            log::warn!("dropping connection {from} -> {to}: {e}");
        }
    }

    wf.rebuild_derived_edges();
    log::info!(
        "loaded workflow '{name}': {} card(s), {} edge(s)",
        wf.card_count(),
        wf.edges().len()
    );
    Ok(wf)
}

/// Normalizes card-reference parameters to plain integers. The editor
/// serializes them as display strings like `"延迟 (ID: 12)"`; `"none"`
/// and placeholder values collapse to absent.
fn normalize_card_refs(params: &mut Map<String, Value>) {
    for key in CARD_REF_PARAMS {
        let Some(raw) = params.get(*key).cloned() else {
            continue;
        };
        match parse_card_ref(&raw) {
            Some(id) => {
                params.insert((*key).to_string(), Value::Number(id.into()));
            }
            None => {
                params.remove(*key);
            }
        }
    }
}

/// Extracts a card id from a reference value in any of its wire shapes.
pub fn parse_card_ref(value: &Value) -> Option<i64> {
    static ID_RE: OnceLock<Regex> = OnceLock::new();

    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("none") || s == "默认" || s == "无" {
                return None;
            }
            let re = ID_RE.get_or_init(|| Regex::new(r"\(ID:\s*(\d+)\)").expect("static rule"));
            if let Some(caps) = re.captures(s) {
                return caps[1].parse().ok();
            }
            s.parse().ok()
        }
        _ => None,
    }
}

// ============================================================================
// FILE I/O
// ============================================================================

pub fn load(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid workflow JSON in {}", path.display()))?;

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    from_json(&value, &name)
}

/// Atomic save: write a sibling temp file, then rename over the target.
pub fn save(wf: &Workflow, path: impl AsRef<Path>, registry: Option<&TaskRegistry>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let value = to_json(wf, registry);
    let text = serde_json::to_string_pretty(&value)?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text.as_bytes())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;

    log::info!("saved workflow to {}", path.display());
    Ok(())
}

/// Timestamped copy under `backups/` beside the file.
pub fn backup(path: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let backups = dir.join("backups");
    std::fs::create_dir_all(&backups)?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let target = backups.join(format!("{stem}_backup_{stamp}.json"));

    std::fs::copy(path, &target)
        .with_context(|| format!("failed to back up {}", path.display()))?;
    log::info!("backed up workflow to {}", target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_refs_parse_all_wire_shapes() {
        assert_eq!(parse_card_ref(&json!(12)), Some(12));
        assert_eq!(parse_card_ref(&json!("12")), Some(12));
        assert_eq!(parse_card_ref(&json!("延迟 (ID: 34)")), Some(34));
        assert_eq!(parse_card_ref(&json!("查找图片 (ID:7)")), Some(7));
        assert_eq!(parse_card_ref(&json!("none")), None);
        assert_eq!(parse_card_ref(&json!("默认")), None);
        assert_eq!(parse_card_ref(&json!("")), None);
        assert_eq!(parse_card_ref(&json!(null)), None);
    }

    #[test]
    fn missing_connections_defaults_to_empty() {
        let value = json!({"cards": [{"id": 0, "task_type": "起点"}]});
        let wf = from_json(&value, "t").unwrap();
        assert_eq!(wf.card_count(), 1);
        assert!(wf.edges().is_empty());
    }

    #[test]
    fn unreadable_cards_are_dropped_not_fatal() {
        let value = json!({
            "cards": [
                {"id": 0, "task_type": "起点"},
                {"id": "not-a-number", "task_type": 5},
            ],
            "connections": [],
        });
        let wf = from_json(&value, "t").unwrap();
        assert_eq!(wf.card_count(), 1);
    }

    #[test]
    fn module_bundle_unwraps_inner_workflow() {
        let value = json!({
            "module_info": {"name": "登录模块"},
            "workflow": {
                "cards": [{"id": 0, "task_type": "起点"}],
                "connections": [],
            },
        });
        let wf = from_json(&value, "t").unwrap();
        assert_eq!(wf.card_count(), 1);
    }
}
