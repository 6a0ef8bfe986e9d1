// src/workflow.rs
//
// =============================================================================
// DROIDFLOW: WORKFLOW GRAPH MODEL
// =============================================================================
//
// The Graph Brain.
//
// Responsibilities:
// 1. Hold cards (keyed map) and typed edges (flat list of ids).
// 2. Derive success/failure edges from card parameters, and keep the
//    parameters in sync when edges or cards are removed.
// 3. Enforce the structural invariants (single start card, edge
//    multiplicity, no orphans, no branch self-loops).
// 4. Assign display sequence numbers by BFS over sequential edges.
//
// Cards and edges reference each other by id only; no cross-pointers.

use crate::core::{ACTION_JUMP, ACTION_NEXT};
use crate::tasks::TaskRegistry;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

pub mod store;

/// Task type of the unique entry card.
pub const START_TASK_TYPE: &str = "起点";

// ============================================================================
// 1. CARDS & EDGES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: i64,
    pub task_type: String,
    #[serde(default)]
    pub pos_x: f64,
    #[serde(default)]
    pub pos_y: f64,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub custom_name: Option<String>,
}

impl Card {
    pub fn new(id: i64, task_type: impl Into<String>) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            pos_x: 0.0,
            pos_y: 0.0,
            parameters: Map::new(),
            custom_name: None,
        }
    }

    pub fn is_start(&self) -> bool {
        self.task_type == START_TASK_TYPE
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    fn action_param(&self, key: &str) -> &str {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(ACTION_NEXT)
    }

    fn jump_target(&self, key: &str) -> Option<i64> {
        crate::tasks::param_i64(&self.parameters, key)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Sequential,
    Success,
    Failure,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Sequential => "sequential",
            EdgeKind::Success => "success",
            EdgeKind::Failure => "failure",
        }
    }

    /// The card parameters a derived edge of this kind lives in.
    fn param_keys(&self) -> Option<(&'static str, &'static str)> {
        match self {
            EdgeKind::Sequential => None,
            EdgeKind::Success => Some(("on_success", "success_jump_target_id")),
            EdgeKind::Failure => Some(("on_failure", "failure_jump_target_id")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub from: i64,
    pub to: i64,
    pub kind: EdgeKind,
}

// ============================================================================
// 2. ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum WorkflowError {
    #[error("卡片 {0} 已存在")]
    DuplicateCard(i64),
    #[error("已存在起点卡片 (ID: {0})")]
    DuplicateStartCard(i64),
    #[error("卡片 {0} 不存在")]
    UnknownCard(i64),
    #[error("不允许 {kind:?} 自环 (卡片 {card})")]
    BranchSelfLoop { card: i64, kind: EdgeKind },
    #[error("重复连线 {from} -> {to} ({kind:?})")]
    DuplicateEdge { from: i64, to: i64, kind: EdgeKind },
}

// ============================================================================
// 3. THE WORKFLOW
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub created_date: String,
    pub engine_version: String,
    #[serde(default)]
    pub module_versions: Map<String, Value>,
}

impl Default for WorkflowMeta {
    fn default() -> Self {
        Self {
            created_date: chrono::Local::now().to_rfc3339(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            module_versions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub name: String,
    cards: BTreeMap<i64, Card>,
    edges: Vec<Edge>,
    pub meta: WorkflowMeta,
    /// Frontend view state; opaque to the engine, preserved on save.
    pub view: Option<store::ViewState>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    pub fn card(&self, id: i64) -> Option<&Card> {
        self.cards.get(&id)
    }

    pub fn card_mut(&mut self, id: i64) -> Option<&mut Card> {
        self.cards.get_mut(&id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    pub fn start_card(&self) -> Option<&Card> {
        self.cards.values().find(|c| c.is_start())
    }

    // ------------------------------------------------------------------------
    // CARD MUTATION
    // ------------------------------------------------------------------------

    pub fn add_card(&mut self, card: Card) -> Result<i64, WorkflowError> {
        if self.cards.contains_key(&card.id) {
            return Err(WorkflowError::DuplicateCard(card.id));
        }
        if card.is_start() {
            if let Some(existing) = self.start_card() {
                return Err(WorkflowError::DuplicateStartCard(existing.id));
            }
        }
        let id = card.id;
        self.cards.insert(id, card);
        Ok(id)
    }

    /// Removes a card, its edges, and every reference to it in other
    /// cards' jump parameters (resetting their actions to the default).
    pub fn remove_card(&mut self, id: i64) -> Result<Card, WorkflowError> {
        let card = self
            .cards
            .remove(&id)
            .ok_or(WorkflowError::UnknownCard(id))?;

        self.edges.retain(|e| e.from != id && e.to != id);

        for other in self.cards.values_mut() {
            for kind in [EdgeKind::Success, EdgeKind::Failure] {
                let (action_key, target_key) = kind.param_keys().unwrap_or(("", ""));
                if other.jump_target(target_key) == Some(id) {
                    log::info!(
                        "scrubbing jump reference to deleted card {id} from card {}",
                        other.id
                    );
                    other.parameters.remove(target_key);
                    if other.action_param(action_key) == ACTION_JUMP {
                        other
                            .parameters
                            .insert(action_key.to_string(), Value::String(ACTION_NEXT.into()));
                    }
                }
            }
        }

        Ok(card)
    }

    // ------------------------------------------------------------------------
    // EDGE MUTATION
    // ------------------------------------------------------------------------

    /// Adds an edge, enforcing multiplicity: a new edge replaces the old
    /// outgoing edge of the same kind. Success/failure edges also write
    /// the jump parameters they are derived from.
    pub fn add_edge(&mut self, from: i64, to: i64, kind: EdgeKind) -> Result<(), WorkflowError> {
        if !self.cards.contains_key(&from) {
            return Err(WorkflowError::UnknownCard(from));
        }
        if !self.cards.contains_key(&to) {
            return Err(WorkflowError::UnknownCard(to));
        }
        if from == to && kind != EdgeKind::Sequential {
            return Err(WorkflowError::BranchSelfLoop { card: from, kind });
        }
        if self
            .edges
            .iter()
            .any(|e| e.from == from && e.to == to && e.kind == kind)
        {
            return Err(WorkflowError::DuplicateEdge { from, to, kind });
        }

        // One outgoing edge per (card, kind): the new edge wins.
        self.edges.retain(|e| !(e.from == from && e.kind == kind));
        self.edges.push(Edge { from, to, kind });

        if let Some((action_key, target_key)) = kind.param_keys() {
            if let Some(card) = self.cards.get_mut(&from) {
                card.parameters
                    .insert(action_key.to_string(), Value::String(ACTION_JUMP.into()));
                card.parameters
                    .insert(target_key.to_string(), Value::Number(to.into()));
            }
        }
        Ok(())
    }

    /// Removes the outgoing edge of `kind`. For derived kinds this clears
    /// the jump target and resets the action back to the default.
    pub fn remove_edge(&mut self, from: i64, kind: EdgeKind) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| !(e.from == from && e.kind == kind));
        let removed = self.edges.len() != before;

        if removed {
            if let Some((action_key, target_key)) = kind.param_keys() {
                if let Some(card) = self.cards.get_mut(&from) {
                    card.parameters.remove(target_key);
                    if card.action_param(action_key) == ACTION_JUMP {
                        card.parameters
                            .insert(action_key.to_string(), Value::String(ACTION_NEXT.into()));
                    }
                }
            }
        }
        removed
    }

    pub fn outgoing(&self, from: i64, kind: EdgeKind) -> Option<i64> {
        self.edges
            .iter()
            .find(|e| e.from == from && e.kind == kind)
            .map(|e| e.to)
    }

    pub fn sequential_next(&self, from: i64) -> Option<i64> {
        self.outgoing(from, EdgeKind::Sequential)
    }

    // ------------------------------------------------------------------------
    // DERIVED EDGES
    // ------------------------------------------------------------------------

    /// Rebuilds success/failure edges from card parameters. Dangling jump
    /// targets are cleared with a warning; only sequential edges survive a
    /// round-trip, so this runs after every load.
    pub fn rebuild_derived_edges(&mut self) {
        self.edges.retain(|e| e.kind == EdgeKind::Sequential);

        let ids: Vec<i64> = self.cards.keys().copied().collect();
        for id in ids {
            for kind in [EdgeKind::Success, EdgeKind::Failure] {
                let (action_key, target_key) = match kind.param_keys() {
                    Some(keys) => keys,
                    None => continue,
                };

                let (action, target) = {
                    let card = &self.cards[&id];
                    (
                        card.action_param(action_key).to_string(),
                        card.jump_target(target_key),
                    )
                };
                if action != ACTION_JUMP {
                    continue;
                }
                match target {
                    Some(t) if self.cards.contains_key(&t) && t != id => {
                        self.edges.push(Edge { from: id, to: t, kind });
                    }
                    Some(t) => {
                        log::warn!("card {id}: dangling jump target {t}, clearing");
                        if let Some(card) = self.cards.get_mut(&id) {
                            card.parameters.remove(target_key);
                            card.parameters
                                .insert(action_key.to_string(), Value::String(ACTION_NEXT.into()));
                        }
                    }
                    None => {}
                }
            }
        }
    }

    /// A card is output-restricted when neither action parameter asks for
    /// a jump — or its task type never branches at all.
    pub fn is_restricted(&self, id: i64, registry: Option<&TaskRegistry>) -> bool {
        let Some(card) = self.cards.get(&id) else {
            return true;
        };
        if let Some(reg) = registry {
            if !reg.branches_allowed(&card.task_type) {
                return true;
            }
        }
        card.action_param("on_success") == ACTION_NEXT
            && card.action_param("on_failure") == ACTION_NEXT
    }

    /// Applies the restricted-output rule: a restricted card keeps no
    /// success/failure edges.
    pub fn enforce_restrictions(&mut self, registry: Option<&TaskRegistry>) {
        let restricted: Vec<i64> = self
            .cards
            .keys()
            .copied()
            .filter(|&id| self.is_restricted(id, registry))
            .collect();
        self.edges
            .retain(|e| e.kind == EdgeKind::Sequential || !restricted.contains(&e.from));
    }

    // ------------------------------------------------------------------------
    // SEQUENCE NUMBERING
    // ------------------------------------------------------------------------

    /// BFS over sequential edges from the start card, ties broken by
    /// ascending card id. Display-only, but it mirrors the order the
    /// executor walks when every card follows its sequential edge.
    pub fn sequence_numbers(&self) -> BTreeMap<i64, u32> {
        let mut out = BTreeMap::new();
        let Some(start) = self.start_card() else {
            return out;
        };

        let mut graph: DiGraph<i64, ()> = DiGraph::new();
        let mut index: HashMap<i64, NodeIndex> = HashMap::new();
        for &id in self.cards.keys() {
            index.insert(id, graph.add_node(id));
        }
        for e in self.edges.iter().filter(|e| e.kind == EdgeKind::Sequential) {
            graph.add_edge(index[&e.from], index[&e.to], ());
        }

        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        queue.push_back(index[&start.id]);
        let mut seq: u32 = 0;

        while let Some(node) = queue.pop_front() {
            let id = graph[node];
            if out.contains_key(&id) {
                continue;
            }
            out.insert(id, seq);
            seq += 1;

            let mut next: Vec<i64> = graph
                .neighbors_directed(node, petgraph::Direction::Outgoing)
                .map(|n| graph[n])
                .filter(|n| !out.contains_key(n))
                .collect();
            next.sort_unstable();
            for n in next {
                queue.push_back(index[&n]);
            }
        }
        out
    }

    // ------------------------------------------------------------------------
    // VALIDATION
    // ------------------------------------------------------------------------

    /// Structural check; returns human-readable violations.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let start_count = self.cards.values().filter(|c| c.is_start()).count();
        if start_count > 1 {
            problems.push(format!("{start_count} 个起点卡片，最多允许 1 个"));
        }

        for e in &self.edges {
            if !self.cards.contains_key(&e.from) || !self.cards.contains_key(&e.to) {
                problems.push(format!(
                    "孤立连线 {} -> {} ({})",
                    e.from,
                    e.to,
                    e.kind.as_str()
                ));
            }
            if e.from == e.to && e.kind != EdgeKind::Sequential {
                problems.push(format!("{} 自环 (卡片 {})", e.kind.as_str(), e.from));
            }
        }

        // Multiplicity: one outgoing edge per (card, kind).
        let mut seen: Vec<(i64, EdgeKind)> = Vec::new();
        for e in &self.edges {
            if seen.contains(&(e.from, e.kind)) {
                problems.push(format!(
                    "卡片 {} 有多条 {} 出边",
                    e.from,
                    e.kind.as_str()
                ));
            }
            seen.push((e.from, e.kind));
        }

        // Jump targets must resolve or be null.
        for card in self.cards.values() {
            for key in ["success_jump_target_id", "failure_jump_target_id"] {
                if let Some(t) = card.jump_target(key) {
                    if !self.cards.contains_key(&t) {
                        problems.push(format!("卡片 {} 的跳转目标 {t} 不存在", card.id));
                    }
                }
            }
        }

        problems
    }

    /// Executability requires exactly one start card.
    pub fn ensure_executable(&self) -> Result<(), String> {
        match self.cards.values().filter(|c| c.is_start()).count() {
            1 => Ok(()),
            0 => Err("找不到起始卡片".to_string()),
            n => Err(format!("存在 {n} 个起始卡片")),
        }
    }
}
