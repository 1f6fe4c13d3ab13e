//! The public façade (C7): `Machine` and `CurrentState`. Everything above
//! this module (engine, tree, context, data registry) is internal
//! plumbing; this is the surface applications actually hold onto.

use std::any::TypeId;
use std::sync::Arc;

use crate::codec::Codec;
use crate::context::{boxed_value, AnyValue};
use crate::engine::{Engine, HandledMessage, ProcessedMessage, Transition};
use crate::error::GearboxError;
use crate::history::History;
use crate::key::StateKey;
use crate::stream::ValueStream;
use crate::tree::Tree;

const DEFAULT_REDIRECT_LIMIT: u32 = 8;

/// A running instance of a state tree (§4.7). Cheap to clone — every clone
/// is a handle onto the same engine, the way a nested machine-leaf state
/// and its owning application both hold onto "the same" inner machine.
#[derive(Clone)]
pub struct Machine {
    engine: Arc<Engine>,
}

impl Machine {
    pub fn new(tree: Tree) -> Self {
        Self::new_with_label(tree, "machine")
    }

    pub fn new_with_label(tree: Tree, label: impl Into<String>) -> Self {
        Self { engine: Engine::new(label.into(), tree, DEFAULT_REDIRECT_LIMIT) }
    }

    /// As [`Self::new_with_label`], overriding the redirect-depth bound
    /// from §4.5 step 5 (default 8).
    pub fn with_redirect_limit(tree: Tree, label: impl Into<String>, limit: u32) -> Self {
        Self { engine: Engine::new(label.into(), tree, limit) }
    }

    pub fn label(&self) -> &str {
        &self.engine.label
    }

    /// Enables history behavior (§9 design note: the teacher's `History`
    /// component, generalized to the standalone tree) for the composite
    /// state named by `key`.
    pub fn enable_history(&self, key: StateKey, kind: History) {
        if let Some(node) = self.engine.tree.find(key) {
            self.engine.enable_history(node, kind);
        }
    }

    /// §4.5 "Start": enters the initial path from the root.
    pub async fn start(&self) -> Result<CurrentState, GearboxError> {
        self.engine.start().await?;
        Ok(self.current_state())
    }

    /// §4.5 "External stop": transitions to the implicit `<stopped>` final
    /// leaf. Idempotent.
    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub fn is_done(&self) -> bool {
        self.engine.is_done()
    }

    pub fn current_state(&self) -> CurrentState {
        CurrentState { engine: self.engine.clone() }
    }

    /// §4.5 "Post": serialized, at-most-one-in-flight message dispatch.
    pub async fn post<M: Send + Sync + 'static>(&self, message: M) -> ProcessedMessage {
        self.engine.post(boxed_value(message), TypeId::of::<M>()).await
    }

    pub(crate) async fn post_any(&self, message: AnyValue) -> ProcessedMessage {
        let type_id = (*message).type_id();
        self.engine.post(message, type_id).await
    }

    /// Every committed [`Transition`], in commit order (§4.7).
    pub fn transitions(&self) -> ValueStream<Transition> {
        self.engine.transitions.subscribe()
    }

    /// Every [`ProcessedMessage`] classification, in post order (§4.7).
    pub fn processed(&self) -> ValueStream<ProcessedMessage> {
        self.engine.processed.subscribe()
    }

    /// Only the subset of `processed` that was actually handled (§4.7).
    pub fn handled(&self) -> ValueStream<HandledMessage> {
        self.engine.handled.subscribe()
    }

    /// §6 "Persisted state layout": the activation path from root to the
    /// current leaf, with the encoded value of every data-typed state on
    /// that path that carries a [`Codec`] (§11 "Snapshot round-trip
    /// helpers").
    pub fn encode_snapshot(&self) -> Result<Vec<SnapshotEntry>, GearboxError> {
        let leaf = self.engine.current_leaf().ok_or(GearboxError::NoActiveState)?;
        let path = self.engine.tree.path_from_root(leaf);
        let mut out = Vec::with_capacity(path.len());
        for node_id in path {
            let node = self.engine.tree.node(node_id);
            let encoded = match (&node.codec, self.engine.data.read_any(node_id)) {
                (Some(codec), Some(value)) => Some(codec.encode(&value)?),
                _ => None,
            };
            out.push(SnapshotEntry {
                state_name: node.key.name().to_string(),
                data_type_name: node.key.data_type_name().map(str::to_string),
                encoded,
            });
        }
        Ok(out)
    }

    /// Rebuilds a `Machine` from a previously-`encode_snapshot`'d activation
    /// path, against the same tree the snapshot was produced from (§6: a
    /// restore against a different tree, or an entry whose name/type no
    /// longer matches a node on the path, fails with
    /// [`GearboxError::SnapshotMismatch`]). Entry handlers are not re-run —
    /// only `Machine::start` runs `on_enter` (see DESIGN.md).
    pub fn restore_from(tree: Tree, label: impl Into<String>, snapshot: &[SnapshotEntry]) -> Result<Machine, GearboxError> {
        let machine = Self::new_with_label(tree, label);
        let mut path = Vec::with_capacity(snapshot.len());
        let mut data = Vec::new();
        for entry in snapshot {
            let node_id = machine
                .engine
                .tree
                .find_by_name(&entry.state_name)
                .ok_or_else(|| GearboxError::SnapshotMismatch { reason: format!("no state named {}", entry.state_name).into() })?;
            let node = machine.engine.tree.node(node_id);
            match (&node.codec, &entry.encoded) {
                (Some(codec), Some(bytes)) => data.push((node_id, codec.decode(bytes)?)),
                (None, None) => {}
                _ => {
                    return Err(GearboxError::SnapshotMismatch {
                        reason: format!("codec presence mismatch for state {}", entry.state_name).into(),
                    })
                }
            }
            path.push(node_id);
        }
        machine.engine.restore_path(path, data);
        Ok(machine)
    }
}

/// One entry of a `§6` snapshot: a state on the activation path, the name
/// of the data type stored there (if any), and its codec-encoded bytes.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub state_name: String,
    pub data_type_name: Option<String>,
    pub encoded: Option<Vec<u8>>,
}

/// A read-only proxy onto the machine's currently active leaf (§4.7).
/// Cloning a `Machine` and calling `current_state()` repeatedly always
/// observes the live state, never a stale snapshot.
pub struct CurrentState {
    engine: Arc<Engine>,
}

impl CurrentState {
    pub fn key(&self) -> Option<StateKey> {
        self.engine.current_key()
    }

    /// True if `ancestor` is on the path from root to the current leaf
    /// (inclusive).
    pub fn is_in(&self, ancestor: StateKey) -> bool {
        self.engine.is_in(ancestor)
    }

    pub fn data_value<D: Clone + Send + Sync + 'static>(&self, key: StateKey) -> Result<D, GearboxError> {
        let node = self.engine.tree.find(key).ok_or(GearboxError::NoSuchDataState(key))?;
        self.engine.data.read(node)
    }

    /// §11 "CurrentState::data_stream": a typed subscribe-to-changes view,
    /// built directly on the data registry's broadcast primitive.
    pub fn data_stream<D: Clone + Send + Sync + 'static>(&self, key: StateKey) -> Result<ValueStream<D>, GearboxError> {
        let node = self.engine.tree.find(key).ok_or(GearboxError::NoSuchDataState(key))?;
        self.engine.data.stream(node)
    }

    pub async fn post<M: Send + Sync + 'static>(&self, message: M) -> ProcessedMessage {
        self.engine.post(boxed_value(message), TypeId::of::<M>()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;
    use crate::tree::NodeKind;

    fn two_state_machine() -> Machine {
        let mut builder = TreeBuilder::new();
        builder.add_root(StateKey::new("root"), StateKey::new("a"));
        builder.add(StateKey::new("a"), NodeKind::Leaf, StateKey::new("root"));
        builder.add(StateKey::new("b"), NodeKind::Leaf, StateKey::new("root"));
        Machine::new(builder.build().unwrap())
    }

    #[tokio::test]
    async fn start_enters_initial_child() {
        let machine = two_state_machine();
        let state = machine.start().await.unwrap();
        assert_eq!(state.key(), Some(StateKey::new("a")));
        assert!(state.is_in(StateKey::new("root")));
    }

    #[tokio::test]
    async fn post_before_start_is_ignored() {
        let machine = two_state_machine();
        let processed = machine.post(()).await;
        assert!(matches!(processed, ProcessedMessage::Ignored));
    }

    #[tokio::test]
    async fn stop_after_stop_is_a_no_op() {
        let machine = two_state_machine();
        machine.start().await.unwrap();
        machine.stop().await;
        assert!(machine.is_done());
        machine.stop().await;
        assert!(machine.is_done());
    }
}
