//! The transition/dispatch engine (C5): the one piece of the crate that
//! knows how to walk the ancestor chain for message dispatch, compute the
//! LCA for a transition, and run the exit/enter sequence in the right
//! order. Everything else (the façade, the data registry, the tree) is
//! passive by comparison; this module is where the state machine actually
//! runs.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::context::{
    AnyValue, Decision, DataAccess, EntryContext, MessageContext, NextEntry, NextMessage, Phase, ScheduledTimer,
    TransitionActionHandler, TransitionContext, TransitionReason,
};
use crate::data::DataRegistry;
use crate::error::GearboxError;
use crate::history::{History, HistoryState};
use crate::key::{StateKey, STOPPED_KEY};
use crate::nested::NestedHandle;
use crate::tree::{InitialChild, NodeId, Tree};

/// An immutable record of one committed transition (§3, §4.7).
#[derive(Debug, Clone)]
pub struct Transition {
    pub source: StateKey,
    pub target: StateKey,
    /// Deepest-first.
    pub exited: Vec<StateKey>,
    /// Shallowest-first.
    pub entered: Vec<StateKey>,
    pub reason: TransitionReason,
    pub self_transition: bool,
}

impl Transition {
    pub fn is_self_transition(&self) -> bool {
        self.self_transition
    }

    pub fn is_initial(&self) -> bool {
        matches!(self.reason, TransitionReason::Initial)
    }
}

/// A transition that did not complete (§7 `HandlerError`, §8 scenario S6):
/// as much of the exit/enter path as ran before the failing callback raised.
#[derive(Debug, Clone)]
pub struct AbortedTransition {
    pub source: StateKey,
    pub target: StateKey,
    pub exited: Vec<StateKey>,
    pub entered: Vec<StateKey>,
}

/// §4.7/§3: what a single `post` produced.
#[derive(Debug, Clone)]
pub enum ProcessedMessage {
    Handled(HandledMessage),
    Unhandled { leaf: StateKey, inspected: Vec<StateKey> },
    Failed { leaf: StateKey, error: GearboxError, inspected: Vec<StateKey>, aborted_transition: Option<AbortedTransition> },
    /// §7 `Stopped`: a post that arrived after the machine reached its
    /// terminal phase. Not an error.
    Ignored,
}

impl ProcessedMessage {
    pub fn is_handled(&self) -> bool {
        matches!(self, ProcessedMessage::Handled(_))
    }
}

#[derive(Debug, Clone)]
pub struct HandledMessage {
    pub leaf: StateKey,
    pub handling_state: StateKey,
    pub transition: Option<Transition>,
}

struct ActiveState {
    leaf: Option<NodeId>,
    ancestors: Vec<NodeId>,
}

pub struct Engine {
    pub(crate) label: String,
    pub(crate) tree: Tree,
    pub(crate) data: Arc<DataRegistry>,
    pub(crate) redirect_limit: u32,
    active: RwLock<ActiveState>,
    busy: AsyncMutex<()>,
    history: Mutex<HashMap<NodeId, History>>,
    history_state: Mutex<HashMap<NodeId, HistoryState>>,
    nested: Mutex<HashMap<NodeId, NestedHandle>>,
    timers: Mutex<HashMap<NodeId, Vec<JoinHandle<()>>>>,
    /// §4.5 step 6 / §5: messages posted by a handler, queued FIFO and
    /// drained strictly after the triggering dispatch's `ProcessedMessage`
    /// is emitted — never raced across detached tasks (see DESIGN.md).
    pending: Mutex<std::collections::VecDeque<(AnyValue, TypeId)>>,
    done: AtomicBool,
    stopped: AtomicBool,
    pub(crate) transitions: crate::stream::ValueSink<Transition>,
    pub(crate) processed: crate::stream::ValueSink<ProcessedMessage>,
    pub(crate) handled: crate::stream::ValueSink<HandledMessage>,
}

impl Engine {
    pub fn new(label: String, tree: Tree, redirect_limit: u32) -> Arc<Self> {
        let (transitions, _) = crate::stream::channel();
        let (processed, _) = crate::stream::channel();
        let (handled, _) = crate::stream::channel();
        let engine = Arc::new(Self {
            label,
            tree,
            data: Arc::new(DataRegistry::new()),
            redirect_limit,
            active: RwLock::new(ActiveState { leaf: None, ancestors: Vec::new() }),
            busy: AsyncMutex::new(()),
            history: Mutex::new(HashMap::new()),
            history_state: Mutex::new(HashMap::new()),
            nested: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            pending: Mutex::new(std::collections::VecDeque::new()),
            done: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            transitions,
            processed,
            handled,
        });
        engine
    }

    pub fn enable_history(&self, node: NodeId, kind: History) {
        self.history.lock().insert(node, kind);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn current_leaf(&self) -> Option<NodeId> {
        self.active.read().leaf
    }

    pub fn current_key(&self) -> Option<StateKey> {
        if self.stopped.load(Ordering::SeqCst) {
            return Some(STOPPED_KEY);
        }
        self.current_leaf().map(|n| self.tree.node(n).key)
    }

    pub fn is_in(&self, key: StateKey) -> bool {
        let active = self.active.read();
        active.ancestors.iter().any(|&n| self.tree.node(n).key == key)
    }

    fn data_access(&self, node: NodeId) -> DataAccess {
        DataAccess { registry: self.data.clone(), node, ancestors: self.tree.ancestors(node) }
    }

    // ---- lifecycle -------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> Result<(), GearboxError> {
        let root = self.tree.root();
        let mut target = root;
        let mut redirects = 0u32;
        loop {
            let (leaf, path) = self.resolve_to_leaf(target)?;
            let mut tctx = TransitionContext::new(None, HashMap::new());
            let mut entered = Vec::new();
            let mut redirected = None;
            for &node_id in &path {
                match self.enter_node(node_id, tctx, None).await {
                    Ok(next_tctx) => {
                        tctx = next_tctx;
                        entered.push(node_id);
                    }
                    Err((next_tctx, Outcome::Redirect(to))) => {
                        tctx = next_tctx;
                        redirected = Some(to);
                        break;
                    }
                    Err((_, Outcome::Error(err))) => {
                        // Roll back whatever entered successfully so far, deepest first.
                        self.rollback_entries(&entered).await;
                        return Err(err);
                    }
                }
            }
            if let Some(redirect_target) = redirected {
                self.rollback_entries(&entered).await;
                redirects += 1;
                if redirects > self.redirect_limit {
                    return Err(GearboxError::RedirectCycle { target: redirect_target, limit: self.redirect_limit });
                }
                let Some(redirect_node) = self.tree.find(redirect_target) else {
                    return Err(GearboxError::Definition(crate::error::DefinitionError::UnknownTarget(redirect_target)));
                };
                target = redirect_node;
                continue;
            }

            {
                let mut active = self.active.write();
                active.leaf = Some(leaf);
                active.ancestors = self.tree.ancestors(leaf);
            }
            self.maybe_mark_done(leaf);
            self.transitions.set(Transition {
                source: self.tree.node(root).key,
                target: self.tree.node(leaf).key,
                exited: Vec::new(),
                entered: entered.iter().map(|&n| self.tree.node(n).key).collect(),
                reason: TransitionReason::Initial,
                self_transition: false,
            });
            debug!(machine_label = %self.label, key = %self.tree.node(leaf).key, "machine started");
            return Ok(());
        }
    }

    pub async fn stop(self: &Arc<Self>) {
        let _permit = self.busy.lock().await;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let exit_chain = match self.current_leaf() {
            Some(leaf) => self.tree.ancestors(leaf),
            None => Vec::new(),
        };
        let source_key = exit_chain.first().map(|&n| self.tree.node(n).key).unwrap_or(STOPPED_KEY);

        let mut tctx = TransitionContext::new(None, HashMap::new());
        for &node_id in &exit_chain {
            match self.exit_node(node_id, tctx).await {
                Ok(next) => tctx = next,
                Err(err) => {
                    warn!(machine_label = %self.label, error = %err, "on_exit raised during stop(); continuing");
                    tctx = TransitionContext::new(None, HashMap::new());
                }
            }
            self.cancel_timers(node_id);
        }

        {
            let mut active = self.active.write();
            active.leaf = None;
            active.ancestors = Vec::new();
        }
        self.done.store(true, Ordering::SeqCst);
        self.transitions.set(Transition {
            source: source_key,
            target: STOPPED_KEY,
            exited: exit_chain.iter().map(|&n| self.tree.node(n).key).collect(),
            entered: Vec::new(),
            reason: TransitionReason::ExternalStop,
            self_transition: false,
        });
        self.transitions.close();
        debug!(machine_label = %self.label, "machine stopped");
    }

    // ---- message dispatch (§4.4) ------------------------------------

    pub async fn post(self: &Arc<Self>, message: AnyValue, message_type: TypeId) -> ProcessedMessage {
        if self.is_done() {
            return ProcessedMessage::Ignored;
        }
        let _permit = self.busy.lock().await;
        let processed = self.dispatch(message, message_type).await;
        // §4.5 step 6 / §5: messages a handler posted during this dispatch
        // are delivered strictly after the triggering `ProcessedMessage` is
        // emitted, one at a time in the order they were queued, still under
        // this same `busy` permit so they can never interleave with a
        // concurrently-arriving external `post`.
        self.drain_pending().await;
        processed
    }

    async fn drain_pending(self: &Arc<Self>) {
        loop {
            if self.is_done() {
                break;
            }
            let next = self.pending.lock().pop_front();
            let Some((message, message_type)) = next else { break };
            self.dispatch(message, message_type).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, message: AnyValue, message_type: TypeId) -> ProcessedMessage {
        if self.is_done() {
            return ProcessedMessage::Ignored;
        }
        let Some(leaf) = self.current_leaf() else {
            return ProcessedMessage::Ignored;
        };
        let leaf_key = self.tree.node(leaf).key;
        let chain = self.tree.ancestors(leaf);

        let mut inspected = Vec::new();
        let mut outcome = None;
        for &node_id in &chain {
            let node = self.tree.node(node_id);
            if node.is_machine_leaf() && node.forward_messages {
                let nested = self.nested.lock().get(&node_id).map(|h| h.machine.clone());
                if let Some(nested) = nested {
                    nested.post_any(message.clone()).await;
                    let done_now = self.nested.lock().get(&node_id).map(|h| h.is_done()).unwrap_or(false);
                    if done_now {
                        if let Some(on_done) = node.on_machine_done.clone() {
                            let inner_final = nested.current_state().key();
                            let decision = on_done(inner_final);
                            inspected.push(node.key);
                            outcome = Some((node_id, decision, std::collections::VecDeque::new(), Vec::new(), TransitionReason::NestedDone));
                            break;
                        }
                    }
                }
            }
            let Some(handler) = node.message_handler.clone() else { continue };
            inspected.push(node.key);
            let ctx = MessageContext::new(node_id, node.key, message.clone(), message_type, self.data_access(node_id));
            let ctx = invoke_message(&node.filters, handler, ctx).await;
            match ctx.finish() {
                Err(err) => {
                    let processed =
                        ProcessedMessage::Failed { leaf: leaf_key, error: err, inspected: inspected.clone(), aborted_transition: None };
                    self.processed.set(processed.clone());
                    return processed;
                }
                Ok((Decision::Unhandled, _, _)) => {
                    trace!(machine_label = %self.label, key = %node.key, "message unhandled, continuing up ancestor chain");
                }
                Ok((decision, posted, scheduled)) => {
                    outcome = Some((node_id, decision, posted, scheduled, TransitionReason::ExternalMessage));
                    break;
                }
            }
        }

        let (processed, posted, scheduled) = match outcome {
            None => (ProcessedMessage::Unhandled { leaf: leaf_key, inspected }, std::collections::VecDeque::new(), Vec::new()),
            Some((source, decision, posted, scheduled, reason)) => match self.apply_decision(source, decision, reason).await {
                Ok(transition) => {
                    let handled = HandledMessage { leaf: leaf_key, handling_state: self.tree.node(source).key, transition };
                    self.handled.set(handled.clone());
                    (ProcessedMessage::Handled(handled), posted, scheduled)
                }
                Err((error, aborted_transition)) => {
                    (ProcessedMessage::Failed { leaf: leaf_key, error, inspected, aborted_transition }, posted, scheduled)
                }
            },
        };
        debug!(machine_label = %self.label, handled = processed.is_handled(), "message processed");
        // Emitted before the posted/scheduled side effects are drained, per
        // §5 ("messages posted from within a handler are delivered strictly
        // after the current ProcessedMessage is emitted") — drained
        // regardless of outcome, since posting/scheduling is not contingent
        // on the handled decision actually producing a transition.
        self.processed.set(processed.clone());
        self.drain_side_effects(posted, scheduled);
        processed
    }

    async fn apply_decision(
        self: &Arc<Self>,
        source: NodeId,
        decision: Decision,
        reason: TransitionReason,
    ) -> Result<Option<Transition>, (GearboxError, Option<AbortedTransition>)> {
        match decision {
            Decision::Unhandled | Decision::Stay => Ok(None),
            Decision::GoTo { target, payload, metadata, reenter, transition_action } => {
                self.run_transition(source, target, payload, metadata, reenter, transition_action, reason).await.map(Some)
            }
            Decision::GoToSelf { payload, metadata, transition_action } => {
                let target = self.tree.node(source).key;
                self.run_transition(source, target, payload, metadata, true, transition_action, reason).await.map(Some)
            }
        }
    }

    /// Posted messages and armed timers are drained regardless of the
    /// decision that produced them (`stay` included) — see DESIGN.md.
    /// Posted messages are appended to the engine's own FIFO `pending`
    /// queue rather than spawned as independent tasks: a detached task per
    /// message races for `busy` against every other detached task and
    /// against new external posts, so spawn order does not guarantee
    /// delivery order. `pending` is drained in order by `drain_pending`,
    /// under the same `busy` permit as the dispatch that queued it.
    fn drain_side_effects(self: &Arc<Self>, mut posted: std::collections::VecDeque<AnyValue>, scheduled: Vec<ScheduledTimer>) {
        for timer in scheduled {
            self.arm_timer(timer);
        }
        if posted.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        while let Some(message) = posted.pop_front() {
            let type_id = (*message).type_id();
            pending.push_back((message, type_id));
        }
    }

    fn arm_timer(self: &Arc<Self>, timer: ScheduledTimer) {
        let engine = self.clone();
        let owner = self.current_leaf();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(timer.delay).await;
                let value = (timer.produce)();
                let type_id = (*value).type_id();
                engine.post(value, type_id).await;
                if !timer.periodic {
                    break;
                }
            }
        });
        if let Some(leaf) = owner {
            self.timers.lock().entry(leaf).or_default().push(handle);
        }
    }

    fn cancel_timers(&self, node: NodeId) {
        if let Some(handles) = self.timers.lock().remove(&node) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    // ---- transitions (§4.3, §4.5) ------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_transition(
        self: &Arc<Self>,
        source: NodeId,
        mut target_key: StateKey,
        mut payload: Option<AnyValue>,
        mut metadata: HashMap<String, AnyValue>,
        mut reenter: bool,
        mut action: Option<TransitionActionHandler>,
        reason: TransitionReason,
    ) -> Result<Transition, (GearboxError, Option<AbortedTransition>)> {
        let source_key = self.tree.node(source).key;
        let mut redirects = 0u32;
        loop {
            let target_node = self
                .tree
                .find(target_key)
                .ok_or((GearboxError::Definition(crate::error::DefinitionError::UnknownTarget(target_key)), None))?;

            let current_leaf = self.current_leaf().ok_or((GearboxError::NoActiveState, None))?;
            let lca = if reenter {
                self.tree.node(target_node).parent.unwrap_or(target_node)
            } else {
                self.tree.lca(current_leaf, target_node)
            };

            let exit_path: Vec<NodeId> = self.tree.ancestors(current_leaf).into_iter().take_while(|&n| n != lca).collect();
            let (leaf_target, descend) = self
                .resolve_to_leaf(target_node)
                .map_err(|e| (e, Some(self.aborted(source_key, target_key, &exit_path, &[]))))?;
            let root_to_leaf = self.tree.path_from_root(leaf_target);
            let lca_index = root_to_leaf.iter().position(|&n| n == lca).unwrap_or(0);
            let mut enter_path = root_to_leaf[lca_index + 1..].to_vec();
            if enter_path.is_empty() {
                enter_path = descend;
            }

            // Captured once, before any exit runs: the nearest-first chain
            // `[leaf, ..., root]` that was active when this transition
            // started. A history-enabled node exiting mid-walk records its
            // own slice of this snapshot rather than something recomputed
            // node-by-node, so each owner is written exactly once.
            let pre_exit_active_path = self.tree.ancestors(current_leaf);

            let mut tctx = TransitionContext::new(payload.clone(), metadata.clone());
            // `exit_path` is already ordered deepest-first (it comes from
            // `ancestors()`, nearest-first from the source leaf up to the LCA).
            for &node_id in exit_path.iter() {
                tctx = self
                    .exit_node(node_id, tctx)
                    .await
                    .map_err(|e| (e, Some(self.aborted(source_key, target_key, &exit_path, &[]))))?;
                self.cancel_timers(node_id);
                self.record_history(node_id, &pre_exit_active_path);
            }

            if let Some(act) = action.take() {
                let ctx = EntryContext { node: source, key: source_key, transition: tctx, data: self.data_access(source) };
                let (ctx, result) = invoke_entry(&[], act, ctx).await;
                tctx = ctx.transition;
                result.map_err(|e| (e, Some(self.aborted(source_key, target_key, &exit_path, &[]))))?;
            }

            let mut entered = Vec::new();
            let mut redirected = None;
            for (i, &node_id) in enter_path.iter().enumerate() {
                let node_payload = if i + 1 == enter_path.len() { payload.clone() } else { None };
                match self.enter_node(node_id, tctx, node_payload).await {
                    Ok(next) => {
                        tctx = next;
                        entered.push(node_id);
                    }
                    Err((next, Outcome::Redirect(to))) => {
                        tctx = next;
                        redirected = Some(to);
                        break;
                    }
                    Err((_, Outcome::Error(err))) => {
                        self.rollback_entries(&entered).await;
                        return Err((err, Some(self.aborted(source_key, target_key, &exit_path, &entered_keys(self, &entered)))));
                    }
                }
            }

            if let Some(new_target) = redirected {
                self.rollback_entries(&entered).await;
                redirects += 1;
                if redirects > self.redirect_limit {
                    return Err((
                        GearboxError::RedirectCycle { target: new_target, limit: self.redirect_limit },
                        Some(self.aborted(source_key, target_key, &exit_path, &[])),
                    ));
                }
                target_key = new_target;
                payload = None;
                metadata = HashMap::new();
                reenter = false;
                continue;
            }

            {
                let mut active = self.active.write();
                active.leaf = Some(leaf_target);
                active.ancestors = self.tree.ancestors(leaf_target);
            }

            let transition = Transition {
                source: source_key,
                target: self.tree.node(leaf_target).key,
                exited: exit_path.iter().map(|&n| self.tree.node(n).key).collect(),
                entered: enter_path.iter().map(|&n| self.tree.node(n).key).collect(),
                reason,
                self_transition: reenter,
            };
            // §4.5 step 7: the transition is committed to the `transitions`
            // stream before any posted/scheduled side effects are drained
            // and before `maybe_mark_done` can close the stream on a final
            // leaf, so the terminal transition is always observable.
            self.transitions.set(transition.clone());
            self.maybe_mark_done(leaf_target);
            self.drain_side_effects(tctx.posted, tctx.scheduled);

            return Ok(transition);
        }
    }

    fn aborted(&self, source: StateKey, target: StateKey, exit_path: &[NodeId], entered: &[StateKey]) -> AbortedTransition {
        AbortedTransition {
            source,
            target,
            exited: exit_path.iter().map(|&n| self.tree.node(n).key).collect(),
            entered: entered.to_vec(),
        }
    }

    async fn rollback_entries(self: &Arc<Self>, entered: &[NodeId]) {
        // §4.5 step 5: a redirect (or failure) part-way through an enter
        // walk rolls back whatever already entered, deepest-first.
        for &node_id in entered.iter().rev() {
            let node = self.tree.node(node_id);
            if node.is_machine_leaf() {
                if let Some(handle) = self.nested.lock().remove(&node_id) {
                    handle.dispose().await;
                }
            }
            if let Some(handler) = node.on_exit.clone() {
                let transition = TransitionContext::new(None, HashMap::new());
                let ctx = EntryContext { node: node_id, key: node.key, transition, data: self.data_access(node_id) };
                let _ = invoke_entry(&node.filters, handler, ctx).await;
            }
            if node.is_data_state() {
                self.data.deactivate(node_id);
            }
            self.cancel_timers(node_id);
        }
    }

    /// Cleans up activation the current node performed (data, inner
    /// machine) when its own `on_enter` (or nested-done handling) fails or
    /// redirects before it counts as fully entered.
    async fn cleanup_partial_enter(self: &Arc<Self>, node_id: NodeId) {
        if let Some(handle) = self.nested.lock().remove(&node_id) {
            handle.dispose().await;
        }
        if self.tree.node(node_id).is_data_state() {
            self.data.deactivate(node_id);
        }
    }

    /// Records `node`'s history slice from `pre_exit_active_path` if `node`
    /// itself carries a [`History`] kind — a no-op for any other exiting
    /// node. `pre_exit_active_path` is nearest-first (`[leaf, ..., root]`),
    /// captured once before the exit walk began, so it still reflects the
    /// configuration `node` owned even though its descendants have already
    /// been exited by the time this runs.
    ///
    /// `Shallow` keeps only the single direct child that was active;
    /// `resolve_to_leaf` then falls through to the normal initial-child walk
    /// from there down, per `history.rs`'s documented contract. `Deep` keeps
    /// every descendant down to the leaf, so each nested level finds its own
    /// recorded child on restore.
    fn record_history(&self, node: NodeId, pre_exit_active_path: &[NodeId]) {
        let Some(kind) = self.history.lock().get(&node).copied() else {
            return;
        };
        let Some(idx) = pre_exit_active_path.iter().position(|&n| n == node) else {
            return;
        };
        let mut state = self.history_state.lock();
        let entry = state.entry(node).or_default();
        match kind {
            History::Shallow => {
                if let Some(&direct_child) = idx.checked_sub(1).and_then(|i| pre_exit_active_path.get(i)) {
                    entry.record([direct_child]);
                }
            }
            History::Deep => {
                entry.record(pre_exit_active_path[..idx].iter().copied());
            }
        }
    }

    /// Descends from `node` through initial children (honoring a recorded
    /// history state if one exists) until a leaf is reached. Returns the
    /// leaf and the full descent path including `node` itself.
    fn resolve_to_leaf(&self, node: NodeId) -> Result<(NodeId, Vec<NodeId>), GearboxError> {
        let mut path = vec![node];
        let mut current = node;
        loop {
            let n = self.tree.node(current);
            if n.kind.is_leaf() {
                return Ok((current, path));
            }
            let next = if let Some(history_state) = self.history_state.lock().get(&current) {
                n.children.iter().copied().find(|c| history_state.contains(*c))
            } else {
                None
            };
            let next = match next {
                Some(n) => n,
                None => match &n.initial_child {
                    Some(InitialChild::Static(key)) => self
                        .tree
                        .find(*key)
                        .ok_or(GearboxError::Definition(crate::error::DefinitionError::UnknownTarget(*key)))?,
                    Some(InitialChild::Dynamic(resolver)) => {
                        let key = resolver();
                        self.tree.find(key).ok_or(GearboxError::Definition(crate::error::DefinitionError::UnknownTarget(key)))?
                    }
                    None => return Err(GearboxError::NoActiveState),
                },
            };
            path.push(next);
            current = next;
        }
    }

    async fn exit_node(self: &Arc<Self>, node_id: NodeId, mut tctx: TransitionContext) -> Result<TransitionContext, GearboxError> {
        let node = self.tree.node(node_id);
        if node.is_machine_leaf() {
            if let Some(handle) = self.nested.lock().remove(&node_id) {
                handle.dispose().await;
            }
        }
        if let Some(handler) = node.on_exit.clone() {
            tctx.record(node.key, Phase::Exit);
            let ctx = EntryContext { node: node_id, key: node.key, transition: tctx, data: self.data_access(node_id) };
            let (ctx, result) = invoke_entry(&node.filters, handler, ctx).await;
            tctx = ctx.transition;
            if let Err(err) = result {
                error!(machine_label = %self.label, key = %node.key, error = %err, "on_exit handler failed");
                return Err(err);
            }
        }
        if node.is_data_state() {
            self.data.deactivate(node_id);
        }
        Ok(tctx)
    }

    async fn enter_node(
        self: &Arc<Self>,
        node_id: NodeId,
        mut tctx: TransitionContext,
        node_payload: Option<AnyValue>,
    ) -> Result<TransitionContext, (TransitionContext, Outcome)> {
        let node = self.tree.node(node_id);

        if node.is_data_state() {
            if let Some(factory) = &node.data_factory {
                let value = factory(node_payload.clone());
                self.data.activate_any(node_id, node.key, value);
            }
        }

        if node.is_machine_leaf() {
            if let Some(factory) = node.machine_factory.clone() {
                let machine = factory();
                let handle = NestedHandle::new(machine);
                if let Err(err) = handle.machine.start().await {
                    if node.is_data_state() {
                        self.data.deactivate(node_id);
                    }
                    return Err((tctx, Outcome::Error(err)));
                }
                let already_done = handle.machine.is_done();
                let inner_final = handle.machine.current_state().key();
                self.nested.lock().insert(node_id, handle);
                // A nested machine whose initial descent already lands on a
                // final leaf is "done" before any message reaches it.
                if already_done {
                    if let Some(on_done) = node.on_machine_done.clone() {
                        if let Some(target) = decision_target(&on_done(inner_final), node.key) {
                            self.cleanup_partial_enter(node_id).await;
                            return Err((tctx, Outcome::Redirect(target)));
                        }
                    }
                }
            }
        }

        if let Some(handler) = node.on_enter.clone() {
            tctx.payload = node_payload;
            tctx.record(node.key, Phase::Enter);
            let ctx = EntryContext { node: node_id, key: node.key, transition: tctx, data: self.data_access(node_id) };
            let (ctx, result) = invoke_entry(&node.filters, handler, ctx).await;
            tctx = ctx.transition;
            if let Some(redirect) = tctx.redirect.take() {
                self.cleanup_partial_enter(node_id).await;
                return Err((tctx, Outcome::Redirect(redirect)));
            }
            if let Err(err) = result {
                error!(machine_label = %self.label, key = %node.key, error = %err, "on_enter handler failed");
                self.cleanup_partial_enter(node_id).await;
                return Err((tctx, Outcome::Error(err)));
            }
        }
        Ok(tctx)
    }

    /// Installs an already-active path and data values directly, bypassing
    /// `on_enter` (§6 "Persisted state layout": restoring a snapshot does
    /// not re-run entry side effects — see DESIGN.md).
    pub(crate) fn restore_path(&self, path: Vec<NodeId>, data: Vec<(NodeId, AnyValue)>) {
        for (node, value) in data {
            let key = self.tree.node(node).key;
            self.data.activate_any(node, key, value);
        }
        let leaf = *path.last().expect("a restored snapshot must name at least the root");
        {
            let mut active = self.active.write();
            active.leaf = Some(leaf);
            active.ancestors = self.tree.ancestors(leaf);
        }
        self.maybe_mark_done(leaf);
    }

    fn maybe_mark_done(&self, leaf: NodeId) {
        if self.tree.node(leaf).is_final() {
            self.done.store(true, Ordering::SeqCst);
            self.transitions.close();
        }
    }
}

enum Outcome {
    Redirect(StateKey),
    Error(GearboxError),
}

fn entered_keys(engine: &Engine, entered: &[NodeId]) -> Vec<StateKey> {
    entered.iter().map(|&n| engine.tree.node(n).key).collect()
}

/// §4.5 "must produce a go-to decision": extracts the target a nested-done
/// handler asked for. `Stay`/`Unhandled` are a contract violation (the inner
/// machine is done and the outer state cannot simply stay); they are logged
/// and otherwise ignored rather than treated as fatal.
fn decision_target(decision: &Decision, self_key: StateKey) -> Option<StateKey> {
    match decision {
        Decision::GoTo { target, .. } => Some(*target),
        Decision::GoToSelf { .. } => Some(self_key),
        Decision::Stay | Decision::Unhandled => {
            warn!(key = %self_key, "on_machine_done handler did not produce a go-to decision");
            None
        }
    }
}

async fn invoke_message(filters: &[Arc<dyn crate::context::Filter>], handler: crate::context::MessageHandler, ctx: MessageContext) -> MessageContext {
    let mut chain: NextMessage = Arc::new(move |ctx| handler(ctx));
    for filter in filters.iter().rev() {
        let filter = filter.clone();
        let inner = chain.clone();
        chain = Arc::new(move |ctx| filter.wrap_message(ctx, inner.clone()));
    }
    chain(ctx).await
}

async fn invoke_entry(
    filters: &[Arc<dyn crate::context::Filter>],
    handler: crate::context::EnterHandler,
    ctx: EntryContext,
) -> (EntryContext, Result<(), GearboxError>) {
    let mut chain: NextEntry = Arc::new(move |ctx| handler(ctx));
    for filter in filters.iter().rev() {
        let filter = filter.clone();
        let inner = chain.clone();
        chain = Arc::new(move |ctx| filter.wrap_entry(ctx, inner.clone()));
    }
    chain(ctx).await
}
