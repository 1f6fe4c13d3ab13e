//! The transition context (C3) and message context (C4): the scratchpads
//! handlers see. Handlers are modeled as the "capability" described in the
//! spec's design notes §9 — a value that may already be ready or require
//! awaiting. Concretely, every handler takes its context *by value* and
//! returns it (plus whatever result) inside a boxed future; this sidesteps
//! the reference-lifetime gymnastics that `Fn(&mut Ctx) -> BoxFuture<'_, _>`
//! would otherwise require, at the cost of an extra move per call — a trade
//! the teacher's own async story (`TransitionActions`/`On<Transition<T>>`
//! running to completion before the next system sees the world) already
//! makes implicitly by processing each lifecycle phase one event at a time.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::data::DataRegistry;
use crate::error::GearboxError;
use crate::key::StateKey;
use crate::tree::NodeId;

pub type AnyValue = Arc<dyn Any + Send + Sync>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub fn boxed_value<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

pub fn downcast<T: 'static>(value: &AnyValue) -> Option<&T> {
    value.downcast_ref::<T>()
}

/// Why a transition happened (part of the immutable Transition record, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    ExternalMessage,
    Redirect,
    Initial,
    ExternalStop,
    NestedDone,
}

/// A step recorded in the transition context's visited log (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enter,
    Exit,
}

#[derive(Clone)]
pub struct Visited {
    pub key: StateKey,
    pub phase: Phase,
}

/// A timer armed via `schedule` (§4.5 "Timers/scheduling").
#[derive(Clone)]
pub struct ScheduledTimer {
    pub produce: Arc<dyn Fn() -> AnyValue + Send + Sync>,
    pub delay: Duration,
    pub periodic: bool,
}

impl fmt::Debug for ScheduledTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTimer").field("delay", &self.delay).field("periodic", &self.periodic).finish()
    }
}

/// C3: the per-transition scratchpad accumulating payload, metadata,
/// redirect target, posted messages, scheduled timers, and the visited log.
#[derive(Default, Clone)]
pub struct TransitionContext {
    pub payload: Option<AnyValue>,
    pub metadata: HashMap<String, AnyValue>,
    pub redirect: Option<StateKey>,
    pub posted: VecDeque<AnyValue>,
    pub scheduled: Vec<ScheduledTimer>,
    pub visited: Vec<Visited>,
}

impl TransitionContext {
    pub fn new(payload: Option<AnyValue>, metadata: HashMap<String, AnyValue>) -> Self {
        Self { payload, metadata, redirect: None, posted: VecDeque::new(), scheduled: Vec::new(), visited: Vec::new() }
    }

    /// Called by an on-enter handler that cannot be entered; see §4.5 step 5.
    pub fn redirect_to(&mut self, target: StateKey) {
        self.redirect = Some(target);
    }

    pub fn record(&mut self, key: StateKey, phase: Phase) {
        self.visited.push(Visited { key, phase });
    }

    pub fn payload_as<P: 'static>(&self) -> Option<&P> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<P>())
    }
}

/// Owned alongside a context, giving handlers typed access to the currently
/// entering/exiting/active state's data and its ancestors' data (§4.2).
#[derive(Clone)]
pub struct DataAccess {
    pub(crate) registry: Arc<DataRegistry>,
    pub(crate) node: NodeId,
    /// Nearest-first: `node`, its parent, ... , root.
    pub(crate) ancestors: Vec<NodeId>,
}

impl DataAccess {
    pub fn read<D: Clone + Send + Sync + 'static>(&self) -> Result<D, GearboxError> {
        self.registry.read(self.node)
    }

    pub fn read_at<D: Clone + Send + Sync + 'static>(&self, node: NodeId) -> Result<D, GearboxError> {
        self.registry.read(node)
    }

    pub fn update<D, F>(&self, f: F) -> Result<(), GearboxError>
    where
        D: Clone + Send + Sync + 'static,
        F: FnOnce(D) -> D,
    {
        self.registry.update(self.node, f)
    }

    pub fn replace<D: Clone + Send + Sync + 'static>(&self, value: D) -> Result<(), GearboxError> {
        self.registry.replace(self.node, value)
    }

    pub fn find_ancestor<D: Clone + Send + Sync + 'static>(&self) -> Option<D> {
        self.registry.find_ancestor(self.ancestors.iter().copied())
    }
}

/// C3 entry point for on-enter/on-exit/transition-action handlers: the
/// transition scratchpad plus data access scoped to the node being
/// entered or exited.
pub struct EntryContext {
    pub node: NodeId,
    pub key: StateKey,
    pub transition: TransitionContext,
    pub data: DataAccess,
}

pub type EnterHandler = Arc<dyn Fn(EntryContext) -> BoxFuture<(EntryContext, Result<(), GearboxError>)> + Send + Sync>;
pub type TransitionActionHandler = EnterHandler;

/// A node's `on_message` handler (§4.4): takes the context by value, settles
/// a [`Decision`] on it via `go_to`/`go_to_self`/`stay`/`unhandled`, and
/// hands the same context back.
pub type MessageHandler = Arc<dyn Fn(MessageContext) -> BoxFuture<MessageContext> + Send + Sync>;

/// What a message handler decided (§4.4). Exactly one of these is produced
/// per handler invocation; the engine treats a handler that sets none of
/// them as `Unhandled` and one that sets more than one as `MultipleDecisions`.
pub enum Decision {
    GoTo {
        target: StateKey,
        payload: Option<AnyValue>,
        metadata: HashMap<String, AnyValue>,
        reenter: bool,
        transition_action: Option<TransitionActionHandler>,
    },
    GoToSelf {
        payload: Option<AnyValue>,
        metadata: HashMap<String, AnyValue>,
        transition_action: Option<TransitionActionHandler>,
    },
    Stay,
    Unhandled,
}

impl fmt::Debug for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::GoTo { target, reenter, .. } => write!(f, "GoTo({target:?}, reenter={reenter})"),
            Decision::GoToSelf { .. } => write!(f, "GoToSelf"),
            Decision::Stay => write!(f, "Stay"),
            Decision::Unhandled => write!(f, "Unhandled"),
        }
    }
}

/// C4: the only object a message handler sees.
pub struct MessageContext {
    pub handling_node: NodeId,
    pub handling_key: StateKey,
    message: AnyValue,
    message_type: TypeId,
    data: DataAccess,
    decision: Option<Decision>,
    duplicate_decision: bool,
    posted: VecDeque<AnyValue>,
    scheduled: Vec<ScheduledTimer>,
}

impl MessageContext {
    pub fn new(handling_node: NodeId, handling_key: StateKey, message: AnyValue, message_type: TypeId, data: DataAccess) -> Self {
        Self {
            handling_node,
            handling_key,
            message,
            message_type,
            data,
            decision: None,
            duplicate_decision: false,
            posted: VecDeque::new(),
            scheduled: Vec::new(),
        }
    }

    pub fn message_type(&self) -> TypeId {
        self.message_type
    }

    /// Typed message access; fails if the posted message is not an `M`.
    pub fn as_message<M: 'static>(&self) -> Result<&M, GearboxError> {
        self.message.downcast_ref::<M>().ok_or(GearboxError::WrongMessageType { handler: self.handling_key })
    }

    pub fn data<D: Clone + Send + Sync + 'static>(&self) -> Result<D, GearboxError> {
        self.data.read()
    }

    pub fn find_data<D: Clone + Send + Sync + 'static>(&self) -> Option<D> {
        self.data.find_ancestor()
    }

    pub fn update_data<D, F>(&self, f: F) -> Result<(), GearboxError>
    where
        D: Clone + Send + Sync + 'static,
        F: FnOnce(D) -> D,
    {
        self.data.update(f)
    }

    pub fn replace_data<D: Clone + Send + Sync + 'static>(&self, value: D) -> Result<(), GearboxError> {
        self.data.replace(value)
    }

    fn set_decision(&mut self, decision: Decision) {
        if self.decision.is_some() {
            self.duplicate_decision = true;
        } else {
            self.decision = Some(decision);
        }
    }

    pub fn go_to(&mut self, target: StateKey) -> GoToBuilder<'_> {
        GoToBuilder { ctx: self, target, payload: None, metadata: HashMap::new(), reenter: false, transition_action: None }
    }

    /// Sugar over `go_to(target).payload(data)` that pins `D` at the call
    /// site: the GLOSSARY "Channel" contract, letting an entry point declare
    /// the payload type it requires so a mismatch is a compile error here
    /// rather than a runtime `WrongDataType` when the destination reads it.
    pub fn go_to_channel<D: Send + Sync + 'static>(&mut self, target: StateKey, data: D) -> GoToBuilder<'_> {
        self.go_to(target).payload(data)
    }

    pub fn go_to_self(&mut self) {
        self.set_decision(Decision::GoToSelf { payload: None, metadata: HashMap::new(), transition_action: None });
    }

    pub fn stay(&mut self) {
        self.set_decision(Decision::Stay);
    }

    pub fn unhandled(&mut self) {
        self.set_decision(Decision::Unhandled);
    }

    pub fn post<M: Send + Sync + 'static>(&mut self, message: M) {
        self.posted.push_back(boxed_value(message));
    }

    pub fn schedule<F, M>(&mut self, produce: F, delay: Duration, periodic: bool)
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Send + Sync + 'static,
    {
        self.scheduled.push(ScheduledTimer { produce: Arc::new(move || boxed_value(produce())), delay, periodic });
    }

    /// Consumes this context, returning the decision it settled on (or
    /// [`GearboxError::MultipleDecisions`]) together with whatever was
    /// posted/scheduled regardless of that decision.
    pub fn finish(self) -> Result<(Decision, VecDeque<AnyValue>, Vec<ScheduledTimer>), GearboxError> {
        if self.duplicate_decision {
            return Err(GearboxError::MultipleDecisions);
        }
        Ok((self.decision.unwrap_or(Decision::Unhandled), self.posted, self.scheduled))
    }
}

/// Fluent builder returned by [`MessageContext::go_to`].
pub struct GoToBuilder<'a> {
    ctx: &'a mut MessageContext,
    target: StateKey,
    payload: Option<AnyValue>,
    metadata: HashMap<String, AnyValue>,
    reenter: bool,
    transition_action: Option<TransitionActionHandler>,
}

impl<'a> GoToBuilder<'a> {
    pub fn payload<P: Send + Sync + 'static>(mut self, payload: P) -> Self {
        self.payload = Some(boxed_value(payload));
        self
    }

    pub fn metadata<P: Send + Sync + 'static>(mut self, key: impl Into<String>, value: P) -> Self {
        self.metadata.insert(key.into(), boxed_value(value));
        self
    }

    pub fn reenter(mut self, reenter: bool) -> Self {
        self.reenter = reenter;
        self
    }

    pub fn action(mut self, action: TransitionActionHandler) -> Self {
        self.transition_action = Some(action);
        self
    }

    /// Commits the decision. Takes `self` by value so the builder cannot be
    /// reused to (accidentally) fire a second decision.
    pub fn commit(self) {
        self.ctx.set_decision(Decision::GoTo {
            target: self.target,
            payload: self.payload,
            metadata: self.metadata,
            reenter: self.reenter,
            transition_action: self.transition_action,
        });
    }
}

/// Filters (§4.4 "Filters") wrap message and entry (enter/exit) handlers in
/// declaration order, outermost first. Filters never wrap the
/// `transition_action` of a `go_to` (Open Question, resolved in DESIGN.md).
pub type NextMessage = Arc<dyn Fn(MessageContext) -> BoxFuture<MessageContext> + Send + Sync>;
pub type NextEntry = Arc<dyn Fn(EntryContext) -> BoxFuture<(EntryContext, Result<(), GearboxError>)> + Send + Sync>;

pub trait Filter: Send + Sync {
    fn wrap_message(&self, ctx: MessageContext, next: NextMessage) -> BoxFuture<MessageContext> {
        next(ctx)
    }

    fn wrap_entry(&self, ctx: EntryContext, next: NextEntry) -> BoxFuture<(EntryContext, Result<(), GearboxError>)> {
        next(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(node: NodeId, key: StateKey, msg: u32) -> MessageContext {
        let registry = Arc::new(DataRegistry::new());
        let access = DataAccess { registry, node, ancestors: vec![node] };
        MessageContext::new(node, key, boxed_value(msg), TypeId::of::<u32>(), access)
    }

    #[test]
    fn second_decision_is_flagged() {
        let mut map: slotmap::SlotMap<NodeId, ()> = slotmap::SlotMap::with_key();
        let node = map.insert(());
        let mut ctx = ctx_with(node, StateKey::new("s"), 1);
        ctx.stay();
        ctx.unhandled();
        assert!(matches!(ctx.finish(), Err(GearboxError::MultipleDecisions)));
    }

    #[test]
    fn no_decision_defaults_to_unhandled() {
        let mut map: slotmap::SlotMap<NodeId, ()> = slotmap::SlotMap::with_key();
        let node = map.insert(());
        let ctx = ctx_with(node, StateKey::new("s"), 1);
        let (decision, _, _) = ctx.finish().unwrap();
        assert!(matches!(decision, Decision::Unhandled));
    }
}
