//! A minimal, imperative tree-assembly helper. The spec explicitly puts a
//! declarative builder DSL out of scope (§1 Non-goals); this is just enough
//! surface for the engine's own tests and for callers willing to construct
//! `NodeSpec`s directly to wire up a tree without hand-rolling the arena.

use std::sync::Arc;

use crate::codec::Codec;
use crate::context::{AnyValue, EnterHandler, Filter, MessageHandler};
use crate::error::DefinitionError;
use crate::key::StateKey;
use crate::nested::{MachineFactory, NestedDoneHandler};
use crate::tree::{InitialChild, NodeKind, NodeSpec, Tree};

pub struct TreeBuilder {
    specs: Vec<NodeSpec>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self { specs: Vec::new() }
    }

    pub fn add_root(&mut self, key: StateKey, initial_child: StateKey) -> &mut NodeSpec {
        let mut spec = NodeSpec::new(key, NodeKind::Root, None);
        spec.initial_child = Some(InitialChild::Static(initial_child));
        self.specs.push(spec);
        self.specs.last_mut().unwrap()
    }

    pub fn add(&mut self, key: StateKey, kind: NodeKind, parent: StateKey) -> &mut NodeSpec {
        self.specs.push(NodeSpec::new(key, kind, Some(parent)));
        self.specs.last_mut().unwrap()
    }

    pub fn add_interior(&mut self, key: StateKey, parent: StateKey, initial_child: StateKey) -> &mut NodeSpec {
        let spec = self.add(key, NodeKind::Interior, parent);
        spec.initial_child = Some(InitialChild::Static(initial_child));
        self.specs.last_mut().unwrap()
    }

    pub fn build(self) -> Result<Tree, DefinitionError> {
        Tree::build(self.specs)
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience setters mirroring the fields of [`NodeSpec`], usable via the
/// `&mut NodeSpec` returned by the `add*` methods above.
pub trait NodeSpecExt {
    fn on_enter(&mut self, handler: EnterHandler) -> &mut Self;
    fn on_exit(&mut self, handler: EnterHandler) -> &mut Self;
    fn on_message(&mut self, handler: MessageHandler) -> &mut Self;
    fn filter(&mut self, filter: Arc<dyn Filter>) -> &mut Self;
    fn data(&mut self, factory: Arc<dyn Fn(Option<AnyValue>) -> AnyValue + Send + Sync>) -> &mut Self;
    fn dynamic_initial_child(&mut self, resolver: Arc<dyn Fn() -> StateKey + Send + Sync>) -> &mut Self;
    fn nested_machine(&mut self, factory: MachineFactory) -> &mut Self;
    fn codec(&mut self, codec: Arc<dyn Codec>) -> &mut Self;
    /// §4.5: disable automatic message forwarding to the inner machine.
    fn forward_messages(&mut self, forward: bool) -> &mut Self;
    fn on_machine_done(&mut self, handler: NestedDoneHandler) -> &mut Self;
}

impl NodeSpecExt for NodeSpec {
    fn on_enter(&mut self, handler: EnterHandler) -> &mut Self {
        self.on_enter = Some(handler);
        self
    }

    fn on_exit(&mut self, handler: EnterHandler) -> &mut Self {
        self.on_exit = Some(handler);
        self
    }

    fn on_message(&mut self, handler: MessageHandler) -> &mut Self {
        self.message_handler = Some(handler);
        self
    }

    fn filter(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    fn data(&mut self, factory: Arc<dyn Fn(Option<AnyValue>) -> AnyValue + Send + Sync>) -> &mut Self {
        self.data_factory = Some(factory);
        self
    }

    fn dynamic_initial_child(&mut self, resolver: Arc<dyn Fn() -> StateKey + Send + Sync>) -> &mut Self {
        self.initial_child = Some(InitialChild::Dynamic(resolver));
        self
    }

    fn nested_machine(&mut self, factory: MachineFactory) -> &mut Self {
        self.machine_factory = Some(factory);
        self
    }

    fn codec(&mut self, codec: Arc<dyn Codec>) -> &mut Self {
        self.codec = Some(codec);
        self
    }

    fn forward_messages(&mut self, forward: bool) -> &mut Self {
        self.forward_messages = forward;
        self
    }

    fn on_machine_done(&mut self, handler: NestedDoneHandler) -> &mut Self {
        self.on_machine_done = Some(handler);
        self
    }
}
