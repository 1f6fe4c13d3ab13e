//! The state tree (C1): an arena of nodes connected by parent/child edges,
//! built once at construction time and immutable for the life of the
//! machine. Nodes are addressed by [`NodeId`], a `slotmap` key, rather than
//! by the ECS `Entity` the teacher used for the same purpose — the tree
//! here is a private arena owned by one `Machine`, not a component spread
//! across a shared `World`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use slotmap::SlotMap;

use crate::codec::Codec;
use crate::context::{AnyValue, EnterHandler, Filter, MessageHandler};
use crate::error::DefinitionError;
use crate::key::StateKey;
use crate::nested::{MachineFactory, NestedDoneHandler};

slotmap::new_key_type! {
    pub struct NodeId;
}

/// What role a node plays in the tree (§2 "state kinds").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Interior,
    Leaf,
    FinalLeaf,
    MachineLeaf,
}

impl NodeKind {
    pub fn may_have_children(self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Interior)
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::Leaf | NodeKind::FinalLeaf | NodeKind::MachineLeaf)
    }
}

/// How a composite state's initial child is chosen (§4.1).
#[derive(Clone)]
pub enum InitialChild {
    Static(StateKey),
    Dynamic(Arc<dyn Fn() -> StateKey + Send + Sync>),
}

impl InitialChild {
    fn hint_key(&self) -> Option<StateKey> {
        match self {
            InitialChild::Static(key) => Some(*key),
            InitialChild::Dynamic(_) => None,
        }
    }
}

/// A fully validated node, as stored in the arena. Constructed only by
/// [`Tree::build`] from a [`NodeSpec`].
pub struct Node {
    pub id: NodeId,
    pub key: StateKey,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub initial_child: Option<InitialChild>,
    pub data_factory: Option<Arc<dyn Fn(Option<AnyValue>) -> AnyValue + Send + Sync>>,
    pub on_enter: Option<EnterHandler>,
    pub on_exit: Option<EnterHandler>,
    pub message_handler: Option<MessageHandler>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub machine_factory: Option<MachineFactory>,
    pub codec: Option<Arc<dyn Codec>>,
    /// §4.5 "Nested machine state": whether messages the outer chain
    /// dispatches to this leaf are forwarded to the inner machine. Only
    /// meaningful when `machine_factory` is set.
    pub forward_messages: bool,
    /// §4.5 "On done or disposed, invoke the corresponding outer handler,
    /// which must produce a go-to decision."
    pub on_machine_done: Option<NestedDoneHandler>,
}

impl Node {
    pub fn is_final(&self) -> bool {
        self.kind == NodeKind::FinalLeaf
    }

    pub fn is_machine_leaf(&self) -> bool {
        self.kind == NodeKind::MachineLeaf
    }

    pub fn is_data_state(&self) -> bool {
        self.key.is_data_typed()
    }
}

/// The unvalidated description of one state, as assembled by a tree
/// builder (§4.1). `parent == None` marks the single root.
pub struct NodeSpec {
    pub key: StateKey,
    pub kind: NodeKind,
    pub parent: Option<StateKey>,
    pub initial_child: Option<InitialChild>,
    pub data_factory: Option<Arc<dyn Fn(Option<AnyValue>) -> AnyValue + Send + Sync>>,
    pub on_enter: Option<EnterHandler>,
    pub on_exit: Option<EnterHandler>,
    pub message_handler: Option<MessageHandler>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub machine_factory: Option<MachineFactory>,
    pub codec: Option<Arc<dyn Codec>>,
    pub forward_messages: bool,
    pub on_machine_done: Option<NestedDoneHandler>,
}

impl NodeSpec {
    pub fn new(key: StateKey, kind: NodeKind, parent: Option<StateKey>) -> Self {
        Self {
            key,
            kind,
            parent,
            initial_child: None,
            data_factory: None,
            on_enter: None,
            on_exit: None,
            message_handler: None,
            filters: Vec::new(),
            machine_factory: None,
            codec: None,
            forward_messages: true,
            on_machine_done: None,
        }
    }
}

/// The validated, immutable state tree.
pub struct Tree {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
    by_key: HashMap<StateKey, NodeId>,
}

impl Tree {
    /// Validates and assembles a tree from its node specs (§4.1). Every
    /// `DefinitionError` variant named in the spec is raised exactly here.
    pub fn build(specs: Vec<NodeSpec>) -> Result<Tree, DefinitionError> {
        let mut by_key_spec: HashMap<StateKey, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if by_key_spec.insert(spec.key, i).is_some() {
                return Err(DefinitionError::DuplicateKey(spec.key));
            }
        }

        let roots: Vec<usize> = specs.iter().enumerate().filter(|(_, s)| s.parent.is_none()).map(|(i, _)| i).collect();
        if roots.len() != 1 {
            return Err(DefinitionError::NoSingleRoot);
        }

        for spec in &specs {
            if let Some(parent_key) = spec.parent {
                if !by_key_spec.contains_key(&parent_key) {
                    return Err(DefinitionError::UnknownTarget(parent_key));
                }
            }
            if !spec.kind.may_have_children() {
                if let Some(initial) = &spec.initial_child {
                    if let Some(hint) = initial.hint_key() {
                        return Err(DefinitionError::InitialChildNotDescendant { parent: spec.key, child: hint });
                    }
                }
            }
        }

        let mut nodes: SlotMap<NodeId, Node> = SlotMap::with_key();
        let mut by_key = HashMap::with_capacity(specs.len());
        let mut ids_by_spec_index = Vec::with_capacity(specs.len());

        for spec in &specs {
            let id = nodes.insert(Node {
                id: NodeId::default(),
                key: spec.key,
                kind: spec.kind,
                parent: None,
                children: Vec::new(),
                initial_child: None,
                data_factory: None,
                on_enter: None,
                on_exit: None,
                message_handler: None,
                filters: Vec::new(),
                machine_factory: None,
                codec: None,
                forward_messages: true,
                on_machine_done: None,
            });
            nodes[id].id = id;
            by_key.insert(spec.key, id);
            ids_by_spec_index.push(id);
        }

        for (i, spec) in specs.into_iter().enumerate() {
            let id = ids_by_spec_index[i];
            let parent = spec.parent.map(|k| by_key[&k]);
            if let Some(parent_id) = parent {
                nodes[parent_id].children.push(id);
            }
            let node = &mut nodes[id];
            node.parent = parent;
            node.initial_child = spec.initial_child;
            node.data_factory = spec.data_factory;
            node.on_enter = spec.on_enter;
            node.on_exit = spec.on_exit;
            node.message_handler = spec.message_handler;
            node.filters = spec.filters;
            node.machine_factory = spec.machine_factory;
            node.codec = spec.codec;
            node.forward_messages = spec.forward_messages;
            node.on_machine_done = spec.on_machine_done;
        }

        let root = by_key[&specs_root_key(&nodes, roots[0], &ids_by_spec_index)];

        for (&key, &id) in &by_key {
            let node = &nodes[id];
            if node.kind == NodeKind::FinalLeaf && !node.children.is_empty() {
                return Err(DefinitionError::FinalStateWithChildren(key));
            }
            if node.kind == NodeKind::MachineLeaf && !node.children.is_empty() {
                return Err(DefinitionError::MachineStateWithChildren(key));
            }
            if node.kind.may_have_children() {
                match &node.initial_child {
                    None => return Err(DefinitionError::MissingInitialChild(key)),
                    Some(InitialChild::Static(target)) => {
                        let target_id = *by_key.get(target).ok_or(DefinitionError::UnknownTarget(*target))?;
                        if !is_strict_descendant(&nodes, id, target_id) {
                            return Err(DefinitionError::InitialChildNotDescendant { parent: key, child: *target });
                        }
                    }
                    Some(InitialChild::Dynamic(_)) => {}
                }
            }
        }

        detect_cycle(&nodes, root)?;

        Ok(Tree { nodes, root, by_key })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn find(&self, key: StateKey) -> Option<NodeId> {
        self.by_key.get(&key).copied()
    }

    /// Looks a node up by its key's name alone, ignoring any data-type tag.
    /// Used by snapshot restoration (§6), where a persisted entry carries
    /// only the state's name, not its `TypeId`.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_key.iter().find(|(key, _)| key.name() == name).map(|(_, &id)| id)
    }

    /// Nearest-first ancestor chain including `node` itself.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = vec![node];
        let mut current = node;
        while let Some(parent) = self.nodes[current].parent {
            out.push(parent);
            current = parent;
        }
        out
    }

    /// Root-first path including `node` itself.
    pub fn path_from_root(&self, node: NodeId) -> Vec<NodeId> {
        let mut chain = self.ancestors(node);
        chain.reverse();
        chain
    }

    pub fn is_descendant(&self, ancestor: NodeId, node: NodeId) -> bool {
        is_strict_descendant(&self.nodes, ancestor, node) || ancestor == node
    }

    /// The least common ancestor of two nodes (§4.3): the deepest node that
    /// is an ancestor of (or equal to) both.
    pub fn lca(&self, a: NodeId, b: NodeId) -> NodeId {
        let a_chain: HashSet<NodeId> = self.ancestors(a).into_iter().collect();
        let mut current = b;
        loop {
            if a_chain.contains(&current) {
                return current;
            }
            current = self.nodes[current].parent.expect("root is common ancestor of every node");
        }
    }

    /// Pre-order traversal of `node` and all of its descendants.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            for &child in self.nodes[current].children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    pub fn leaves_under(&self, node: NodeId) -> Vec<NodeId> {
        self.descendants(node).into_iter().filter(|&n| self.nodes[n].kind.is_leaf()).collect()
    }
}

fn specs_root_key<'a>(nodes: &'a SlotMap<NodeId, Node>, root_spec_index: usize, ids_by_spec_index: &'a [NodeId]) -> StateKey {
    nodes[ids_by_spec_index[root_spec_index]].key
}

fn is_strict_descendant(nodes: &SlotMap<NodeId, Node>, ancestor: NodeId, node: NodeId) -> bool {
    let mut current = node;
    while let Some(parent) = nodes[current].parent {
        if parent == ancestor {
            return true;
        }
        current = parent;
    }
    false
}

fn detect_cycle(nodes: &SlotMap<NodeId, Node>, root: NodeId) -> Result<(), DefinitionError> {
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            return Err(DefinitionError::Cycle(nodes[id].key));
        }
        stack.extend(nodes[id].children.iter().copied());
    }
    if visited.len() != nodes.len() {
        for id in nodes.keys() {
            if !visited.contains(&id) {
                return Err(DefinitionError::Cycle(nodes[id].key));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &'static str, parent: &'static str) -> NodeSpec {
        NodeSpec::new(StateKey::new(key), NodeKind::Leaf, Some(StateKey::new(parent)))
    }

    #[test]
    fn builds_minimal_two_level_tree() {
        let specs = vec![
            {
                let mut s = NodeSpec::new(StateKey::new("root"), NodeKind::Root, None);
                s.initial_child = Some(InitialChild::Static(StateKey::new("a")));
                s
            },
            leaf("a", "root"),
            leaf("b", "root"),
        ];
        let tree = Tree::build(specs).unwrap();
        let root = tree.root();
        assert_eq!(tree.node(root).key, StateKey::new("root"));
        let a = tree.find(StateKey::new("a")).unwrap();
        let b = tree.find(StateKey::new("b")).unwrap();
        assert_eq!(tree.lca(a, b), root);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let specs = vec![
            {
                let mut s = NodeSpec::new(StateKey::new("root"), NodeKind::Root, None);
                s.initial_child = Some(InitialChild::Static(StateKey::new("a")));
                s
            },
            leaf("a", "root"),
            leaf("a", "root"),
        ];
        assert!(matches!(Tree::build(specs), Err(DefinitionError::DuplicateKey(_))));
    }

    #[test]
    fn missing_initial_child_is_rejected() {
        let specs = vec![NodeSpec::new(StateKey::new("root"), NodeKind::Root, None), leaf("a", "root")];
        assert!(matches!(Tree::build(specs), Err(DefinitionError::MissingInitialChild(_))));
    }

    #[test]
    fn final_state_with_children_is_rejected() {
        let specs = vec![
            {
                let mut s = NodeSpec::new(StateKey::new("root"), NodeKind::Root, None);
                s.initial_child = Some(InitialChild::Static(StateKey::new("done")));
                s
            },
            NodeSpec::new(StateKey::new("done"), NodeKind::FinalLeaf, Some(StateKey::new("root"))),
            leaf("stray", "done"),
        ];
        assert!(matches!(Tree::build(specs), Err(DefinitionError::FinalStateWithChildren(_))));
    }
}
