use crate::key::StateKey;
use std::sync::Arc;

/// Validation failures raised by [`crate::tree::TreeBuilder::build_or_fail`] (§4.1).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DefinitionError {
    #[error("transition target {0:?} does not refer to a defined state")]
    UnknownTarget(StateKey),
    #[error("state {0:?} is an interior/root node with no initial child")]
    MissingInitialChild(StateKey),
    #[error("initial child of {parent:?} ({child:?}) is not a descendant of it")]
    InitialChildNotDescendant { parent: StateKey, child: StateKey },
    #[error("state tree contains a cycle reachable from {0:?}")]
    Cycle(StateKey),
    #[error("duplicate state key {0:?}")]
    DuplicateKey(StateKey),
    #[error("final state {0:?} may not have children")]
    FinalStateWithChildren(StateKey),
    #[error("machine-leaf state {0:?} may not have children")]
    MachineStateWithChildren(StateKey),
    #[error("state {0:?} disagrees with its parent's recorded children")]
    ParentMismatch(StateKey),
    #[error("tree has no root, or more than one root")]
    NoSingleRoot,
    #[error("non-root state {0:?} has no parent")]
    MissingParent(StateKey),
}

/// All errors the engine can raise (§7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum GearboxError {
    #[error("tree definition is invalid: {0}")]
    Definition(#[from] DefinitionError),

    #[error("message delivered to {handler:?} is not of the expected type")]
    WrongMessageType { handler: StateKey },

    #[error("no active state for this operation")]
    NoActiveState,

    #[error("no active data state for key {0:?}")]
    NoSuchDataState(StateKey),

    #[error("data state {key:?} was exited before this access completed")]
    StateExited { key: StateKey },

    #[error("data stored under {key:?} does not have the requested type")]
    WrongDataType { key: StateKey },

    #[error("redirect cycle detected while entering {target:?} (limit {limit})")]
    RedirectCycle { target: StateKey, limit: u32 },

    #[error("handler for {source:?} raised an error: {message}")]
    HandlerError { source: StateKey, message: Arc<str> },

    #[error("a message handler returned more than one decision")]
    MultipleDecisions,

    #[error("snapshot does not match the current tree: {reason}")]
    SnapshotMismatch { reason: Arc<str> },
}

impl GearboxError {
    pub fn handler(source: StateKey, message: impl Into<Arc<str>>) -> Self {
        Self::HandlerError { source, message: message.into() }
    }
}

pub type GearboxResult<T> = Result<T, GearboxError>;
