//! Convenience re-exports for the common case of defining a tree with
//! [`crate::builder`] and driving it through [`crate::machine::Machine`].

pub use crate::builder::{NodeSpecExt, TreeBuilder};
pub use crate::codec::{Codec, FnCodec, JsonCodec};
pub use crate::context::{
    boxed_value, AnyValue, Decision, EntryContext, Filter, MessageContext, TransitionReason,
};
pub use crate::engine::{AbortedTransition, HandledMessage, ProcessedMessage, Transition};
pub use crate::error::{DefinitionError, GearboxError, GearboxResult};
pub use crate::history::History;
pub use crate::key::{StateKey, STOPPED_KEY};
pub use crate::machine::{CurrentState, Machine, SnapshotEntry};
pub use crate::nested::{MachineFactory, NestedDoneHandler};
pub use crate::tree::{InitialChild, NodeKind, NodeSpec, Tree};
