//! A runtime for hierarchical (tree) state machines: a classical finite
//! state machine generalized so states are arranged in a rooted tree, only
//! one leaf state is current at any time, and all ancestors of the current
//! leaf are active and participate in message handling.
//!
//! The crate is organized around the components of that runtime:
//! an immutable [`tree`] description, a typed [`data`] registry for
//! per-state data, the [`context`] types handlers see, the [`engine`] that
//! drives transitions, and the [`machine`] façade applications hold onto.
//! [`builder`] is a minimal imperative way to assemble a [`tree::Tree`];
//! declarative builder sugar and diagram export are out of scope (see
//! `SPEC_FULL.md`).

pub mod builder;
pub mod codec;
pub mod context;
pub mod data;
pub mod engine;
pub mod error;
pub mod history;
pub mod key;
pub mod machine;
pub mod nested;
pub mod prelude;
pub mod stream;
pub mod tree;

pub use engine::{AbortedTransition, HandledMessage, ProcessedMessage, Transition};
pub use error::{DefinitionError, GearboxError, GearboxResult};
pub use key::{StateKey, STOPPED_KEY};
pub use machine::{CurrentState, Machine, SnapshotEntry};
