//! Nested/composed machines (§6): a machine-leaf state owns an inner
//! `Machine` for as long as it is active. The outer engine forwards
//! messages it cannot handle itself down into the inner machine, observes
//! the inner machine's completion to decide when the outer state is
//! "done", and disposes of the inner machine on exit.

use std::sync::Arc;

use crate::context::{AnyValue, Decision};
use crate::key::StateKey;
use crate::machine::Machine;

/// Builds a fresh inner machine each time its owning machine-leaf state is
/// entered (§6.1). Kept as a factory, not a shared instance, so re-entering
/// the state (e.g. after a self-transition of an ancestor) starts the
/// nested machine over rather than resuming stale state.
pub type MachineFactory = Arc<dyn Fn() -> Machine + Send + Sync>;

/// Invoked when the inner machine owned by a machine-leaf state reaches one
/// of its final states (§4.5 "On done..., invoke the corresponding outer
/// handler, which must produce a go-to decision"). Receives the inner
/// machine's final leaf key, or `None` if it was stopped externally rather
/// than reaching a declared final state.
pub type NestedDoneHandler = Arc<dyn Fn(Option<StateKey>) -> Decision + Send + Sync>;

/// The live handle to a running nested machine, held by the engine for the
/// duration its owning machine-leaf state is active.
pub struct NestedHandle {
    pub machine: Machine,
}

impl NestedHandle {
    pub fn new(machine: Machine) -> Self {
        Self { machine }
    }

    /// Forwards a message the outer engine could not handle itself down to
    /// the inner machine (§6.2).
    pub async fn forward(&self, message: AnyValue) {
        self.machine.post_any(message).await;
    }

    /// True once the inner machine has reached one of its final states
    /// (§6.3) — the signal the outer engine uses to decide the
    /// machine-leaf state itself is "done" and may be left via its own
    /// `is_done`-triggered transition.
    pub fn is_done(&self) -> bool {
        self.machine.is_done()
    }

    /// Releases the inner machine. Called strictly after the outer
    /// machine-leaf state's `on_exit` has returned (§6.4), mirroring the
    /// data registry's exit-then-deactivate ordering.
    pub async fn dispose(self) {
        self.machine.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;
    use crate::tree::NodeKind;
    use crate::key::StateKey;

    fn trivial_machine() -> Machine {
        let mut builder = TreeBuilder::new();
        builder.add_root(StateKey::new("inner_root"), StateKey::new("inner_idle"));
        builder.add(StateKey::new("inner_idle"), NodeKind::FinalLeaf, StateKey::new("inner_root"));
        Machine::new(builder.build().unwrap())
    }

    #[tokio::test]
    async fn nested_handle_reports_done_once_inner_reaches_final_state() {
        let inner = trivial_machine();
        inner.start().await.unwrap();
        let handle = NestedHandle::new(inner);
        assert!(handle.is_done());
        handle.dispose().await;
    }
}
