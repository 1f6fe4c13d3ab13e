//! S5 — Nested machine: outer leaf `M` wraps inner tree `Inner{I1, I2(final)}`.
//! Posting `Go` (forwarded) to `M` causes inner transition `I1 -> I2`; `M`'s
//! `on_machine_done` returns `go_to(N)`. After inner completion: outer leaf
//! is `N`; inner machine is stopped.

use std::sync::Arc;

use tree_machine::prelude::*;

struct Go;

fn inner_machine() -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("inner_root"), StateKey::new("i1"));
    builder.add(StateKey::new("i1"), NodeKind::Leaf, StateKey::new("inner_root")).on_message(Arc::new(|mut ctx: MessageContext| {
        Box::pin(async move {
            if ctx.as_message::<Go>().is_ok() {
                ctx.go_to(StateKey::new("i2")).commit();
            } else {
                ctx.unhandled();
            }
            ctx
        })
    }));
    builder.add(StateKey::new("i2"), NodeKind::FinalLeaf, StateKey::new("inner_root"));
    Machine::new(builder.build().unwrap())
}

fn outer_machine() -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("m"));
    builder
        .add(StateKey::new("m"), NodeKind::MachineLeaf, StateKey::new("root"))
        .nested_machine(Arc::new(inner_machine))
        .on_machine_done(Arc::new(|_inner_final| Decision::GoTo {
            target: StateKey::new("n"),
            payload: None,
            metadata: Default::default(),
            reenter: false,
            transition_action: None,
        }));
    builder.add(StateKey::new("n"), NodeKind::Leaf, StateKey::new("root"));
    Machine::new(builder.build().unwrap())
}

#[tokio::test]
async fn nested_machine_completion_drives_outer_transition_s5() {
    let machine = outer_machine();
    let state = machine.start().await.unwrap();
    assert_eq!(state.key(), Some(StateKey::new("m")));

    let processed = machine.post(Go).await;
    assert!(processed.is_handled());
    let state = machine.current_state();
    assert_eq!(state.key(), Some(StateKey::new("n")));
}
