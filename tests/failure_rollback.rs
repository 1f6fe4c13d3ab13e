//! S6 — Failure rollback: on-enter of `C` raises. Dispatch of a message
//! targeting `C` yields `ProcessedMessage::Failed`; per §4.5 the engine does
//! not attempt re-entry, so the current leaf reverts to the source leaf
//! (`C` was the first and only state the failed transition tried to enter).

use std::sync::Arc;

use tree_machine::prelude::*;

struct Go;

fn failing_machine() -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("a"));
    builder.add(StateKey::new("a"), NodeKind::Leaf, StateKey::new("root")).on_message(Arc::new(|mut ctx: MessageContext| {
        Box::pin(async move {
            if ctx.as_message::<Go>().is_ok() {
                ctx.go_to(StateKey::new("c")).commit();
            } else {
                ctx.unhandled();
            }
            ctx
        })
    }));
    builder.add(StateKey::new("c"), NodeKind::Leaf, StateKey::new("root")).on_enter(Arc::new(|ctx: EntryContext| {
        Box::pin(async move { (ctx, Err(GearboxError::handler(StateKey::new("c"), "boom"))) })
    }));
    Machine::new(builder.build().unwrap())
}

#[tokio::test]
async fn failed_entry_reverts_to_source_leaf_s6() {
    let machine = failing_machine();
    let state = machine.start().await.unwrap();
    assert_eq!(state.key(), Some(StateKey::new("a")));

    let processed = machine.post(Go).await;
    let ProcessedMessage::Failed { leaf, error, aborted_transition, .. } = processed else {
        panic!("expected Failed, got something else")
    };
    assert_eq!(leaf, StateKey::new("a"));
    assert!(matches!(error, GearboxError::HandlerError { .. }));
    assert!(aborted_transition.is_some(), "the aborted transition attempt should be recorded");

    // current leaf is unchanged: nothing before `c` had to be rolled back
    // because `c` was the first (and only) state the transition tried to enter.
    let state = machine.current_state();
    assert_eq!(state.key(), Some(StateKey::new("a")));

    // the machine keeps accepting posts after a failed transition.
    let processed = machine.post(Go).await;
    assert!(matches!(processed, ProcessedMessage::Failed { .. }));
}
