//! S4 — Redirect at entry: `A`'s on-enter redirects to `B` before `A` ever
//! counts as current.

use std::sync::Arc;

use tree_machine::prelude::*;

fn redirecting_machine() -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("a"));
    builder.add(StateKey::new("a"), NodeKind::Leaf, StateKey::new("root")).on_enter(Arc::new(|mut ctx: EntryContext| {
        Box::pin(async move {
            ctx.transition.redirect_to(StateKey::new("b"));
            (ctx, Ok(()))
        })
    }));
    builder.add(StateKey::new("b"), NodeKind::Leaf, StateKey::new("root"));
    Machine::new(builder.build().unwrap())
}

#[tokio::test]
async fn redirect_at_entry_matches_spec_scenario_s4() {
    let machine = redirecting_machine();
    let state = machine.start().await.unwrap();
    assert_eq!(state.key(), Some(StateKey::new("b")), "a is never considered current");

    let transition = machine.transitions().value().expect("start emits a Transition");
    assert_eq!(transition.target, StateKey::new("b"));
    assert!(transition.is_initial());
}

#[tokio::test]
async fn redirect_cycle_is_bounded() {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("a"));
    builder.add(StateKey::new("a"), NodeKind::Leaf, StateKey::new("root")).on_enter(Arc::new(|mut ctx: EntryContext| {
        Box::pin(async move {
            ctx.transition.redirect_to(StateKey::new("b"));
            (ctx, Ok(()))
        })
    }));
    builder.add(StateKey::new("b"), NodeKind::Leaf, StateKey::new("root")).on_enter(Arc::new(|mut ctx: EntryContext| {
        Box::pin(async move {
            ctx.transition.redirect_to(StateKey::new("a"));
            (ctx, Ok(()))
        })
    }));
    let machine = Machine::new(builder.build().unwrap());
    let err = machine.start().await.unwrap_err();
    assert!(matches!(err, GearboxError::RedirectCycle { .. }));
}
