//! S1 — Turnstile: the canonical two-state machine exercising post/dispatch.

use std::sync::Arc;

use tree_machine::prelude::*;

struct Coin;
struct Push;

fn turnstile() -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("locked"));
    builder.add(StateKey::new("locked"), NodeKind::Leaf, StateKey::new("root")).on_message(Arc::new(|mut ctx: MessageContext| {
        Box::pin(async move {
            if ctx.as_message::<Coin>().is_ok() {
                ctx.go_to(StateKey::new("unlocked")).commit();
            } else {
                ctx.unhandled();
            }
            ctx
        })
    }));
    builder.add(StateKey::new("unlocked"), NodeKind::Leaf, StateKey::new("root")).on_message(Arc::new(|mut ctx: MessageContext| {
        Box::pin(async move {
            if ctx.as_message::<Push>().is_ok() {
                ctx.go_to(StateKey::new("locked")).commit();
            } else {
                ctx.unhandled();
            }
            ctx
        })
    }));
    Machine::new(builder.build().unwrap())
}

#[tokio::test]
async fn turnstile_matches_spec_scenario_s1() {
    let machine = turnstile();
    let state = machine.start().await.unwrap();
    assert_eq!(state.key(), Some(StateKey::new("locked")));

    let p1 = machine.post(Coin).await;
    assert!(p1.is_handled());
    assert_eq!(machine.current_state().key(), Some(StateKey::new("unlocked")));

    let p2 = machine.post(Push).await;
    assert!(p2.is_handled());
    assert_eq!(machine.current_state().key(), Some(StateKey::new("locked")));

    let p3 = machine.post(Push).await;
    assert!(matches!(p3, ProcessedMessage::Unhandled { .. }));
    assert_eq!(machine.current_state().key(), Some(StateKey::new("locked")));

    let p4 = machine.post(Coin).await;
    assert!(p4.is_handled());
    assert_eq!(machine.current_state().key(), Some(StateKey::new("unlocked")));
}
