//! S3 — Self-transition: `go_to_self()` exits then re-enters the same leaf.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tree_machine::prelude::*;

struct Tick;

fn counting_machine(counter: Arc<AtomicU32>) -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("a"));
    let entered = counter.clone();
    builder
        .add(StateKey::new("a"), NodeKind::Leaf, StateKey::new("root"))
        .on_enter(Arc::new(move |ctx: EntryContext| {
            let entered = entered.clone();
            Box::pin(async move {
                entered.fetch_add(1, Ordering::SeqCst);
                (ctx, Ok(()))
            })
        }))
        .on_message(Arc::new(|mut ctx: MessageContext| {
            Box::pin(async move {
                if ctx.as_message::<Tick>().is_ok() {
                    ctx.go_to_self();
                } else {
                    ctx.unhandled();
                }
                ctx
            })
        }));
    Machine::new(builder.build().unwrap())
}

#[tokio::test]
async fn self_transition_matches_spec_scenario_s3() {
    let counter = Arc::new(AtomicU32::new(0));
    let machine = counting_machine(counter.clone());
    machine.start().await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let processed = machine.post(Tick).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let ProcessedMessage::Handled(handled) = processed else { panic!("expected Handled") };
    let transition = handled.transition.expect("go_to_self produces a transition");
    assert_eq!(transition.source, StateKey::new("a"));
    assert_eq!(transition.target, StateKey::new("a"));
    assert!(transition.is_self_transition());
    assert_eq!(transition.exited, vec![StateKey::new("a")]);
    assert_eq!(transition.entered, vec![StateKey::new("a")]);
}
