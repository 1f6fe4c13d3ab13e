//! S2 — Nested composite: `Root -> Open{Unassigned(initial), Assigned} | Closed`.

use std::sync::Arc;

use tree_machine::prelude::*;

struct Assign(String);
struct Close;

fn office() -> Machine {
    let mut builder = TreeBuilder::new();
    builder.add_root(StateKey::new("root"), StateKey::new("open"));
    builder
        .add_interior(StateKey::new("open"), StateKey::new("root"), StateKey::new("unassigned"))
        .on_message(Arc::new(|mut ctx: MessageContext| {
            Box::pin(async move {
                if ctx.as_message::<Close>().is_ok() {
                    ctx.go_to(StateKey::new("closed")).commit();
                } else {
                    ctx.unhandled();
                }
                ctx
            })
        }));
    builder.add(StateKey::new("unassigned"), NodeKind::Leaf, StateKey::new("open")).on_message(Arc::new(|mut ctx: MessageContext| {
        Box::pin(async move {
            if let Ok(Assign(name)) = ctx.as_message::<Assign>() {
                let name = name.clone();
                ctx.go_to(StateKey::with_data::<String>("assigned")).payload(name).commit();
            } else {
                ctx.unhandled();
            }
            ctx
        })
    }));
    builder
        .add(StateKey::with_data::<String>("assigned"), NodeKind::Leaf, StateKey::new("open"))
        .data(Arc::new(|payload: Option<AnyValue>| payload.expect("assigned requires a payload")));
    builder.add(StateKey::new("closed"), NodeKind::Leaf, StateKey::new("root"));
    Machine::new(builder.build().unwrap())
}

#[tokio::test]
async fn nested_composite_matches_spec_scenario_s2() {
    let machine = office();
    let state = machine.start().await.unwrap();
    assert_eq!(state.key(), Some(StateKey::new("unassigned")));
    assert!(state.is_in(StateKey::new("open")));
    assert!(state.is_in(StateKey::new("root")));

    let processed = machine.post(Assign("alice".to_string())).await;
    assert!(processed.is_handled());
    let state = machine.current_state();
    assert_eq!(state.key(), Some(StateKey::with_data::<String>("assigned")));
    assert!(state.is_in(StateKey::new("open")));
    assert_eq!(state.data_value::<String>(StateKey::with_data::<String>("assigned")).unwrap(), "alice");

    let processed = machine.post(Close).await;
    assert!(processed.is_handled());
    let state = machine.current_state();
    assert_eq!(state.key(), Some(StateKey::new("closed")));
    assert!(!state.is_in(StateKey::new("open")));
    assert!(state.is_in(StateKey::new("root")));
}
