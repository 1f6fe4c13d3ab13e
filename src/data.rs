//! The data registry (C2): owns the typed data slot of each currently
//! active data state. Registry access itself is not a suspension point
//! (§5 lists only lifecycle callbacks and handlers as suspension points),
//! so this module is entirely synchronous, guarded by a `parking_lot`
//! mutex rather than an async one.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::GearboxError;
use crate::key::StateKey;
use crate::stream::{self, ValueSink, ValueStream};
use crate::tree::NodeId;

type AnyValue = Arc<dyn Any + Send + Sync>;

struct Slot {
    key: StateKey,
    value: AnyValue,
    sink: ValueSink<AnyValue>,
}

/// Owns the active data slots for a single running machine.
///
/// Invariant (§4.2): at most one activation per key at any moment. A read
/// after `deactivate` fails with [`GearboxError::NoSuchDataState`]; an
/// update after `deactivate` fails with [`GearboxError::StateExited`] — the
/// spec draws that distinction deliberately (see DESIGN.md).
#[derive(Default)]
pub struct DataRegistry {
    slots: Mutex<HashMap<NodeId, Slot>>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    pub fn activate<D: Send + Sync + 'static>(&self, node: NodeId, key: StateKey, initial: D) {
        self.activate_any(node, key, Arc::new(initial));
    }

    /// As [`Self::activate`], but for a value already boxed as `AnyValue` —
    /// the shape a node's `data_factory` produces (§4.1: `data_factory(key)
    /// -> Value`), so the engine does not need to know `D` to activate it.
    pub fn activate_any(&self, node: NodeId, key: StateKey, value: AnyValue) {
        let (sink, _stream) = stream::channel_with(value.clone());
        self.slots.lock().insert(node, Slot { key, value, sink });
    }

    pub fn is_active(&self, node: NodeId) -> bool {
        self.slots.lock().contains_key(&node)
    }

    pub fn read<D: Clone + Send + Sync + 'static>(&self, node: NodeId) -> Result<D, GearboxError> {
        let slots = self.slots.lock();
        let slot = slots.get(&node).ok_or(GearboxError::NoSuchDataState(StateKey::new("?")))?;
        slot.value
            .downcast_ref::<D>()
            .cloned()
            .ok_or(GearboxError::WrongDataType { key: slot.key })
    }

    /// Untyped read, used by snapshot encoding (§6) which knows only that a
    /// codec exists for the node, not its concrete Rust type.
    pub fn read_any(&self, node: NodeId) -> Option<AnyValue> {
        self.slots.lock().get(&node).map(|slot| slot.value.clone())
    }

    pub fn update<D, F>(&self, node: NodeId, f: F) -> Result<(), GearboxError>
    where
        D: Clone + Send + Sync + 'static,
        F: FnOnce(D) -> D,
    {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&node).ok_or(GearboxError::StateExited { key: StateKey::new("?") })?;
        let current = slot
            .value
            .downcast_ref::<D>()
            .cloned()
            .ok_or(GearboxError::WrongDataType { key: slot.key })?;
        let next = f(current);
        let boxed: AnyValue = Arc::new(next);
        slot.value = boxed.clone();
        slot.sink.set(boxed);
        Ok(())
    }

    pub fn replace<D: Clone + Send + Sync + 'static>(&self, node: NodeId, value: D) -> Result<(), GearboxError> {
        self.update(node, move |_| value.clone())
    }

    /// Typed ancestor lookup: walks `ancestors` (expected nearest-first,
    /// i.e. starting at the leaf itself) and returns the first active data
    /// state whose value downcasts to `D`.
    pub fn find_ancestor<D: Clone + Send + Sync + 'static>(&self, ancestors: impl IntoIterator<Item = NodeId>) -> Option<D> {
        let slots = self.slots.lock();
        for node in ancestors {
            if let Some(slot) = slots.get(&node) {
                if let Some(v) = slot.value.downcast_ref::<D>() {
                    return Some(v.clone());
                }
            }
        }
        None
    }

    pub fn stream<D: Clone + Send + Sync + 'static>(&self, node: NodeId) -> Result<ValueStream<D>, GearboxError> {
        let slots = self.slots.lock();
        let slot = slots.get(&node).ok_or(GearboxError::NoSuchDataState(StateKey::new("?")))?;
        let key = slot.key;
        let raw = slot.sink.subscribe();
        Ok(raw.map(move |any: AnyValue| {
            any.downcast_ref::<D>().cloned().unwrap_or_else(|| {
                panic!("data stream for {key:?} observed a value of an unexpected type")
            })
        }))
    }

    /// Called by the engine strictly after the owning state's `on_exit` has
    /// returned (§4.5 step 3).
    pub fn deactivate(&self, node: NodeId) {
        if let Some(slot) = self.slots.lock().remove(&node) {
            slot.sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn fake_node() -> NodeId {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn read_after_deactivate_fails() {
        let registry = DataRegistry::new();
        let node = fake_node();
        registry.activate(node, StateKey::new("s"), 42u32);
        assert_eq!(registry.read::<u32>(node).unwrap(), 42);
        registry.deactivate(node);
        assert!(matches!(registry.read::<u32>(node), Err(GearboxError::NoSuchDataState(_))));
    }

    #[test]
    fn update_after_deactivate_fails_with_state_exited() {
        let registry = DataRegistry::new();
        let node = fake_node();
        registry.activate(node, StateKey::new("s"), 1u32);
        registry.deactivate(node);
        assert!(matches!(registry.update::<u32, _>(node, |v| v + 1), Err(GearboxError::StateExited { .. })));
    }

    #[test]
    fn wrong_type_read_fails() {
        let registry = DataRegistry::new();
        let node = fake_node();
        registry.activate(node, StateKey::new("s"), 1u32);
        assert!(matches!(registry.read::<String>(node), Err(GearboxError::WrongDataType { .. })));
    }

    #[test]
    fn update_replaces_value_atomically() {
        let registry = DataRegistry::new();
        let node = fake_node();
        registry.activate(node, StateKey::new("s"), 1u32);
        registry.update::<u32, _>(node, |v| v + 41).unwrap();
        assert_eq!(registry.read::<u32>(node).unwrap(), 42);
    }
}
