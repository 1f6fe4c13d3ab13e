//! The persistence contract (§6 "Persisted state layout"). Only the
//! interface is in scope here (§1 Non-goals: "Persistence/codec framework
//! (only the interface is specified)") — no JSON/bincode/etc. implementation
//! ships with the crate; callers that want snapshots to survive a process
//! restart supply their own `Codec` per data-typed state.

use std::sync::Arc;

use crate::context::AnyValue;
use crate::error::GearboxError;

/// Encodes and decodes the value held by one data-typed state for the
/// purpose of a [`crate::machine::SnapshotEntry`]. Registered per-state via
/// [`crate::builder::NodeSpecExt::codec`].
pub trait Codec: Send + Sync {
    fn encode(&self, value: &AnyValue) -> Result<Vec<u8>, GearboxError>;
    fn decode(&self, bytes: &[u8]) -> Result<AnyValue, GearboxError>;
}

/// A `Codec` built from a pair of plain functions, for callers who don't
/// want to name a type just to implement the trait.
pub struct FnCodec<E, D> {
    encode: E,
    decode: D,
}

impl<E, D> FnCodec<E, D>
where
    E: Fn(&AnyValue) -> Result<Vec<u8>, GearboxError> + Send + Sync,
    D: Fn(&[u8]) -> Result<AnyValue, GearboxError> + Send + Sync,
{
    pub fn new(encode: E, decode: D) -> Arc<Self> {
        Arc::new(Self { encode, decode })
    }
}

impl<E, D> Codec for FnCodec<E, D>
where
    E: Fn(&AnyValue) -> Result<Vec<u8>, GearboxError> + Send + Sync,
    D: Fn(&[u8]) -> Result<AnyValue, GearboxError> + Send + Sync,
{
    fn encode(&self, value: &AnyValue) -> Result<Vec<u8>, GearboxError> {
        (self.encode)(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnyValue, GearboxError> {
        (self.decode)(bytes)
    }
}

/// A `Codec` for any `D: Serialize + DeserializeOwned` backed by
/// `serde_json`, the serialization crate already in the dependency stack.
pub struct JsonCodec<D> {
    _marker: std::marker::PhantomData<D>,
}

impl<D> JsonCodec<D> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { _marker: std::marker::PhantomData })
    }
}

impl<D> Default for JsonCodec<D> {
    fn default() -> Self {
        Self { _marker: std::marker::PhantomData }
    }
}

impl<D> Codec for JsonCodec<D>
where
    D: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &AnyValue) -> Result<Vec<u8>, GearboxError> {
        let typed = value
            .downcast_ref::<D>()
            .ok_or_else(|| GearboxError::handler(crate::key::StateKey::new("?"), "codec value type mismatch"))?;
        serde_json::to_vec(typed).map_err(|e| GearboxError::handler(crate::key::StateKey::new("?"), e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnyValue, GearboxError> {
        let value: D = serde_json::from_slice(bytes).map_err(|e| GearboxError::handler(crate::key::StateKey::new("?"), e.to_string()))?;
        Ok(Arc::new(value))
    }
}
