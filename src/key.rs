use std::any::TypeId;
use std::fmt;

/// An opaque identity for a state.
///
/// Two keys are equal when their names match and, for data-typed keys, their
/// carried data type also matches. A key created with [`StateKey::new`] is
/// "plain"; one created with [`StateKey::with_data`] witnesses the type of
/// data stored under that key (see §3 of the spec, "StateKey").
#[derive(Clone, Copy)]
pub struct StateKey {
    name: &'static str,
    data_type: Option<(TypeId, &'static str)>,
}

impl StateKey {
    /// A plain key carrying no data-type witness.
    pub const fn new(name: &'static str) -> Self {
        Self { name, data_type: None }
    }

    /// A key that witnesses the type `D` stored alongside the state.
    pub fn with_data<D: 'static>(name: &'static str) -> Self {
        Self {
            name,
            data_type: Some((TypeId::of::<D>(), std::any::type_name::<D>())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn data_type_id(&self) -> Option<TypeId> {
        self.data_type.map(|(id, _)| id)
    }

    pub fn data_type_name(&self) -> Option<&'static str> {
        self.data_type.map(|(_, name)| name)
    }

    pub fn is_data_typed(&self) -> bool {
        self.data_type.is_some()
    }
}

impl PartialEq for StateKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.data_type.map(|(t, _)| t) == other.data_type.map(|(t, _)| t)
    }
}

impl Eq for StateKey {}

impl std::hash::Hash for StateKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.data_type.map(|(t, _)| t).hash(state);
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data_type {
            Some((_, type_name)) => write!(f, "StateKey({:?}: {})", self.name, type_name),
            None => write!(f, "StateKey({:?})", self.name),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The always-present final state every machine transitions to on `stop()`.
pub const STOPPED_KEY: StateKey = StateKey::new("<stopped>");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_keys_compare_by_name() {
        assert_eq!(StateKey::new("a"), StateKey::new("a"));
        assert_ne!(StateKey::new("a"), StateKey::new("b"));
    }

    #[test]
    fn data_typed_keys_distinguish_by_type() {
        let a = StateKey::with_data::<u32>("assigned");
        let b = StateKey::with_data::<String>("assigned");
        assert_ne!(a, b, "same name, different data type must not be equal");
        assert_ne!(a, StateKey::new("assigned"));
    }
}
