//! Tag-keyed reducer/producer registries.
//!
//! Each factory maps a string tag (the kind of the object) to a reducer
//! and a producer. Unknown tags surface as `MissingReducer` /
//! `MissingProducer` naming the tag.

use std::collections::HashMap;

use svi_io::WireMap;

use crate::context::WireContext;
use crate::error::{WireError, WireResult};

/// A registered reduction function.
pub type Reducer<T> = fn(&T, &mut dyn WireContext) -> WireResult<WireMap>;

/// A registered production function.
pub type Producer<T> = fn(&WireMap, &mut dyn WireContext) -> WireResult<T>;

/// A tag-keyed table of (reducer, producer) pairs for one object family.
pub struct Factory<T> {
    kind: &'static str,
    tag_of: fn(&T) -> String,
    tag_of_map: fn(&WireMap) -> WireResult<String>,
    entries: HashMap<String, (Reducer<T>, Producer<T>)>,
}

impl<T> Factory<T> {
    pub fn new(
        kind: &'static str,
        tag_of: fn(&T) -> String,
        tag_of_map: fn(&WireMap) -> WireResult<String>,
    ) -> Self {
        Self {
            kind,
            tag_of,
            tag_of_map,
            entries: HashMap::new(),
        }
    }

    /// The object family this factory serves ("types", "references", ...).
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register the handler pair for a tag.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        reducer: Reducer<T>,
        producer: Producer<T>,
    ) -> &mut Self {
        self.entries.insert(tag.into(), (reducer, producer));
        self
    }

    pub fn tags(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Reduce an object through its registered reducer.
    pub fn reduce(&self, value: &T, ctx: &mut dyn WireContext) -> WireResult<WireMap> {
        let tag = (self.tag_of)(value);
        let (reducer, _) = self
            .entries
            .get(&tag)
            .ok_or_else(|| WireError::missing_reducer(&tag))?;
        reducer(value, ctx)
    }

    /// Produce an object from its reduced form through the registered
    /// producer for the map's tag.
    pub fn produce(&self, map: &WireMap, ctx: &mut dyn WireContext) -> WireResult<T> {
        let tag = (self.tag_of_map)(map)?;
        let (_, producer) = self
            .entries
            .get(&tag)
            .ok_or_else(|| WireError::missing_producer(&tag))?;
        producer(map, ctx)
    }
}

impl<T> std::fmt::Debug for Factory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("kind", &self.kind)
            .field("tags", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NullContext;
    use crate::keys;

    fn tag_of(value: &u64) -> String {
        if *value % 2 == 0 { "EVEN" } else { "ODD" }.to_string()
    }

    fn tag_of_map(map: &WireMap) -> WireResult<String> {
        Ok(map.get_str(keys::TAG)?.to_string())
    }

    fn reduce_even(value: &u64, _ctx: &mut dyn WireContext) -> WireResult<WireMap> {
        let mut map = WireMap::new();
        map.set_str(keys::TAG, "EVEN").set_u64(keys::VALUE, *value);
        Ok(map)
    }

    fn produce_even(map: &WireMap, _ctx: &mut dyn WireContext) -> WireResult<u64> {
        Ok(map.get_u64(keys::VALUE)?)
    }

    #[test]
    fn dispatches_by_tag() {
        let mut factory: Factory<u64> = Factory::new("numbers", tag_of, tag_of_map);
        factory.register("EVEN", reduce_even, produce_even);

        let mut ctx = NullContext;
        let map = factory.reduce(&4, &mut ctx).unwrap();
        assert_eq!(factory.produce(&map, &mut ctx).unwrap(), 4);
    }

    #[test]
    fn missing_handlers_name_the_tag() {
        let factory: Factory<u64> = Factory::new("numbers", tag_of, tag_of_map);
        let mut ctx = NullContext;

        match factory.reduce(&3, &mut ctx) {
            Err(WireError::MissingReducer { tag }) => assert_eq!(tag, "ODD"),
            other => panic!("expected missing reducer, got {other:?}"),
        }

        let mut map = WireMap::new();
        map.set_str(keys::TAG, "ODD");
        assert!(matches!(
            factory.produce(&map, &mut ctx),
            Err(WireError::MissingProducer { .. })
        ));
    }
}
