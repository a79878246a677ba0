// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHashMap as HashMap;

use crate::context::Context;
use crate::node::{ErrorInfo, Key, ValueWithMetadata};

///
/// Computes the value of a key of one particular kind.
///
/// A compute function is a pure state machine over the dependency lookups it performs through the
/// given environment: requesting a dependency suspends the node until the dependency is done, and
/// the engine is free to park, resume, or cancel the node across threads and invocations at any
/// of those points. A function must therefore be deterministic in the sequence of dependencies it
/// requests for a given state of the graph, and must treat every value it receives as read-only.
///
/// Dependency failures surface as errors from the environment's lookup methods: a function may
/// absorb them (producing a valid value anyway) or propagate them with `?`.
///
#[async_trait]
pub trait ComputeFunction<K: Key>: Send + Sync + 'static {
    async fn compute(
        &self,
        key: &K,
        env: &Context<K>,
    ) -> Result<ValueWithMetadata<K>, ErrorInfo<K>>;
}

///
/// Dispatch from key kind to the compute function for that kind. One function per kind;
/// registering a kind twice replaces the earlier function.
///
/// A key whose kind has no registered function resolves to a persistent `MissingInput` error
/// node: kinds whose values only ever arrive by injection are represented by not registering
/// them.
///
pub struct FunctionRegistry<K: Key> {
    functions: HashMap<K::Kind, Arc<dyn ComputeFunction<K>>>,
}

impl<K: Key> FunctionRegistry<K> {
    pub fn new() -> FunctionRegistry<K> {
        FunctionRegistry {
            functions: HashMap::default(),
        }
    }

    pub fn register(mut self, kind: K::Kind, function: impl ComputeFunction<K>) -> Self {
        self.functions.insert(kind, Arc::new(function));
        self
    }

    pub fn get(&self, kind: K::Kind) -> Option<&Arc<dyn ComputeFunction<K>>> {
        self.functions.get(&kind)
    }
}
