// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Debug, Display};
use std::hash::Hash;

use fnv::FnvHashSet as HashSet;
use petgraph::stable_graph;

// Entries are addressed by 32-bit arena indexes: u32::MAX of them is far beyond what fits in
// memory anyway.
pub type EntryId = stable_graph::NodeIndex<u32>;

///
/// The typed identity of a cacheable/memoizable computation in the Graph.
///
/// Keys are immutable, structurally hashed, and totally equatable: two keys with the same kind
/// and payload are the same key. The kind is drawn from a closed registry, and selects the
/// compute function that produces the key's value.
///
pub trait Key: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    ///
    /// The closed set of key kinds. Compute functions are registered per kind.
    ///
    type Kind: Copy + Debug + Eq + Hash + Send + Sync + 'static;

    ///
    /// The value produced by compute functions for this Key type. Kind-heterogeneous values are
    /// expressed as a tagged variant, with accessors that fail on a kind mismatch.
    ///
    type Value: Clone + Debug + Eq + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    ///
    /// False for keys whose values may only be consumed within the run that computed them, and
    /// which must be recomputed in a new run. Dependents of an uncacheable key are transitively
    /// marked as having uncacheable deps, and are re-checked per run.
    ///
    fn cacheable(&self) -> bool {
        true
    }

    ///
    /// False for keys which may not be restarted once they have started running (generally
    /// because they have side effects), and which are therefore only allowed to run once.
    /// Invalidation does not pass through a non-restartable key while it runs.
    ///
    fn restartable(&self) -> bool {
        true
    }
}

///
/// A diagnostic event attributed to the key whose computation emitted it.
///
/// Events ride on values as metadata, and are deduplicated by `(origin, message)` so that
/// transitive aggregation stays bounded.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event<K> {
    pub severity: log::Level,
    pub origin: K,
    pub message: String,
}

///
/// The result of a computation, either bare or carrying transitively collected diagnostics.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueWithMetadata<K: Key> {
    value: K::Value,
    events: Vec<Event<K>>,
}

impl<K: Key> ValueWithMetadata<K> {
    pub fn just_value(value: K::Value) -> ValueWithMetadata<K> {
        ValueWithMetadata {
            value,
            events: Vec::new(),
        }
    }

    pub fn with_events(value: K::Value, events: Vec<Event<K>>) -> ValueWithMetadata<K> {
        ValueWithMetadata { value, events }
    }

    pub fn value(&self) -> &K::Value {
        &self.value
    }

    pub fn into_value(self) -> K::Value {
        self.value
    }

    pub fn events(&self) -> &[Event<K>] {
        &self.events
    }

    ///
    /// Appends the given events to this value's metadata, deduplicating by (origin, message).
    ///
    pub(crate) fn merge_events(mut self, more: Vec<Event<K>>) -> ValueWithMetadata<K> {
        let mut seen = self
            .events
            .iter()
            .map(|e| (e.origin.clone(), e.message.clone()))
            .collect::<HashSet<_>>();
        for event in more {
            if seen.insert((event.origin.clone(), event.message.clone())) {
                self.events.push(event);
            }
        }
        self
    }
}

///
/// The output of a node: a value with metadata, or a finite description of its failure.
///
pub type NodeOutput<K> = Result<ValueWithMetadata<K>, ErrorInfo<K>>;

///
/// The kind of a node failure.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A required input key did not resolve: no compute function is registered for its kind.
    MissingInput,
    /// The compute function for the key signalled failure.
    Function,
    /// A dependency failed: this key fails without fault of its own.
    Transitive,
    /// The key participates in a dependency cycle.
    Cycle,
    /// An evaluator invariant was breached: the invocation is aborted.
    Catastrophic,
    /// The key was invalidated while running, and the run was discarded. Retried internally.
    Invalidated,
}

///
/// A finite description of a node failure: its kind, whether it is transient (may vanish on
/// retry) or persistent, the chain of keys toward the root cause, and the cycle path when the
/// failure is cyclic.
///
/// Persistent errors occupy an "error node" position in the graph: done, with recorded deps but
/// no value. Transient errors are never stored: the entry returns to its not-started state when
/// the run completes, so the next invocation retries it.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorInfo<K> {
    kind: ErrorKind,
    transient: bool,
    message: String,
    root_causes: Vec<K>,
    cycle_path: Vec<K>,
}

impl<K: Clone + Display> ErrorInfo<K> {
    pub fn missing_input(key: K, message: String) -> ErrorInfo<K> {
        ErrorInfo {
            kind: ErrorKind::MissingInput,
            transient: false,
            message,
            root_causes: vec![key],
            cycle_path: Vec::new(),
        }
    }

    pub fn function_error(key: K, message: String, transient: bool) -> ErrorInfo<K> {
        ErrorInfo {
            kind: ErrorKind::Function,
            transient,
            message,
            root_causes: vec![key],
            cycle_path: Vec::new(),
        }
    }

    ///
    /// Wraps the failure of a dependency for a consuming key. Invalidation, cycle, and
    /// catastrophic failures keep their kind as they propagate; anything else becomes a
    /// transitive failure. The dependency is prepended to the root-cause chain.
    ///
    pub fn transitive(dep: K, inner: ErrorInfo<K>) -> ErrorInfo<K>
    where
        K: PartialEq,
    {
        let kind = match inner.kind {
            ErrorKind::Invalidated | ErrorKind::Cycle | ErrorKind::Catastrophic => inner.kind,
            _ => ErrorKind::Transitive,
        };
        let mut root_causes = if inner.root_causes.first() == Some(&dep) {
            Vec::new()
        } else {
            vec![dep]
        };
        root_causes.extend(inner.root_causes);
        ErrorInfo {
            kind,
            transient: inner.transient,
            message: inner.message,
            root_causes,
            cycle_path: inner.cycle_path,
        }
    }

    pub fn cyclic(path: Vec<K>) -> ErrorInfo<K> {
        let message = format!(
            "Dependency cycle: {}",
            path.iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        ErrorInfo {
            kind: ErrorKind::Cycle,
            transient: false,
            message,
            root_causes: path.clone(),
            cycle_path: path,
        }
    }

    pub fn catastrophic(message: String) -> ErrorInfo<K> {
        ErrorInfo {
            kind: ErrorKind::Catastrophic,
            transient: false,
            message,
            root_causes: Vec::new(),
            cycle_path: Vec::new(),
        }
    }

    ///
    /// Represents that a node was invalidated out of the Graph, generally while running.
    ///
    pub fn invalidated() -> ErrorInfo<K> {
        ErrorInfo {
            kind: ErrorKind::Invalidated,
            transient: true,
            message: "Invalidated while running".to_owned(),
            root_causes: Vec::new(),
            cycle_path: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    ///
    /// True iff this failure may vanish on retry, and must therefore not be cached.
    ///
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_invalidated(&self) -> bool {
        self.kind == ErrorKind::Invalidated
    }

    pub fn is_cyclic(&self) -> bool {
        self.kind == ErrorKind::Cycle || !self.cycle_path.is_empty()
    }

    pub fn is_catastrophic(&self) -> bool {
        self.kind == ErrorKind::Catastrophic
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    ///
    /// The chain of keys from the failing key toward the root cause, nearest first.
    ///
    pub fn root_causes(&self) -> &[K] {
        &self.root_causes
    }

    ///
    /// The keys on the cycle, when this failure is cyclic.
    ///
    pub fn cycle_path(&self) -> &[K] {
        &self.cycle_path
    }
}

impl<K: Display> Display for ErrorInfo<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.root_causes.first() {
            Some(root) => write!(f, "{:?} for {}: {}", self.kind, root, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}
