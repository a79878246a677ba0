// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::{EntryId, ErrorInfo, Event, Key, ValueWithMetadata};
use crate::registry::FunctionRegistry;
use crate::version::Version;
use crate::Graph;

///
/// A token that uniquely identifies one evaluation session against a Graph. Values of uncacheable
/// keys are only reusable by consumers holding the RunId of the session that computed them.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunId(pub u32);

struct InnerContext<K: Key> {
    registry: Arc<FunctionRegistry<K>>,
    run_id: RunId,
    stats: Stats,
    graph: Graph<K>,
}

///
/// The transient scratchpad of one run of a node: the dependency groups it has requested so far
/// (in request order), the diagnostic events its dependencies carried, and whether any of those
/// dependencies were uncacheable.
///
#[derive(Clone)]
pub(crate) struct DepState<K: Key> {
    pub(crate) groups: Vec<Vec<(EntryId, Version)>>,
    pub(crate) dep_events: Vec<Event<K>>,
    pub(crate) has_uncacheable_deps: bool,
}

impl<K: Key> Default for DepState<K> {
    fn default() -> DepState<K> {
        DepState {
            groups: Vec::new(),
            dep_events: Vec::new(),
            has_uncacheable_deps: false,
        }
    }
}

///
/// The handle through which compute functions (and the evaluator around them) interact with the
/// graph: requesting deps, emitting diagnostics, and recording what one run of a node observed.
///
/// One Context exists per evaluation session; `clone_for` derives a per-node-run child from it.
/// All of them share the session's registry, RunId, and stats, while the dep record and emitted
/// events belong to the individual run.
///
#[derive(Clone)]
pub struct Context<K: Key> {
    entry_id: Option<EntryId>,
    node: Option<K>,
    dep_state: Arc<Mutex<Option<DepState<K>>>>,
    emitted: Arc<Mutex<Vec<Event<K>>>>,
    inner: Arc<InnerContext<K>>,
}

impl<K: Key> Context<K> {
    pub(crate) fn new(graph: Graph<K>, registry: Arc<FunctionRegistry<K>>, run_id: RunId) -> Self {
        Self {
            entry_id: None,
            node: None,
            dep_state: Arc::default(),
            emitted: Arc::default(),
            inner: Arc::new(InnerContext {
                registry,
                run_id,
                stats: Stats::default(),
                graph,
            }),
        }
    }

    ///
    /// Get the value of the given dependency key, recording it as a single-member dependency
    /// group of the requesting node.
    ///
    /// A failure of the dependency surfaces here, wrapped for this consumer: the caller may
    /// absorb it, or propagate it to fail itself.
    ///
    pub async fn get(&self, dep: K) -> Result<ValueWithMetadata<K>, ErrorInfo<K>> {
        let mut results = self.get_all(vec![dep]).await;
        results.swap_remove(0).1
    }

    ///
    /// Get the values of the given dependency keys as one batch: the keys are requested
    /// concurrently and recorded as a single dependency group, and all outcomes are collected
    /// before any are returned.
    ///
    pub async fn get_all(&self, deps: Vec<K>) -> Vec<(K, Result<ValueWithMetadata<K>, ErrorInfo<K>>)> {
        self.inner.graph.get_group(self.entry_id, self, deps).await
    }

    ///
    /// Emits a diagnostic event attributed to the running node. The event rides on the node's
    /// value as metadata; it is additionally logged at the given severity.
    ///
    pub fn emit(&self, severity: log::Level, message: impl Into<String>) {
        let message = message.into();
        match &self.node {
            Some(node) => {
                log::log!(severity, "{node}: {message}");
                self.emitted.lock().push(Event {
                    severity,
                    origin: node.clone(),
                    message,
                });
            }
            None => {
                // Not running a node: log only.
                log::log!(severity, "{message}");
            }
        }
    }

    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    pub fn graph(&self) -> &Graph<K> {
        &self.inner.graph
    }

    pub(crate) fn registry(&self) -> &FunctionRegistry<K> {
        &self.inner.registry
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    pub(crate) fn graph_version(&self) -> Version {
        self.inner.graph.version()
    }

    ///
    /// Appends one batch of observed deps to the run's record. Refused once the run has
    /// completed: a node may have left background work behind that still holds this context, and
    /// such stragglers must not grow a record that has already been stored.
    ///
    pub(crate) fn dep_record_group(
        &self,
        group: Vec<(EntryId, Version)>,
        has_uncacheable: bool,
        dep_events: Vec<Event<K>>,
    ) -> Result<(), ErrorInfo<K>> {
        let mut maybe_dep_state = self.dep_state.lock();
        if let Some(dep_state) = maybe_dep_state.as_mut() {
            dep_state.groups.push(group);
            dep_state.dep_events.extend(dep_events);
            dep_state.has_uncacheable_deps |= has_uncacheable;
            Ok(())
        } else {
            Err(ErrorInfo::catastrophic(format!(
                "Dep request by {:?} after its run completed.",
                self.entry_id
            )))
        }
    }

    ///
    /// The dep groups this run has recorded up to now, for eager cleaning of a dirtied running
    /// node. Only valid while the run is live.
    ///
    pub(crate) fn dep_groups_so_far(&self, node: &K) -> Vec<Vec<(EntryId, Version)>> {
        (*self.dep_state.lock())
            .clone()
            .unwrap_or_else(|| panic!("{node} has no live run to read deps from"))
            .groups
    }

    ///
    /// Closes out this run, handing back its dep record and emitted events. Callable once: the
    /// record is gone afterwards, and any further dep requests are refused.
    ///
    pub(crate) fn complete(&self, node: &K) -> (DepState<K>, Vec<Event<K>>) {
        let dep_state = self
            .dep_state
            .lock()
            .take()
            .unwrap_or_else(|| panic!("{node} completed twice"));
        let emitted = std::mem::take(&mut *self.emitted.lock());
        (dep_state, emitted)
    }

    ///
    /// Derives the Context for one run of the given node, with a fresh dep record. (Plain
    /// `Clone` stays within the same run and shares its record.)
    ///
    pub(crate) fn clone_for(&self, entry_id: EntryId, node: K) -> Self {
        Self {
            entry_id: Some(entry_id),
            node: Some(node),
            dep_state: Arc::new(Mutex::new(Some(DepState::default()))),
            emitted: Arc::default(),
            inner: self.inner.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct Stats {
    pub ran: AtomicUsize,
    pub cleaning_succeeded: AtomicUsize,
    pub cleaning_failed: AtomicUsize,
}
