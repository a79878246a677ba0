// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

// Lints are configured once, in the workspace manifest.

mod context;
mod entry;
mod node;
mod registry;
mod snapshot;
mod version;

pub use crate::context::{Context, RunId};
pub use crate::node::{EntryId, ErrorInfo, ErrorKind, Event, Key, NodeOutput, ValueWithMetadata};
pub use crate::registry::{ComputeFunction, FunctionRegistry};
pub use crate::snapshot::Snapshot;
pub use crate::version::Version;

use crate::entry::{outputs_equal, Entry, NodeResult, RunToken};

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fixedbitset::FixedBitSet;
use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use futures::future;
use futures::stream::{FuturesUnordered, StreamExt};
use log::info;
use parking_lot::Mutex;
use petgraph::dot;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use petgraph::Direction;
use task_executor::Executor;
use tokio::time::sleep;

type PGraph<K> = StableDiGraph<Entry<K>, (), u32>;

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

type Nodes<K> = HashMap<K, EntryId>;

struct InnerGraph<K: Key> {
    nodes: Nodes<K>,
    pg: PGraph<K>,
}

impl<K: Key> InnerGraph<K> {
    fn entry_id(&self, node: &K) -> Option<&EntryId> {
        self.nodes.get(node)
    }

    fn entry_for_id(&self, id: EntryId) -> Option<&Entry<K>> {
        self.pg.node_weight(id)
    }

    fn entry_for_id_mut(&mut self, id: EntryId) -> Option<&mut Entry<K>> {
        self.pg.node_weight_mut(id)
    }

    ///
    /// The entry for an id which the caller knows to be present (one it is currently holding or
    /// walking). Ids only disappear via garbage collection, which is forbidden while anything
    /// else is underway.
    ///
    fn existing_entry(&self, id: EntryId) -> &Entry<K> {
        self.pg
            .node_weight(id)
            .expect("an entry id in active use cannot have been collected")
    }

    fn ensure_entry(&mut self, node: K) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }
        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    ///
    /// Finds cycles among the currently running nodes and breaks one member out of each.
    ///
    /// Rather than enumerating every simple cycle, this takes the strongly connected components
    /// of the running subgraph and handles a single member per component; because it runs
    /// periodically, whatever remains of a component is picked up on a later pass. Most nodes
    /// complete without ever being examined here.
    ///
    fn terminate_cycles(&mut self) {
        // Project the running nodes into a graph of their own, weighted by their original ids.
        let running_graph = self.pg.filter_map(
            |node_idx, node_weight| {
                if node_weight.is_running() {
                    Some(node_idx)
                } else {
                    None
                }
            },
            |_edge_idx, _edge_weight| Some(()),
        );
        // NB: kosaraju_scc rather than tarjan_scc, which panics on some graph shapes.
        let running_sccs = petgraph::algo::kosaraju_scc(&running_graph);

        for running_scc in running_sccs {
            // A lone node is only a cycle if it depends on itself.
            let is_self_cycle = running_scc.len() == 1
                && running_graph
                    .find_edge(running_scc[0], running_scc[0])
                    .is_some();
            if running_scc.len() <= 1 && !is_self_cycle {
                continue;
            }

            // A component member which is replaying its recorded deps may be sitting on stale
            // edges that only look cyclic, so we prefer to clear such a member (forcing it to
            // re-run and re-record) over declaring a cycle. Only when every member is executing
            // for real do we terminate one with a cycle error. Either way the highest-id member
            // is chosen, to keep the choice deterministic.
            let (running_candidate, should_terminate) = if let Some(replaying_candidate) =
                running_scc
                    .iter()
                    .filter(|&id| self.pg[running_graph[*id]].is_replaying())
                    .max_by_key(|&id| running_graph[*id])
            {
                (replaying_candidate, false)
            } else {
                (
                    running_scc
                        .iter()
                        .max_by_key(|&id| running_graph[*id])
                        .unwrap(),
                    true,
                )
            };

            test_trace_log!(
                "Cycle {:?}",
                running_scc
                    .iter()
                    .map(|id| {
                        let entry = &self.pg[running_graph[*id]];
                        format!("{:?}: is_replaying: {}", entry.node(), entry.is_replaying())
                    })
                    .collect::<Vec<_>>(),
            );

            // Name the cycle by one simple path from the candidate back around to itself, found
            // by walking to any of its in-component predecessors.
            let running_path: Vec<_> = if is_self_cycle {
                vec![*running_candidate]
            } else {
                let running_predecessor = running_graph
                    .neighbors_directed(*running_candidate, Direction::Incoming)
                    .find(|id| running_scc.contains(id))
                    .unwrap();
                petgraph::algo::all_simple_paths(
                    &running_graph,
                    *running_candidate,
                    running_predecessor,
                    0,
                    None,
                )
                .next()
                .unwrap()
            };

            let candidate = running_graph[*running_candidate];
            if should_terminate {
                let path = running_path
                    .into_iter()
                    .map(|rni| self.pg[running_graph[rni]].node().clone())
                    .collect::<Vec<_>>();
                self.pg[candidate].terminate(ErrorInfo::cyclic(path));
            } else {
                let node = self.pg[candidate].node().clone();
                self.invalidate_from_roots(true, |n| &node == n);
            }
        }
    }

    fn root_ids(&self, roots: &[K]) -> VecDeque<EntryId> {
        roots
            .iter()
            .filter_map(|node| self.entry_id(node))
            .cloned()
            .collect()
    }

    ///
    /// Begins a breadth-first Walk over entry ids from the given roots, following edges in the
    /// given direction. Nodes matching the stop predicate are neither yielded nor walked
    /// through. No ordering beyond reachability is guaranteed.
    ///
    fn walk<F: Fn(&EntryId) -> bool>(
        &self,
        roots: VecDeque<EntryId>,
        direction: Direction,
        stop: F,
    ) -> Walk<'_, K, F> {
        Walk {
            graph: self,
            direction,
            frontier: roots,
            seen: self.pg.visit_map(),
            stop,
        }
    }

    fn clear(&mut self) {
        for eid in self.nodes.values() {
            if let Some(entry) = self.pg.node_weight_mut(*eid) {
                entry.clear(true);
            }
        }
    }

    ///
    /// Clears every started entry matching the predicate, and dirties everything that
    /// transitively depends on one.
    ///
    /// Entries which never started are skipped entirely: their dependents either never observed
    /// a value from them, or were already dirtied back when they were cleared, so revisiting
    /// them would only repeat work.
    ///
    fn invalidate_from_roots<P: Fn(&K) -> bool>(
        &mut self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let root_ids: HashSet<_> = self
            .nodes
            .iter()
            .filter_map(|(node, &entry_id)| {
                if predicate(node) && self.existing_entry(entry_id).is_started() {
                    Some(entry_id)
                } else {
                    None
                }
            })
            .collect();

        if root_ids.is_empty() {
            return InvalidationResult {
                cleared: 0,
                dirtied: 0,
            };
        }

        // Compute the dependents to dirty before mutating anything.
        let transitive_ids = self.dirty_closure_of(&root_ids);

        let invalidation_result = InvalidationResult {
            cleared: root_ids.len(),
            dirtied: transitive_ids.len(),
        };

        // A cleared entry forgets its inputs entirely: the recorded edges go with it.
        for id in &root_ids {
            if let Some(entry) = self.pg.node_weight_mut(*id) {
                entry.clear(false);
            }
            self.remove_outgoing_edges(*id);
        }

        // Dirtied entries keep their edges: if replay later confirms their inputs the edges
        // stay valid, and if it does not, `Graph::replay_failed` removes them then.
        self.dirty_all(&transitive_ids, log_dirtied);

        invalidation_result
    }

    ///
    /// The transitive dependents of the given roots, excluding the roots themselves.
    ///
    /// The walk does not pass through a non-restartable node while it runs: such a node must be
    /// left to finish with the inputs it started from, so its own dependents have nothing to
    /// re-check yet.
    ///
    fn dirty_closure_of(&self, root_ids: &HashSet<EntryId>) -> Vec<EntryId> {
        self.walk(
            root_ids.iter().cloned().collect(),
            Direction::Incoming,
            |&entry_id| {
                let entry = self.existing_entry(entry_id);
                !entry.node().restartable() && entry.is_running()
            },
        )
        .filter(|eid| !root_ids.contains(eid))
        .collect()
    }

    fn dirty_all(&mut self, ids: &[EntryId], log_dirtied: bool) {
        for id in ids {
            if let Some(mut entry) = self.entry_for_id(*id).cloned() {
                if log_dirtied {
                    log::info!("Dirtying {}", entry.node());
                }
                entry.dirty();
            }
        }
    }

    fn remove_outgoing_edges(&mut self, id: EntryId) {
        let edge_ids: Vec<_> = self.pg.edges(id).map(|e| e.id()).collect();
        for edge_id in edge_ids {
            self.pg.remove_edge(edge_id);
        }
    }

    fn visualize(&self, roots: &[K], path: &Path, context: &Context<K>) -> io::Result<()> {
        let mut f = BufWriter::new(File::create(path)?);

        let included = self
            .walk(self.root_ids(roots), Direction::Outgoing, |_| false)
            .collect::<HashSet<_>>();
        let rendered = self.pg.filter_map(
            |node_id, entry| {
                if included.contains(&node_id) {
                    Some(entry.format(context))
                } else {
                    None
                }
            },
            |_, _| Some(String::new()),
        );

        writeln!(
            f,
            "{}",
            dot::Dot::with_config(&rendered, &[dot::Config::EdgeNoLabel])
        )
    }

    fn live_reachable<'g>(
        &'g self,
        roots: &[K],
        context: &Context<K>,
    ) -> impl Iterator<Item = (&'g K, NodeOutput<K>)> + 'g {
        // NB: clones every reachable output, which makes this expensive on big graphs.
        self.live_internal(
            self.walk(self.root_ids(roots), Direction::Outgoing, |_| false)
                .collect(),
            context.clone(),
        )
    }

    fn live<'g>(
        &'g self,
        context: &Context<K>,
    ) -> impl Iterator<Item = (&'g K, NodeOutput<K>)> + 'g {
        self.live_internal(self.pg.node_indices().collect(), context.clone())
    }

    fn live_internal(
        &self,
        entryids: Vec<EntryId>,
        context: Context<K>,
    ) -> impl Iterator<Item = (&K, NodeOutput<K>)> + '_ {
        entryids
            .into_iter()
            .filter_map(move |eid| self.entry_for_id(eid))
            .filter_map(move |entry| entry.peek(&context).map(|i| (entry.node(), i)))
    }

    ///
    /// Materializes a read-only view of the reachable closure of the given roots: outputs of
    /// entries which are observably complete in the given session, and the edges between them.
    ///
    fn snapshot(&self, roots: &[K], version: Version, context: &Context<K>) -> Snapshot<K> {
        let included: Vec<EntryId> = self
            .walk(self.root_ids(roots), Direction::Outgoing, |_| false)
            .collect();

        let mut by_id: HashMap<EntryId, K> = HashMap::default();
        let mut outputs = HashMap::default();
        for id in &included {
            if let Some(entry) = self.entry_for_id(*id) {
                if let Some(output) = entry.peek(context) {
                    by_id.insert(*id, entry.node().clone());
                    outputs.insert(entry.node().clone(), output);
                }
            }
        }

        let mut direct_deps = HashMap::default();
        let mut reverse_deps = HashMap::default();
        for (id, node) in &by_id {
            let entry = self.existing_entry(*id);
            // Direct deps come from the entry's recorded groups to preserve request order; edges
            // to nodes the snapshot cannot produce are filtered.
            let mut seen = HashSet::default();
            let deps: Vec<K> = entry
                .dep_groups()
                .iter()
                .flatten()
                .filter_map(|(dep_id, _)| by_id.get(dep_id).cloned())
                .filter(|dep| seen.insert(dep.clone()))
                .collect();
            let rdeps: Vec<K> = self
                .pg
                .neighbors_directed(*id, Direction::Incoming)
                .filter_map(|rdep_id| by_id.get(&rdep_id).cloned())
                .collect();
            direct_deps.insert(node.clone(), deps);
            reverse_deps.insert(node.clone(), rdeps);
        }

        Snapshot::new(version, outputs, direct_deps, reverse_deps)
    }
}

///
/// The keyed dependency graph: a concurrent arena of entries, plus the machinery that drives
/// them to completion, invalidates them, and re-checks them minimally across invocations.
///
/// Cheap to clone; clones share all state. Cycles are rejected at evaluation time (by the
/// background checker) rather than on edge insertion.
///
#[derive(Clone)]
pub struct Graph<K: Key> {
    inner: Arc<Mutex<InnerGraph<K>>>,
    version: Arc<Mutex<Version>>,
    run_id_generator: Arc<AtomicU32>,
    invalidation_delay: Duration,
    pub(crate) executor: Executor,
}

impl<K: Key> Graph<K> {
    pub fn new(executor: Executor) -> Graph<K> {
        Self::new_with_invalidation_delay(executor, Duration::from_millis(500))
    }

    pub fn new_with_invalidation_delay(
        executor: Executor,
        invalidation_delay: Duration,
    ) -> Graph<K> {
        let inner = Arc::new(Mutex::new(InnerGraph {
            nodes: HashMap::default(),
            pg: StableDiGraph::default(),
        }));
        let _join = executor.native_spawn(Self::cycle_check_task(Arc::downgrade(&inner)));

        Graph {
            inner,
            version: Arc::new(Mutex::new(Version::At(0))),
            run_id_generator: Arc::new(AtomicU32::new(0)),
            invalidation_delay,
            executor,
        }
    }

    ///
    /// Periodically scans for cycles among running nodes, so that the hot request path never
    /// has to check for them itself. Holds only a Weak handle on the graph state, and exits
    /// once the graph has been dropped.
    ///
    async fn cycle_check_task(inner: Weak<Mutex<InnerGraph<K>>>) {
        loop {
            sleep(Duration::from_millis(100)).await;

            match Weak::upgrade(&inner) {
                Some(inner) => inner.lock().terminate_cycles(),
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len()
    }

    ///
    /// The current version of the graph: the version of the most recent change injection or
    /// session start.
    ///
    pub fn version(&self) -> Version {
        *self.version.lock()
    }

    pub(crate) fn generate_run_id(&self) -> RunId {
        RunId(self.run_id_generator.fetch_add(1, Ordering::SeqCst))
    }

    ///
    /// Creates a Context for a new evaluation session against this Graph, using the given
    /// registry of compute functions.
    ///
    /// Each session advances the graph version: values of uncacheable keys recomputed in the new
    /// session which turn out to have changed are stamped at the new version, and their
    /// dependents re-checked.
    ///
    pub fn context(&self, registry: Arc<FunctionRegistry<K>>) -> Context<K> {
        {
            let mut version = self.version.lock();
            *version = version.next();
        }
        Context::new(self.clone(), registry, self.generate_run_id())
    }

    ///
    /// Requests the given group of dst nodes as one batch, optionally in the context of the given
    /// src node.
    ///
    /// All dst entries are created (and their edges added) atomically before any is awaited, and
    /// all outcomes are collected before any is returned. When requested by a src node, the batch
    /// is recorded as a single dependency group of that node.
    ///
    pub(crate) async fn get_group(
        &self,
        src_id: Option<EntryId>,
        context: &Context<K>,
        dst_nodes: Vec<K>,
    ) -> Vec<(K, Result<ValueWithMetadata<K>, ErrorInfo<K>>)> {
        if dst_nodes.is_empty() {
            return Vec::new();
        }

        let results = self.get_group_inner(src_id, context, &dst_nodes).await;

        dst_nodes
            .into_iter()
            .zip(results)
            .map(|(node, (output, _, _))| {
                // A failure of a dep is wrapped for the consuming node; failures of external
                // requests are surfaced as-is.
                let output = if src_id.is_some() {
                    output.map_err(|e| ErrorInfo::transitive(node.clone(), e))
                } else {
                    output
                };
                (node, output)
            })
            .collect()
    }

    pub(crate) async fn get_group_inner(
        &self,
        src_id: Option<EntryId>,
        context: &Context<K>,
        dst_nodes: &[K],
    ) -> Vec<NodeResult<K>> {
        // Resolve (or create) all destinations and their edges under one hold of the graph
        // lock, then release it before any awaiting happens.
        let entries = {
            let mut inner = self.inner.lock();

            let entries: Vec<(EntryId, Entry<K>)> = dst_nodes
                .iter()
                .map(|dst_node| {
                    let dst_id = inner.ensure_entry(dst_node.clone());
                    if let Some(src_id) = src_id {
                        inner.pg.update_edge(src_id, dst_id, ());
                    }
                    test_trace_log!(
                        "Requested {} (by {:?})",
                        inner.existing_entry(dst_id).node(),
                        src_id
                    );
                    (dst_id, inner.existing_entry(dst_id).clone())
                })
                .collect();
            entries
        };

        // Await the states of all destinations concurrently.
        let results = future::join_all(
            entries
                .iter()
                .map(|(dst_id, entry)| self.get_entry_result(*dst_id, entry, context))
                .collect::<Vec<_>>(),
        )
        .await;

        // If this was requested by a node, record the batch as one dependency group.
        if src_id.is_some() {
            let group: Vec<(EntryId, Version)> = entries
                .iter()
                .zip(results.iter())
                .map(|((dst_id, _), (_, version, _))| (*dst_id, *version))
                .collect();
            let has_uncacheable = results.iter().any(|(_, _, uncacheable)| *uncacheable);
            let dep_events: Vec<Event<K>> = results
                .iter()
                .filter_map(|(output, _, _)| output.as_ref().ok())
                .flat_map(|value| value.events().iter().cloned())
                .collect();
            if let Err(e) = context.dep_record_group(group, has_uncacheable, dep_events) {
                return dst_nodes
                    .iter()
                    .map(|_| (Err(e.clone()), Version::initial(), true))
                    .collect();
            }
        }

        results
    }

    ///
    /// Requests one entry, retrying transient invalidation failures.
    ///
    /// Both external requests and requests by a running node are retried: a dirtied dependent
    /// decides for itself (via eager cleaning) whether to restart, so an invalidated dep is
    /// re-requested in place to preserve the requester's progress so far.
    ///
    async fn get_entry_result(
        &self,
        entry_id: EntryId,
        entry: &Entry<K>,
        context: &Context<K>,
    ) -> NodeResult<K> {
        loop {
            let (output, version, uncacheable) = entry.get_node_result(context, entry_id).await;
            match output {
                Err(err) if err.is_invalidated() => {
                    info!(
                        "Injected change during run: retrying `{}` in {:?}...",
                        entry.node(),
                        self.invalidation_delay
                    );
                    sleep(self.invalidation_delay).await;
                }
                output => break (output, version, uncacheable),
            }
        }
    }

    ///
    /// Request the given dst node, optionally in the context of the given src node.
    ///
    /// This method will retry for invalidation until the node completes.
    ///
    pub async fn get(
        &self,
        src_id: Option<EntryId>,
        context: &Context<K>,
        dst_node: K,
    ) -> Result<ValueWithMetadata<K>, ErrorInfo<K>> {
        let mut results = self.get_group(src_id, context, vec![dst_node]).await;
        results.swap_remove(0).1
    }

    ///
    /// Requests the given node externally. Shorthand for `self.get(None, context, node)`.
    ///
    pub async fn create(
        &self,
        node: K,
        context: &Context<K>,
    ) -> Result<ValueWithMetadata<K>, ErrorInfo<K>> {
        self.get(None, context, node).await
    }

    ///
    /// Evaluates the given top-level roots, and returns their aggregated per-key outcomes along
    /// with a consistent Snapshot of the completed subgraph.
    ///
    /// With `keep_going`, every root is driven to completion independently. Without it, the first
    /// root failure cancels all other in-flight work (cooperatively: canceled compute functions
    /// stop at their next dependency request), and the result is guaranteed to carry at least
    /// that failure.
    ///
    pub async fn evaluate(
        &self,
        roots: Vec<K>,
        context: &Context<K>,
        keep_going: bool,
    ) -> EvaluationResult<K> {
        let mut values = HashMap::default();
        let mut errors = HashMap::default();

        if keep_going {
            let results =
                future::join_all(roots.iter().map(|root| self.create(root.clone(), context)))
                    .await;
            for (root, result) in roots.iter().zip(results) {
                match result {
                    Ok(value) => {
                        values.insert(root.clone(), value);
                    }
                    Err(err) => {
                        errors.insert(root.clone(), err);
                    }
                }
            }
        } else {
            let mut in_flight = roots
                .iter()
                .map(|root| {
                    let root = root.clone();
                    async move {
                        let result = self.create(root.clone(), context).await;
                        (root, result)
                    }
                })
                .collect::<FuturesUnordered<_>>();
            while let Some((root, result)) = in_flight.next().await {
                match result {
                    Ok(value) => {
                        values.insert(root, value);
                    }
                    Err(err) => {
                        // Fail fast: dropping the remaining futures drops interest in their
                        // entries, which cancels any work they were the only consumers of.
                        errors.insert(root, err);
                        break;
                    }
                }
            }
        }

        let has_cycle = errors.values().any(ErrorInfo::is_cyclic);
        let catastrophic = errors.values().any(ErrorInfo::is_catastrophic);
        let snapshot = self.snapshot(&roots, context);

        EvaluationResult {
            values,
            errors,
            has_cycle,
            catastrophic,
            snapshot,
        }
    }

    ///
    /// Gets the value of the given node (optionally waiting for it to have changed since the
    /// given LastObserved token), and then returns its new value and a new LastObserved token.
    ///
    pub async fn poll(
        &self,
        node: K,
        token: Option<LastObserved>,
        delay: Option<Duration>,
        context: &Context<K>,
    ) -> (Result<ValueWithMetadata<K>, ErrorInfo<K>>, LastObserved) {
        // If the node is currently settled at the given token, Entry::poll blocks until that
        // stops being true.
        if let Some(LastObserved(version)) = token {
            let entry = {
                let mut inner = self.inner.lock();
                let entry_id = inner.ensure_entry(node.clone());
                inner.existing_entry(entry_id).clone()
            };
            entry.poll(context, version).await;
            if let Some(delay) = delay {
                sleep(delay).await;
            }
        };

        // Re-request the node.
        let (output, version, _) = self
            .get_group_inner(None, context, std::slice::from_ref(&node))
            .await
            .swap_remove(0);
        (output, LastObserved(version))
    }

    ///
    /// The clean short-circuit: decides whether an entry's recorded inputs still hold, so that
    /// its previous output can be promoted without re-running its compute function. Returns
    /// whether any confirmed input was uncacheable.
    ///
    /// On the first changed input the attempt fails, and the entry's recorded dep edges are
    /// dropped so that the fresh run can record its own.
    ///
    pub(crate) async fn clean_by_replay(
        &self,
        entry_id: EntryId,
        run_token: RunToken,
        dep_groups: &[Vec<(EntryId, Version)>],
        entry_version: Option<Version>,
        context: &Context<K>,
    ) -> Result<bool, ()> {
        match self
            .confirm_dep_groups(dep_groups, entry_version, context)
            .await
        {
            Ok(has_uncacheable_deps) => Ok(has_uncacheable_deps),
            Err(()) => {
                self.replay_failed(entry_id, run_token);
                Err(())
            }
        }
    }

    ///
    /// Walks recorded groups in request order, requesting each group's members concurrently and
    /// failing fast: a changed member cancels its group-mates' checks, and later groups are
    /// never requested at all.
    ///
    /// A member counts as unchanged when its version is at most `entry_version` (dirty replay of
    /// a completed entry), or - when no entry version applies because the entry is still mid-run
    /// - when its version still equals the one recorded at the moment it was first observed.
    ///
    async fn confirm_dep_groups(
        &self,
        dep_groups: &[Vec<(EntryId, Version)>],
        entry_version: Option<Version>,
        context: &Context<K>,
    ) -> Result<bool, ()> {
        let mut has_uncacheable_deps = false;
        for group in dep_groups {
            // Resolve the group's entries under the lock. A member which is gone from the graph
            // was deleted, which counts as changed.
            let members: Vec<(EntryId, Version, Entry<K>)> = {
                let inner = self.inner.lock();
                group
                    .iter()
                    .map(|(dep_id, recorded)| {
                        let dep_entry = inner.entry_for_id(*dep_id).cloned().ok_or(())?;
                        Ok((*dep_id, *recorded, dep_entry))
                    })
                    .collect::<Result<_, ()>>()?
            };

            let checks = members.into_iter().map(|(dep_id, recorded, dep_entry)| {
                let context = context.clone();
                async move {
                    let (_, dep_version, uncacheable) =
                        dep_entry.get_node_result(&context, dep_id).await;
                    let unchanged = match entry_version {
                        Some(entry_version) => dep_version.at_most(&entry_version),
                        None => dep_version == recorded,
                    };
                    if unchanged {
                        Ok(uncacheable)
                    } else {
                        log::debug!("{} changed since it was last observed.", dep_entry.node());
                        Err(())
                    }
                }
            });

            for uncacheable in future::try_join_all(checks).await? {
                has_uncacheable_deps |= uncacheable;
            }
        }
        Ok(has_uncacheable_deps)
    }

    ///
    /// Removes the recorded dep edges of an entry whose replay found a change, provided the run
    /// which attempted the replay is still the entry's current run.
    ///
    fn replay_failed(&self, entry_id: EntryId, run_token: RunToken) {
        let mut inner = self.inner.lock();
        let should_remove = match inner.entry_for_id_mut(entry_id) {
            Some(entry) => entry.replay_failed(run_token).is_ok(),
            None => return,
        };
        if !should_remove {
            return;
        }
        inner.remove_outgoing_edges(entry_id);
    }

    ///
    /// Clears the state of all nodes in the Graph by dropping their state fields.
    ///
    pub fn clear(&self) {
        {
            let mut version = self.version.lock();
            *version = version.next();
        }
        let mut inner = self.inner.lock();
        inner.clear()
    }

    ///
    /// Clears the matching nodes (forcing them to re-run) and dirties their transitive
    /// dependents: the tombstone form of change injection, for externally-changed inputs whose
    /// new values are not known up front.
    ///
    pub fn invalidate_from_roots<P: Fn(&K) -> bool>(
        &self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        {
            let mut version = self.version.lock();
            *version = version.next();
        }
        let mut inner = self.inner.lock();
        inner.invalidate_from_roots(log_dirtied, predicate)
    }

    ///
    /// Injects externally-computed values at the given version, and dirties the transitive
    /// dependents of every entry whose value actually changed.
    ///
    /// An injected key whose entry already holds an equal value is a no-op: its version is not
    /// re-stamped, and its dependents are not dirtied. Injection must not overlap an evaluation:
    /// in-flight runs of injected entries are cancelled.
    ///
    /// The given version must be at least the current graph version.
    ///
    pub fn inject(
        &self,
        updates: Vec<(K, K::Value)>,
        new_version: Version,
    ) -> Result<InvalidationResult, ErrorInfo<K>> {
        {
            let mut version = self.version.lock();
            if !version.at_most(&new_version) {
                return Err(ErrorInfo::catastrophic(format!(
                    "Cannot inject at {new_version}: the graph is already at {version}",
                )));
            }
            *version = new_version;
        }

        let mut inner = self.inner.lock();
        let mut changed_roots: HashSet<EntryId> = HashSet::default();
        for (node, value) in updates {
            let id = inner.ensure_entry(node);
            let output: NodeOutput<K> = Ok(ValueWithMetadata::just_value(value));
            let mut entry = inner.existing_entry(id).clone();
            if let Some(existing) = entry.current_output() {
                if outputs_equal(&existing, &output) {
                    // The value is unchanged: do not re-stamp or dirty dependents.
                    continue;
                }
            }
            entry.inject(output, new_version);
            // The injected value has no deps: remove any recorded edges.
            inner.remove_outgoing_edges(id);
            changed_roots.insert(id);
        }

        let dirtied = if changed_roots.is_empty() {
            0
        } else {
            let transitive_ids = inner.dirty_closure_of(&changed_roots);
            inner.dirty_all(&transitive_ids, false);
            transitive_ids.len()
        };

        Ok(InvalidationResult {
            cleared: changed_roots.len(),
            dirtied,
        })
    }

    ///
    /// Garbage collects entries which have neither changed recently nor remained reachable from
    /// the given roots.
    ///
    /// The retained set is the dependency closure of: entries reachable from the roots, entries
    /// whose version is within `window` of the current version, and running entries. The closure
    /// is over direct deps so that the recorded deps of every retained entry remain present.
    /// Returns the number of deleted entries.
    ///
    pub fn delete_old_nodes(&self, roots: &[K], window: u64) -> usize {
        let current = self.version();
        let mut inner = self.inner.lock();

        let mut seeds = inner.root_ids(roots);
        for id in inner.pg.node_indices() {
            let entry = &inner.pg[id];
            let recent = match (entry.version(), current) {
                (Version::At(v), Version::At(c)) => v + window >= c,
                (Version::Minimal, _) => false,
                (_, Version::Minimal) => true,
            };
            if recent || entry.is_running() {
                seeds.push_back(id);
            }
        }

        let retained: HashSet<EntryId> = inner.walk(seeds, Direction::Outgoing, |_| false).collect();
        let to_delete: Vec<EntryId> = inner
            .pg
            .node_indices()
            .filter(|id| !retained.contains(id))
            .collect();

        for id in &to_delete {
            if let Some(entry) = inner.pg.remove_node(*id) {
                test_trace_log!("Deleting node {:?}", entry.node());
                inner.nodes.remove(entry.node());
            }
        }
        to_delete.len()
    }

    ///
    /// Returns a read-only, consistent view of the completed subgraph reachable from the given
    /// roots, for use by downstream consumers.
    ///
    pub fn snapshot(&self, roots: &[K], context: &Context<K>) -> Snapshot<K> {
        let version = self.version();
        let inner = self.inner.lock();
        inner.snapshot(roots, version, context)
    }

    pub fn visualize(&self, roots: &[K], path: &Path, context: &Context<K>) -> io::Result<()> {
        let inner = self.inner.lock();
        inner.visualize(roots, path, context)
    }

    pub fn visit_live_reachable(
        &self,
        roots: &[K],
        context: &Context<K>,
        mut f: impl FnMut(&K, NodeOutput<K>),
    ) {
        let inner = self.inner.lock();
        for (n, v) in inner.live_reachable(roots, context) {
            f(n, v);
        }
    }

    pub fn visit_live(&self, context: &Context<K>, mut f: impl FnMut(&K, NodeOutput<K>)) {
        let inner = self.inner.lock();
        for (n, v) in inner.live(context) {
            f(n, v);
        }
    }
}

///
/// The aggregated outcome of one evaluation: per-root values and errors, evaluation-wide flags,
/// and a Snapshot of the completed subgraph for downstream consumers.
///
pub struct EvaluationResult<K: Key> {
    pub values: HashMap<K, ValueWithMetadata<K>>,
    pub errors: HashMap<K, ErrorInfo<K>>,
    pub has_cycle: bool,
    pub catastrophic: bool,
    pub snapshot: Snapshot<K>,
}

///
/// A token remembering which version of a node a poller last observed.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LastObserved(Version);

///
/// A breadth-first traversal over entry ids. `frontier` holds ids waiting to be visited, and the
/// stop predicate prunes: a stopped id is neither yielded nor expanded, so anything only
/// reachable through it stays unvisited.
///
struct Walk<'a, K: Key, F>
where
    F: Fn(&EntryId) -> bool,
{
    graph: &'a InnerGraph<K>,
    direction: Direction,
    frontier: VecDeque<EntryId>,
    seen: FixedBitSet,
    stop: F,
}

impl<'a, K: Key + 'a, F: Fn(&EntryId) -> bool> Iterator for Walk<'a, K, F> {
    type Item = EntryId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.frontier.pop_front() {
            // `visit` reports whether this is the first time the id has been seen.
            if !self.seen.visit(id) || (self.stop)(&id) {
                continue;
            }

            self.frontier
                .extend(self.graph.pg.neighbors_directed(id, self.direction));
            return Some(id);
        }

        None
    }
}

///
/// Trace logging that compiles away outside of tests.
///
#[macro_export]
macro_rules! test_trace_log {
    ($($arg:tt)+) => {
      #[cfg(test)]
      {
        log::trace!($($arg)+)
      }
    };
}
