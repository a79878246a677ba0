// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::mem;
use std::pin::pin;
use std::sync::{atomic, Arc};

use crate::context::{Context, DepState, RunId};
use crate::node::{EntryId, ErrorInfo, Event, Key, NodeOutput};
use crate::test_trace_log;
use crate::version::Version;

use async_value::{AsyncValue, AsyncValueReceiver, AsyncValueSender};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

///
/// Identifies one spawned run of a node. Whenever an entry is cleared or overwritten, its token
/// moves on, and the completion (or cancellation) of a run still carrying the old token is
/// discarded. Invalidation can therefore race freely against executing work: stale work loses by
/// token mismatch instead of by holding locks.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunToken(u32);

impl RunToken {
    pub fn initial() -> RunToken {
        RunToken(0)
    }

    fn next(self) -> RunToken {
        RunToken(self.0 + 1)
    }
}

///
/// An out-of-band message delivered to the task executing a node.
///
#[derive(Debug)]
pub(crate) enum NodeInterrupt<K: Key> {
    /// The node was dirtied while running: confirm the deps observed so far, and give the run
    /// up if any of them changed.
    Dirtied,
    /// The node must stop immediately and complete with the given result (cycle termination).
    Aborted(NodeResult<K>),
}

pub type NodeResult<K> = (NodeOutput<K>, Version, bool);

///
/// The lifecycle of a node entry.
///
/// `NotStarted` doubles as "never ran" and "cleared, must re-run"; the two are told apart by
/// whether a previous result is held. A cleared entry keeps its old output solely so that the
/// next completion can tell whether the value really changed, and keeps no dep record, so it can
/// never be promoted back to Completed without executing.
///
#[derive(Debug)]
pub(crate) enum EntryState<K: Key> {
    NotStarted {
        version: Version,
        run_token: RunToken,
        previous_result: Option<EntryResult<K>>,
        pollers: Vec<oneshot::Sender<()>>,
    },
    /// One task is executing (or replaying the recorded deps of) this node. Every concurrent
    /// request subscribes to that task's pending value rather than starting another run, and
    /// the task is canceled once all subscriptions are dropped.
    Running {
        version: Version,
        run_token: RunToken,
        previous_result: Option<EntryResult<K>>,
        pending_value: AsyncValue<NodeResult<K>, NodeInterrupt<K>>,
        is_replaying: bool,
    },
    /// The node holds an output. `version` is the version at which that output last actually
    /// changed, and `dep_groups` is the ordered record of the dep batches the producing run
    /// requested, which the dirty-replay protocol walks.
    Completed {
        version: Version,
        run_token: RunToken,
        result: EntryResult<K>,
        dep_groups: Vec<Vec<(EntryId, Version)>>,
        pollers: Vec<oneshot::Sender<()>>,
    },
}

impl<K: Key> EntryState<K> {
    fn unstarted() -> EntryState<K> {
        EntryState::NotStarted {
            version: Version::initial(),
            run_token: RunToken::initial(),
            previous_result: None,
            pollers: Vec::new(),
        }
    }
}

///
/// The output of a completed run, qualified by how freely it may be reused.
///
#[derive(Clone, Debug)]
pub enum EntryResult<K: Key> {
    /// Reusable by any consumer at any time.
    Clean(NodeOutput<K>),
    /// Possibly stale: a consumer must first confirm, via the recorded dep groups, that no
    /// input changed since this output was produced.
    Dirty(NodeOutput<K>),
    /// Produced by an uncacheable key: reusable only within the session that ran it, and
    /// recomputed from scratch in any later session.
    Uncacheable(NodeOutput<K>, RunId),
    /// Produced downstream of an uncacheable key: reusable within the producing session, and
    /// treated as dirty (re-checked, possibly reused) in later ones.
    UncacheableDependencies(NodeOutput<K>, RunId),
}

impl<K: Key> EntryResult<K> {
    fn new(
        output: NodeOutput<K>,
        context: &Context<K>,
        cacheable: bool,
        has_uncacheable_deps: bool,
    ) -> EntryResult<K> {
        match (cacheable, has_uncacheable_deps) {
            (false, _) => EntryResult::Uncacheable(output, context.run_id()),
            (true, true) => EntryResult::UncacheableDependencies(output, context.run_id()),
            (true, false) => EntryResult::Clean(output),
        }
    }

    fn output(&self) -> &NodeOutput<K> {
        let (EntryResult::Clean(output)
        | EntryResult::Dirty(output)
        | EntryResult::Uncacheable(output, _)
        | EntryResult::UncacheableDependencies(output, _)) = self;
        output
    }

    fn is_clean(&self, context: &Context<K>) -> bool {
        match self {
            EntryResult::Clean(_) => true,
            EntryResult::Dirty(_) => false,
            EntryResult::Uncacheable(_, run_id)
            | EntryResult::UncacheableDependencies(_, run_id) => *run_id == context.run_id(),
        }
    }

    fn has_uncacheable_deps(&self) -> bool {
        matches!(
            self,
            EntryResult::Uncacheable(..) | EntryResult::UncacheableDependencies(..)
        )
    }

    /// True when polling should block on this result: re-requesting it right now would change
    /// nothing.
    fn poll_should_wait(&self, context: &Context<K>) -> bool {
        match self {
            EntryResult::Dirty(_) => false,
            EntryResult::Uncacheable(_, run_id) => *run_id == context.run_id(),
            EntryResult::Clean(_) | EntryResult::UncacheableDependencies(..) => true,
        }
    }

    fn peek(&self, context: &Context<K>) -> Option<NodeOutput<K>> {
        if self.is_clean(context) {
            Some(self.output().clone())
        } else {
            None
        }
    }

    /// Downgrade the result so that consumers must confirm it before reuse.
    fn dirty(&mut self) {
        if !matches!(self, EntryResult::Dirty(_)) {
            *self = EntryResult::Dirty(self.output().clone());
        }
    }

    /// Promote a confirmed result back to a reusable state.
    fn clean(&mut self, context: &Context<K>, cacheable: bool, has_uncacheable_deps: bool) {
        match self {
            EntryResult::Dirty(_) | EntryResult::UncacheableDependencies(..) => {
                *self =
                    EntryResult::new(self.output().clone(), context, cacheable, has_uncacheable_deps);
            }
            confirmed => unreachable!("only an unconfirmed result can be promoted: {confirmed:?}"),
        }
    }
}

///
/// True iff two outputs are semantically equal: values compare by value (ignoring event
/// metadata), and errors compare structurally.
///
pub(crate) fn outputs_equal<K: Key>(a: &NodeOutput<K>, b: &NodeOutput<K>) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => a.value() == b.value(),
        (Err(a), Err(b)) => a == b,
        _ => false,
    }
}

///
/// One cell of the graph: a key plus the lifecycle state of its computation. Entries are cheap
/// cloneable handles onto shared state, so the graph lock never needs to be held while working
/// with one.
///
#[derive(Clone, Debug)]
pub(crate) struct Entry<K: Key> {
    node: Arc<K>,

    state: Arc<Mutex<EntryState<K>>>,
}

impl<K: Key> Entry<K> {
    ///
    /// Constructs an entry without running it. An entry cannot run until the graph has assigned
    /// it an id, which only happens once it is stored, so construction and startup are separate
    /// steps.
    ///
    pub(crate) fn new(node: K) -> Entry<K> {
        Entry {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::unstarted())),
        }
    }

    pub fn node(&self) -> &K {
        &self.node
    }

    ///
    /// Blocks while this entry remains settled at the given version: at a completed result that
    /// polling should wait on, or at a not-started state whose (transient) failure the caller
    /// has already observed. Returns immediately in every other case, including a version
    /// mismatch, so the caller can re-request the node.
    ///
    pub async fn poll(&self, context: &Context<K>, last_seen: Version) {
        let waker = {
            let mut state = self.state.lock();
            let pollers = match &mut *state {
                EntryState::Completed {
                    version,
                    result,
                    pollers,
                    ..
                } if *version == last_seen && result.poll_should_wait(context) => pollers,
                EntryState::NotStarted {
                    version, pollers, ..
                } if *version == last_seen => pollers,
                _ => return,
            };

            // Register interest: the sender is dropped (waking us) as soon as the entry is
            // dirtied, cleared, or overwritten.
            let (sender, receiver) = oneshot::channel();
            pollers.push(sender);
            receiver
        };
        // Await with the lock released.
        let _ = waker.await;
    }

    ///
    /// A clone of this entry's output, if it is usable in the given session without any work.
    ///
    pub fn peek(&self, context: &Context<K>) -> Option<NodeOutput<K>> {
        match &*self.state.lock() {
            EntryState::Completed { result, .. } => result.peek(context),
            _ => None,
        }
    }

    ///
    /// Returns a future for this entry's output and version, starting or restarting execution
    /// if nothing usable is available.
    ///
    /// Subscribers to a run whose task goes away without completing observe a transient
    /// invalidation failure, which the graph's request layer retries.
    ///
    pub(crate) fn get_node_result(
        &self,
        context: &Context<K>,
        entry_id: EntryId,
    ) -> BoxFuture<'static, NodeResult<K>> {
        let mut state = self.state.lock();

        // Without disturbing the state: subscribe to an in-flight run, or hand out a result
        // which is directly usable in this session.
        match &*state {
            EntryState::Running {
                pending_value,
                version,
                ..
            } => {
                if let Some(receiver) = pending_value.receiver() {
                    let version = *version;
                    return async move {
                        receiver
                            .recv()
                            .await
                            .unwrap_or_else(|| (Err(ErrorInfo::invalidated()), version.next(), true))
                    }
                    .boxed();
                }
                // The run was canceled out from under its subscribers: restart it below.
            }
            EntryState::Completed {
                result, version, ..
            } if result.is_clean(context) => {
                return future::ready((
                    result.output().clone(),
                    *version,
                    result.has_uncacheable_deps(),
                ))
                .boxed();
            }
            _ => {}
        }

        // Otherwise this request starts (or restarts) the node.
        let (next_state, receiver, version) =
            match mem::replace(&mut *state, EntryState::unstarted()) {
                EntryState::NotStarted {
                    version,
                    run_token,
                    previous_result,
                    ..
                }
                | EntryState::Running {
                    version,
                    run_token,
                    previous_result,
                    ..
                } => {
                    // No dep record survives in these states: run from scratch.
                    Self::launch(
                        context,
                        self.clone(),
                        entry_id,
                        run_token,
                        version,
                        None,
                        previous_result,
                    )
                }
                EntryState::Completed {
                    version,
                    run_token,
                    result,
                    dep_groups,
                    ..
                } => {
                    assert!(
                        !result.is_clean(context),
                        "a usable result should have been returned above: {result:?}"
                    );
                    // First request since the entry went dirty. A cacheable key gets the chance
                    // to promote its previous output by replaying the recorded groups; an
                    // uncacheable key must execute again in this session regardless.
                    let replay_groups = self.node.cacheable().then_some(dep_groups);
                    Self::launch(
                        context,
                        self.clone(),
                        entry_id,
                        run_token,
                        version,
                        replay_groups,
                        Some(result),
                    )
                }
            };
        *state = next_state;

        async move {
            receiver
                .recv()
                .await
                .unwrap_or_else(|| (Err(ErrorInfo::invalidated()), version.next(), true))
        }
        .boxed()
    }

    ///
    /// Moves the entry to Running by spawning a task for it, and returns the new state together
    /// with a subscription to the task's eventual result.
    ///
    /// While the task replays recorded deps or executes the compute function, it also services
    /// interrupts: a dirtied node confirms the deps it has observed so far (abandoning the run
    /// if any changed), an aborted node completes with the failure it was handed, and the loss
    /// of all subscribers cancels the run.
    ///
    fn launch(
        context_factory: &Context<K>,
        entry: Entry<K>,
        entry_id: EntryId,
        run_token: RunToken,
        version: Version,
        replay_groups: Option<Vec<Vec<(EntryId, Version)>>>,
        previous_result: Option<EntryResult<K>>,
    ) -> (EntryState<K>, AsyncValueReceiver<NodeResult<K>>, Version) {
        let run_token = run_token.next();
        let is_replaying = replay_groups.is_some();
        let context = context_factory.clone_for(entry_id, entry.node().clone());
        let (pending_value, mut sender, receiver) =
            AsyncValue::<NodeResult<K>, NodeInterrupt<K>>::new();

        let task = {
            let entry = entry.clone();
            let context = context.clone();
            async move {
                let mut work = pin!(run_or_replay(
                    &entry,
                    &context,
                    entry_id,
                    run_token,
                    version,
                    replay_groups,
                ));
                let (result, dep_state, emitted) = loop {
                    tokio::select! {
                        finished = &mut work => break finished,
                        interrupt = sender.interrupted() => match interrupt {
                            Some(NodeInterrupt::Dirtied) => {
                                // Confirm what this run has observed so far. If it all still
                                // holds, keep going; if not, abandon the run and let a later
                                // request start over.
                                let so_far = context.dep_groups_so_far(entry.node());
                                if context
                                    .graph()
                                    .clean_by_replay(entry_id, run_token, &so_far, None, &context)
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Some(NodeInterrupt::Aborted(result)) => {
                                let (dep_state, emitted) = context.complete(entry.node());
                                break (Some(result.0), dep_state, emitted);
                            }
                            None => {
                                // Every subscriber lost interest: the work is moot.
                                entry.cancel(run_token);
                                return;
                            }
                        },
                    }
                };
                entry.complete(&context, run_token, sender, dep_state, emitted, result);
            }
        };
        let _join = context.graph().executor.clone().native_spawn(task);

        (
            EntryState::Running {
                version,
                run_token,
                previous_result,
                pending_value,
                is_replaying,
            },
            receiver,
            version,
        )
    }

    ///
    /// Stores the outcome of a run, unless a newer RunToken shows that the run was invalidated
    /// while it executed (in which case the outcome is silently dropped).
    ///
    /// `None` means the run confirmed the previous output by replay: the output and its version
    /// survive untouched. A real output is compared against the previous one, and the entry is
    /// only re-stamped to the current graph version when they differ, so that dependents
    /// observing an unchanged version can keep their own values too. Transient failures are sent
    /// to current subscribers but never stored.
    ///
    fn complete(
        &self,
        context: &Context<K>,
        result_run_token: RunToken,
        sender: AsyncValueSender<NodeResult<K>, NodeInterrupt<K>>,
        dep_state: DepState<K>,
        emitted: Vec<Event<K>>,
        result: Option<NodeOutput<K>>,
    ) {
        let mut state = self.state.lock();
        *state = match mem::replace(&mut *state, EntryState::unstarted()) {
            EntryState::Running {
                version,
                run_token,
                mut previous_result,
                ..
            } if run_token == result_run_token => {
                let DepState {
                    groups: dep_groups,
                    mut dep_events,
                    has_uncacheable_deps,
                } = dep_state;
                match result {
                    None => {
                        // Confirmed by replay.
                        let mut result = previous_result
                            .expect("an entry without a previous output cannot be confirmed by replay");
                        result.clean(context, self.node.cacheable(), has_uncacheable_deps);
                        sender.send((result.output().clone(), version, result.has_uncacheable_deps()));
                        EntryState::Completed {
                            version,
                            run_token,
                            result,
                            dep_groups,
                            pollers: Vec::new(),
                        }
                    }
                    Some(Err(e)) if e.is_transient() => {
                        // Not worth keeping: the next request retries from scratch. The version
                        // still advances, so anything that recorded this run sees a change.
                        if let Some(previous) = previous_result.as_mut() {
                            previous.dirty();
                        }
                        let version = version.next();
                        sender.send((Err(e), version, true));
                        EntryState::NotStarted {
                            version,
                            run_token: run_token.next(),
                            previous_result,
                            pollers: Vec::new(),
                        }
                    }
                    Some(output) => {
                        // A value, or a persistent failure occupying an error-node position.
                        let output = match output {
                            Ok(value) => {
                                dep_events.extend(emitted);
                                Ok(value.merge_events(dep_events))
                            }
                            err => err,
                        };
                        let result = EntryResult::new(
                            output,
                            context,
                            self.node.cacheable(),
                            has_uncacheable_deps,
                        );
                        let changed = previous_result
                            .map(|previous| !outputs_equal(result.output(), previous.output()))
                            .unwrap_or(true);
                        let version = version.stamp(changed, context.graph_version());
                        sender.send((result.output().clone(), version, result.has_uncacheable_deps()));
                        EntryState::Completed {
                            version,
                            run_token,
                            result,
                            dep_groups,
                            pollers: Vec::new(),
                        }
                    }
                }
            }
            stale => {
                test_trace_log!("Ignoring completion of {}: the run was invalidated.", self.node);
                stale
            }
        };
    }

    ///
    /// Resets a canceled run back to NotStarted, unless a newer run has replaced it in the
    /// meantime (in which case there is nothing to do).
    ///
    pub(crate) fn cancel(&self, canceled_run_token: RunToken) {
        let mut state = self.state.lock();
        *state = match mem::replace(&mut *state, EntryState::unstarted()) {
            EntryState::Running {
                version,
                run_token,
                previous_result,
                pending_value,
                ..
            } if run_token == canceled_run_token => {
                test_trace_log!("Canceled {:?} of {}.", run_token, self.node);
                drop(pending_value);
                EntryState::NotStarted {
                    version,
                    run_token: run_token.next(),
                    previous_result,
                    pollers: Vec::new(),
                }
            }
            current => current,
        };
    }

    ///
    /// Overwrites the entry with an externally produced output at the given version.
    ///
    /// Whatever was here before - including an executing run - is superseded: the RunToken
    /// advances so stale work is discarded, the dep record empties (an injected output has no
    /// inputs), and pollers are woken by being dropped.
    ///
    pub(crate) fn inject(&mut self, output: NodeOutput<K>, version: Version) {
        let mut state = self.state.lock();
        test_trace_log!("Overwriting {} at {}", self.node, version);

        let run_token = match mem::replace(&mut *state, EntryState::unstarted()) {
            EntryState::NotStarted { run_token, .. } | EntryState::Completed { run_token, .. } => {
                run_token
            }
            EntryState::Running {
                run_token,
                pending_value,
                ..
            } => {
                drop(pending_value);
                run_token
            }
        };

        *state = EntryState::Completed {
            version,
            run_token: run_token.next(),
            result: EntryResult::Clean(output),
            dep_groups: Vec::new(),
            pollers: Vec::new(),
        };
    }

    ///
    /// Forces this node to re-run the next time it is requested, canceling any in-flight work.
    ///
    /// The caller states, via `edges_remain`, whether the entry's recorded dep edges are still
    /// present in the graph: if they are, the previous output must be downgraded so that
    /// dependents replaying against those edges treat it as unconfirmed.
    ///
    pub(crate) fn clear(&mut self, edges_remain: bool) {
        let state = &mut *self.state.lock();
        test_trace_log!("Clearing {}", self.node);

        let (version, run_token, mut previous_result) =
            match mem::replace(state, EntryState::unstarted()) {
                EntryState::NotStarted {
                    version,
                    run_token,
                    previous_result,
                    ..
                } => (version, run_token, previous_result),
                EntryState::Running {
                    version,
                    run_token,
                    previous_result,
                    pending_value,
                    ..
                } => {
                    drop(pending_value);
                    (version, run_token, previous_result)
                }
                EntryState::Completed {
                    version,
                    run_token,
                    result,
                    ..
                } => (version, run_token, Some(result)),
            };

        if edges_remain {
            if let Some(previous) = previous_result.as_mut() {
                previous.dirty();
            }
        }

        // A fresh RunToken invalidates whatever work was outstanding.
        *state = EntryState::NotStarted {
            version,
            run_token: run_token.next(),
            previous_result,
            pollers: Vec::new(),
        };
    }

    ///
    /// Marks this node as possibly stale: the next request re-checks its recorded deps and only
    /// re-runs it if one of them changed.
    ///
    /// A running node is interrupted rather than restarted, giving it the chance to confirm what
    /// it has observed so far and keep going.
    ///
    pub(crate) fn dirty(&mut self) {
        let state = &mut *self.state.lock();
        test_trace_log!("Dirtying {}", self.node);
        match state {
            EntryState::Completed {
                result, pollers, ..
            } => {
                result.dirty();
                // Dropping the pollers notifies watchers that the value may be changing.
                pollers.clear();
                return;
            }
            EntryState::NotStarted { pollers, .. } => {
                pollers.clear();
                return;
            }
            EntryState::Running { pending_value, .. } => {
                if pending_value.try_interrupt(NodeInterrupt::Dirtied).is_ok() {
                    return;
                }
                // The task is no longer listening for interrupts: cancel it below instead.
            }
        }

        *state = match mem::replace(state, EntryState::unstarted()) {
            EntryState::Running {
                version,
                run_token,
                previous_result,
                pending_value,
                ..
            } => {
                test_trace_log!("Could not interrupt {}: canceling it.", self.node);
                drop(pending_value);
                EntryState::NotStarted {
                    version,
                    run_token,
                    previous_result,
                    pollers: Vec::new(),
                }
            }
            other => other,
        };
    }

    ///
    /// Asks a running node to stop and complete with the given failure. Has no effect on a node
    /// that is not running, and takes effect asynchronously, when the task next polls for
    /// interrupts.
    ///
    pub(crate) fn terminate(&mut self, err: ErrorInfo<K>) {
        if let EntryState::Running {
            pending_value,
            version,
            ..
        } = &mut *self.state.lock()
        {
            test_trace_log!("Aborting {}: {}", self.node, err);
            let _ = pending_value.try_interrupt(NodeInterrupt::Aborted((
                Err(err),
                version.next(),
                true,
            )));
        }
    }

    ///
    /// Notes that replaying this entry's recorded deps found a change, so the current run will
    /// re-execute rather than promote. Fails if the run in question is no longer current.
    ///
    pub(crate) fn replay_failed(&mut self, expected_run_token: RunToken) -> Result<(), ()> {
        match &mut *self.state.lock() {
            EntryState::Running {
                is_replaying,
                run_token,
                ..
            } if *run_token == expected_run_token => {
                *is_replaying = false;
                Ok(())
            }
            _ => Err(()),
        }
    }

    ///
    /// The version at which this node's output last changed.
    ///
    pub(crate) fn version(&self) -> Version {
        match &*self.state.lock() {
            EntryState::NotStarted { version, .. }
            | EntryState::Running { version, .. }
            | EntryState::Completed { version, .. } => *version,
        }
    }

    ///
    /// The output this node currently holds, regardless of dirtiness. Used to detect no-op
    /// injections of an unchanged value.
    ///
    pub(crate) fn current_output(&self) -> Option<NodeOutput<K>> {
        match &*self.state.lock() {
            EntryState::Completed { result, .. } => Some(result.output().clone()),
            _ => None,
        }
    }

    ///
    /// The grouped record of the direct deps requested by this node's last completed run, in
    /// request order.
    ///
    pub(crate) fn dep_groups(&self) -> Vec<Vec<(EntryId, Version)>> {
        match &*self.state.lock() {
            EntryState::Completed { dep_groups, .. } => dep_groups.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(&*self.state.lock(), EntryState::NotStarted { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), EntryState::Running { .. })
    }

    pub fn is_replaying(&self) -> bool {
        matches!(
            &*self.state.lock(),
            EntryState::Running {
                is_replaying: true,
                ..
            }
        )
    }

    pub(crate) fn format(&self, context: &Context<K>) -> String {
        let output = self
            .peek(context)
            .map(|output| format!("{output:?}").chars().take(1024).collect::<String>())
            .unwrap_or_else(|| "<none>".to_string());
        format!("{} == {}", self.node, output)
    }
}

///
/// The body of one run.
///
/// Replaying happens first, when recorded dep groups were provided: a run which confirms every
/// group completes with `None`, standing for "keep the previous output and version". In every
/// other case the key's compute function is dispatched, with a missing registration surfacing as
/// a persistent missing-input failure.
///
async fn run_or_replay<K: Key>(
    entry: &Entry<K>,
    context: &Context<K>,
    entry_id: EntryId,
    run_token: RunToken,
    version: Version,
    replay_groups: Option<Vec<Vec<(EntryId, Version)>>>,
) -> (Option<NodeOutput<K>>, DepState<K>, Vec<Event<K>>) {
    if let Some(groups) = replay_groups {
        if let Ok(has_uncacheable_deps) = context
            .graph()
            .clean_by_replay(entry_id, run_token, &groups, Some(version), context)
            .await
        {
            context
                .stats()
                .cleaning_succeeded
                .fetch_add(1, atomic::Ordering::SeqCst);
            let dep_state = DepState {
                groups,
                dep_events: Vec::new(),
                has_uncacheable_deps,
            };
            return (None, dep_state, Vec::new());
        }
        // Some input changed since the groups were recorded: fall through and recompute from
        // scratch.
        context
            .stats()
            .cleaning_failed
            .fetch_add(1, atomic::Ordering::SeqCst);
    }

    let key = entry.node();
    let result = match context.registry().get(key.kind()) {
        Some(function) => function.compute(key, context).await,
        None => Err(ErrorInfo::missing_input(
            key.clone(),
            format!("no compute function is registered for kind {:?}", key.kind()),
        )),
    };
    context.stats().ran.fetch_add(1, atomic::Ordering::SeqCst);
    let (dep_state, emitted) = context.complete(key);
    (Some(result), dep_state, emitted)
}
