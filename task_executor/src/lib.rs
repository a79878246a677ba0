// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

// Lints are configured once, in the workspace manifest.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

///
/// The pool that node tasks run on: a thin lifecycle wrapper around a tokio multi-thread
/// runtime.
///
/// An Executor either owns its runtime (`new_owned`: shut down explicitly, or when the last
/// clone is dropped) or borrows one that something else keeps alive (`new`: used under the
/// tokio test macros, and wherever several graphs share a single long-lived runtime). The worker
/// thread count of an owned runtime bounds how many compute functions execute in parallel.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Wraps the runtime of the current context, without tying that runtime's lifetime to the
    /// returned Executor. The caller is responsible for keeping the runtime alive for as long
    /// as any clone of the Executor is in use.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Builds an owned multi-thread runtime with the given number of worker threads, leaving
    /// room for `max_threads - num_worker_threads` blocking threads beside them.
    ///
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads - num_worker_threads)
            .enable_all()
            .build()
            .map_err(|e| format!("failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Spawns a future as a task on the runtime, returning its JoinHandle. The task runs to
    /// completion even if the handle is dropped.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Drives a future to completion from synchronous code. Must not be called from a thread
    /// owned by the runtime itself.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// Shuts down an owned runtime, waiting up to `timeout` for in-flight tasks before leaking
    /// them. A no-op for borrowed Executors, and for repeated calls.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout);
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown timed out: some tasks were leaked");
        }
    }
}
