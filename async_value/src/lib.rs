// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

// Lints are configured once, in the workspace manifest.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};

///
/// A value produced once by a background task and awaited by any number of subscribers.
///
/// The work is canceled when the `AsyncValue` handle is dropped, or when every subscriber has
/// lost interest. The handle's holder can also deliver out-of-band interrupts, which the
/// producing task observes through `AsyncValueSender::interrupted` and may either resolve (and
/// keep working) or treat as a reason to stop.
///
/// Built from a `tokio::sync::watch` channel carrying the value (whose closure detects
/// subscriber loss) and a `tokio::sync::mpsc` channel carrying interrupts (whose closure signals
/// that the handle was dropped).
///
#[derive(Debug)]
pub struct AsyncValue<T: Clone + Send + Sync + 'static, I: Send + 'static> {
    item_receiver: Weak<watch::Receiver<Option<T>>>,
    interrupt_sender: mpsc::UnboundedSender<I>,
}

impl<T: Clone + Send + Sync + 'static, I: Send + 'static> AsyncValue<T, I> {
    pub fn new() -> (AsyncValue<T, I>, AsyncValueSender<T, I>, AsyncValueReceiver<T>) {
        let (interrupt_sender, interrupt_receiver) = mpsc::unbounded_channel();
        let (item_sender, item_receiver) = watch::channel(None);
        let item_receiver = Arc::new(item_receiver);
        (
            AsyncValue {
                item_receiver: Arc::downgrade(&item_receiver),
                interrupt_sender,
            },
            AsyncValueSender {
                item_sender,
                interrupt_receiver,
            },
            AsyncValueReceiver { item_receiver },
        )
    }

    ///
    /// Subscribes to the value, unless the associated work has already been canceled.
    ///
    pub fn receiver(&self) -> Option<AsyncValueReceiver<T>> {
        self.item_receiver
            .upgrade()
            .map(|item_receiver| AsyncValueReceiver { item_receiver })
    }

    ///
    /// Delivers an interrupt to the producing task, failing if the task has already completed or
    /// been canceled.
    ///
    pub fn try_interrupt(&mut self, interrupt: I) -> Result<(), I> {
        self.interrupt_sender
            .send(interrupt)
            .map_err(|send_error| send_error.0)
    }
}

pub struct AsyncValueReceiver<T: Clone + Send + Sync + 'static> {
    item_receiver: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueReceiver<T> {
    ///
    /// Waits for the value, yielding None if the work was canceled before producing one.
    ///
    pub async fn recv(&self) -> Option<T> {
        let mut item_receiver = (*self.item_receiver).clone();
        loop {
            if let Some(ref value) = *item_receiver.borrow() {
                return Some(value.clone());
            }

            if item_receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct AsyncValueSender<T: Clone + Send + Sync + 'static, I: Send + 'static> {
    item_sender: watch::Sender<Option<T>>,
    interrupt_receiver: mpsc::UnboundedReceiver<I>,
}

impl<T: Clone + Send + Sync + 'static, I: Send + 'static> AsyncValueSender<T, I> {
    pub fn send(self, item: T) {
        let _ = self.item_sender.send(Some(item));
    }

    ///
    /// Waits for the next interrupt, or for cancellation of the work, whichever comes first.
    ///
    /// Returns `Some(interrupt)` for an explicit interrupt, and `None` when the work has been
    /// canceled (either because the `AsyncValue` handle was dropped, or because all receivers went
    /// away). May be called repeatedly: a task that resolves an interrupt can resume waiting.
    ///
    pub async fn interrupted(&mut self) -> Option<I> {
        tokio::select! {
          res = self.interrupt_receiver.recv() => res,
          _ = self.item_sender.closed() => None,
        }
    }
}
