//! Global admission control with a FIFO wait queue.
//!
//! Callers either receive a slot immediately or join the queue; the queue is
//! drained only by [`AdmissionControl::sweep`], which the runtime calls on a
//! fixed interval. Slots release capacity on drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::{RuntimeError, RuntimeResult};

#[derive(Debug, Default)]
struct AdmissionState {
    active: usize,
    queue: VecDeque<oneshot::Sender<AdmissionSlot>>,
}

/// Shared capacity counter and wait queue.
#[derive(Debug)]
pub(crate) struct AdmissionControl {
    limit: usize,
    state: Mutex<AdmissionState>,
    closed: AtomicBool,
}

/// Outcome of [`AdmissionControl::admit`].
#[derive(Debug)]
pub(crate) enum Admission {
    /// Capacity was available.
    Ready(AdmissionSlot),
    /// The caller joined the queue at `position` (1-based).
    Queued {
        receiver: oneshot::Receiver<AdmissionSlot>,
        position: usize,
    },
}

/// One unit of execution capacity.
#[derive(Debug)]
pub(crate) struct AdmissionSlot {
    control: Option<Arc<AdmissionControl>>,
}

impl AdmissionSlot {
    fn disarm(&mut self) {
        self.control = None;
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.lock().active -= 1;
        }
    }
}

impl AdmissionControl {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(AdmissionState::default()),
            closed: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a slot when capacity is free and nobody is waiting, otherwise
    /// queues the caller.
    pub(crate) fn admit(self: &Arc<Self>) -> RuntimeResult<Admission> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::ShutDown);
        }
        let mut state = self.lock();
        if state.queue.is_empty() && state.active < self.limit {
            state.active += 1;
            return Ok(Admission::Ready(AdmissionSlot {
                control: Some(Arc::clone(self)),
            }));
        }
        let (sender, receiver) = oneshot::channel();
        state.queue.push_back(sender);
        Ok(Admission::Queued {
            receiver,
            position: state.queue.len(),
        })
    }

    /// Hands free capacity to queued callers in enqueue order, returning how
    /// many were admitted.
    pub(crate) fn sweep(self: &Arc<Self>) -> usize {
        let mut admitted = 0;
        let mut state = self.lock();
        while state.active < self.limit {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            let slot = AdmissionSlot {
                control: Some(Arc::clone(self)),
            };
            match waiter.send(slot) {
                Ok(()) => admitted += 1,
                Err(mut slot) => {
                    // Caller went away; reclaim without re-entering the lock.
                    slot.disarm();
                    state.active -= 1;
                }
            }
        }
        admitted
    }

    /// Rejects every queued caller and refuses new ones.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().queue.clear();
    }

    pub(crate) fn active(&self) -> usize {
        self.lock().active
    }

    pub(crate) fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}
