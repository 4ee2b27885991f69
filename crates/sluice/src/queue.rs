//! Bounded job queue shared by submitters and workers.
//!
//! [`JobQueue`] is a fixed-capacity buffer with two disciplines:
//!
//! - [`QueueDiscipline::Fifo`]: first accepted, first available to any free
//!   worker.
//! - [`QueueDiscipline::Priority`]: a max-heap keyed by the caller's priority,
//!   ties broken by arrival order.
//!
//! Producers either fail fast ([`JobQueue::try_push`]) or wait for space until
//! a cancellation token fires ([`JobQueue::push`]). Consumers wait for the
//! next item, queue closure, or cancellation ([`JobQueue::pop`]). Pushing to a
//! closed queue is always a definitive rejection that hands the item back.
//!
//! The backlog lives behind a short-held mutex; wakeups go through two
//! [`Notify`] instances (one for consumers, one for blocked producers). The
//! current depth is mirrored in an atomic so metric readers never touch the
//! lock.

use crate::job::Priority;
use core::cmp::Ordering as CmpOrdering;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::collections::{BinaryHeap, VecDeque};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Ordering applied to queued items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueDiscipline {
    #[default]
    Fifo,
    Priority,
}

/// Why an item could not be enqueued. The item is handed back to the caller.
#[derive(Debug)]
pub enum PushError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue was closed, or the caller's wait for space was cancelled.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

/// Result of waiting on the queue.
#[derive(Debug)]
pub enum Popped<T> {
    Item(T),
    /// The queue is closed and empty.
    Closed,
    /// The caller's cancellation token fired first.
    Cancelled,
}

struct Ranked<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then the older arrival.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Backlog<T> {
    Fifo(VecDeque<T>),
    Priority {
        heap: BinaryHeap<Ranked<T>>,
        next_seq: u64,
    },
}

impl<T> Backlog<T> {
    fn new(discipline: QueueDiscipline, capacity: usize) -> Self {
        // Preallocate modestly; large capacities are rarely reached.
        let initial = capacity.min(1024);
        match discipline {
            QueueDiscipline::Fifo => Self::Fifo(VecDeque::with_capacity(initial)),
            QueueDiscipline::Priority => Self::Priority {
                heap: BinaryHeap::with_capacity(initial),
                next_seq: 0,
            },
        }
    }

    fn push(&mut self, item: T, priority: Priority) {
        match self {
            Self::Fifo(items) => items.push_back(item),
            Self::Priority { heap, next_seq } => {
                heap.push(Ranked {
                    priority,
                    seq: *next_seq,
                    item,
                });
                *next_seq += 1;
            }
        }
    }

    fn pop(&mut self) -> Option<T> {
        match self {
            Self::Fifo(items) => items.pop_front(),
            Self::Priority { heap, .. } => heap.pop().map(|ranked| ranked.item),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Fifo(items) => items.len(),
            Self::Priority { heap, .. } => heap.len(),
        }
    }
}

struct State<T> {
    backlog: Backlog<T>,
    closed: bool,
}

/// A bounded, closable queue with FIFO or priority ordering.
pub struct JobQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    depth: AtomicUsize,
    items: Notify,
    space: Notify,
}

impl<T> JobQueue<T> {
    /// Creates an open queue holding at most `capacity` items.
    pub fn new(capacity: usize, discipline: QueueDiscipline) -> Self {
        Self {
            state: Mutex::new(State {
                backlog: Backlog::new(discipline, capacity),
                closed: false,
            }),
            capacity,
            depth: AtomicUsize::new(0),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Enqueues `item` if there is room, without waiting.
    ///
    /// # Errors
    ///
    /// - [`PushError::Full`] if the queue is at capacity.
    /// - [`PushError::Closed`] if the queue has been closed.
    pub fn try_push(&self, item: T, priority: Priority) -> Result<(), PushError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.backlog.len() >= self.capacity {
                return Err(PushError::Full(item));
            }
            state.backlog.push(item, priority);
            self.depth.store(state.backlog.len(), Ordering::Release);
        }
        self.items.notify_one();
        Ok(())
    }

    /// Enqueues `item`, waiting for space until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] if the queue is closed or the wait is
    /// cancelled.
    pub async fn push(
        &self,
        mut item: T,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<(), PushError<T>> {
        loop {
            // Register interest before checking so a concurrent pop cannot
            // slip its wakeup in between.
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_push(item, priority) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(rejected)) => item = rejected,
                Err(closed) => return Err(closed),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PushError::Closed(item)),
                () = &mut space => {}
            }
        }
    }

    /// Dequeues the next item if one is ready.
    pub fn try_pop(&self) -> Option<T> {
        let item = {
            let mut state = self.state.lock();
            let item = state.backlog.pop();
            self.depth.store(state.backlog.len(), Ordering::Release);
            item
        };
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Waits for the next item, closure of the queue, or cancellation,
    /// whichever comes first. Cancellation is checked before the backlog.
    pub async fn pop(&self, cancel: &CancellationToken) -> Popped<T> {
        self.pop_inner(Some(cancel)).await
    }

    /// Waits for the next item until the queue is closed and empty, ignoring
    /// cancellation. Used by workers draining the backlog during shutdown.
    pub async fn pop_until_closed(&self) -> Popped<T> {
        self.pop_inner(None).await
    }

    async fn pop_inner(&self, cancel: Option<&CancellationToken>) -> Popped<T> {
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Popped::Cancelled;
            }

            let ready = self.items.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Popped::Item(item);
            }
            if self.is_closed() {
                return Popped::Closed;
            }

            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Popped::Cancelled,
                        () = &mut ready => {}
                    }
                }
                None => ready.await,
            }
        }
    }

    /// Closes the queue. Further pushes are rejected; consumers keep receiving
    /// the remaining backlog and then observe [`Popped::Closed`].
    ///
    /// Returns `true` if this call performed the close.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut state = self.state.lock();
            !core::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            self.items.notify_waiters();
            self.space.notify_waiters();
        }
        newly_closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Removes and returns everything still queued, in dequeue order.
    pub fn drain(&self) -> Vec<T> {
        let drained = {
            let mut state = self.state.lock();
            let mut drained = Vec::with_capacity(state.backlog.len());
            while let Some(item) = state.backlog.pop() {
                drained.push(item);
            }
            self.depth.store(0, Ordering::Release);
            drained
        };
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }

    /// Current number of queued items. Lock-free.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
