//! Single-threaded timed message loop.
//!
//! A [`Looper`] owns a queue of messages, each addressed to a registered
//! [`Handler`] and stamped with an absolute delivery time on a monotonic
//! microsecond clock. Messages are delivered one at a time, in
//! non-decreasing delivery-time order; messages due at the same instant are
//! delivered in the order they were posted.
//!
//! ```text
//!   any thread                      dispatch thread
//!   ----------                      ---------------
//!   Poster::post(id, msg, delay) -> [ heap ordered by (when_us, seq) ]
//!                                       |
//!                                       v
//!                                   Registry[id].on_message(msg, ctx)
//! ```
//!
//! Handlers live in an arena owned by the loop. A [`HandlerId`] is an arena
//! index plus a generation counter, so an id that outlived its handler never
//! aliases a handler registered later in the same slot. Unregistering a
//! handler purges every queued message addressed to it, and anything still
//! posted to a stale id afterwards is dropped at dispatch time: a message is
//! never delivered to a handler after its unregistration.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Identifier of a handler registered in a [`Looper`].
///
/// Returned by [`Looper::register`] / [`Context::register`]. Copyable, but
/// only meaningful for the looper that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    index: u32,
    generation: u32,
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}.{}", self.index, self.generation)
    }
}

/// A long-lived object that receives messages on the dispatch thread.
///
/// Callbacks never run concurrently with each other, so implementations
/// need no internal locking. `Send` is required only so the whole loop can
/// be moved onto a dedicated thread with [`Looper::spawn`].
pub trait Handler<M>: Send {
    fn on_message(&mut self, msg: M, ctx: &mut Context<'_, M>);
}

struct Entry<M> {
    when_us: i64,
    seq: u64,
    target: HandlerId,
    msg: M,
}

impl<M> Entry<M> {
    fn key(&self) -> (i64, u64) {
        (self.when_us, self.seq)
    }
}

impl<M> PartialEq for Entry<M> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<M> Eq for Entry<M> {}

impl<M> PartialOrd for Entry<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Entry<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct Queue<M> {
    heap: BinaryHeap<Reverse<Entry<M>>>,
    next_seq: u64,
    stopped: bool,
}

struct Shared<M> {
    queue: Mutex<Queue<M>>,
    wakeup: Condvar,
    epoch: Instant,
}

impl<M> Shared<M> {
    fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    /// Block until the earliest message is due or the loop is stopped.
    fn next(&self) -> Option<(HandlerId, M)> {
        let mut queue = self.queue.lock();
        loop {
            if queue.stopped {
                return None;
            }

            let now = self.now_us();
            match queue.heap.peek().map(|Reverse(entry)| entry.when_us) {
                None => self.wakeup.wait(&mut queue),
                Some(when_us) if when_us <= now => {
                    let Reverse(entry) = queue.heap.pop()?;
                    return Some((entry.target, entry.msg));
                }
                Some(when_us) => {
                    let wait = Duration::from_micros((when_us - now) as u64);
                    self.wakeup.wait_for(&mut queue, wait);
                }
            }
        }
    }

    fn purge(&self, target: HandlerId) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.heap.len();
        queue.heap.retain(|Reverse(entry)| entry.target != target);
        before - queue.heap.len()
    }
}

/// Cloneable, thread-safe handle for posting into a [`Looper`].
///
/// Collaborators that run their own threads (socket readers, resolvers)
/// hold a `Poster` and report back exclusively by posting messages, which
/// serializes all of their observable effects onto the dispatch thread.
pub struct Poster<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Poster<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M> Poster<M> {
    /// Enqueue `msg` for `target`, due `delay_us` microseconds from now.
    ///
    /// Negative delays are clamped to zero: the message is dispatched as
    /// soon as the loop is free, after anything already due.
    pub fn post(&self, target: HandlerId, msg: M, delay_us: i64) {
        let when_us = self.shared.now_us() + delay_us.max(0);

        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            tracing::trace!(%target, "looper stopped, message discarded");
            return;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Entry {
            when_us,
            seq,
            target,
            msg,
        }));
        drop(queue);

        self.shared.wakeup.notify_one();
    }

    /// Stop dispatching. Pending messages are discarded and whoever is
    /// blocked in [`Looper::run`] returns.
    pub fn stop(&self) {
        let mut queue = self.shared.queue.lock();
        if !queue.stopped {
            queue.stopped = true;
            let discarded = queue.heap.len();
            queue.heap.clear();
            tracing::debug!(discarded, "looper stop requested");
        }
        drop(queue);
        self.shared.wakeup.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }

    /// Current time on the loop's monotonic clock, in microseconds.
    pub fn now_us(&self) -> i64 {
        self.shared.now_us()
    }

    /// Number of messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }
}

enum SlotState<M> {
    Vacant,
    Occupied(Box<dyn Handler<M>>),
    /// The handler has been taken out for its callback.
    Running,
}

struct Slot<M> {
    generation: u32,
    state: SlotState<M>,
}

/// Arena of registered handlers, indexed by [`HandlerId`].
struct Registry<M> {
    slots: Vec<Slot<M>>,
    free: Vec<u32>,
    live: usize,
}

impl<M> Registry<M> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, handler: Box<dyn Handler<M>>) -> HandlerId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = SlotState::Occupied(handler);
            return HandlerId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            state: SlotState::Occupied(handler),
        });
        HandlerId {
            index,
            generation: 0,
        }
    }

    fn slot_mut(&mut self, id: HandlerId) -> Option<&mut Slot<M>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn remove(&mut self, id: HandlerId) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            return false;
        };
        if matches!(slot.state, SlotState::Vacant) {
            return false;
        }

        // Dropping an occupied handler here releases it. A running one is
        // dropped by `restore` once its callback returns.
        slot.state = SlotState::Vacant;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        true
    }

    fn take(&mut self, id: HandlerId) -> Option<Box<dyn Handler<M>>> {
        let slot = self.slot_mut(id)?;
        match mem::replace(&mut slot.state, SlotState::Running) {
            SlotState::Occupied(handler) => Some(handler),
            other => {
                slot.state = other;
                None
            }
        }
    }

    fn restore(&mut self, id: HandlerId, handler: Box<dyn Handler<M>>) {
        if let Some(slot) = self.slot_mut(id)
            && matches!(slot.state, SlotState::Running)
        {
            slot.state = SlotState::Occupied(handler);
        } else {
            tracing::trace!(%id, "handler unregistered during its own callback, released");
        }
    }
}

fn unregister<M>(registry: &mut Registry<M>, poster: &Poster<M>, id: HandlerId) -> Result<()> {
    if !registry.remove(id) {
        return Err(Error::StaleHandler(id));
    }
    let purged = poster.shared.purge(id);
    tracing::debug!(%id, purged, remaining = registry.live, "handler unregistered");
    Ok(())
}

/// Access to the loop from inside a [`Handler::on_message`] callback.
pub struct Context<'a, M> {
    id: HandlerId,
    registry: &'a mut Registry<M>,
    poster: &'a Poster<M>,
}

impl<M> Context<'_, M> {
    /// Id of the handler currently being called.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn now_us(&self) -> i64 {
        self.poster.now_us()
    }

    pub fn post(&self, target: HandlerId, msg: M, delay_us: i64) {
        self.poster.post(target, msg, delay_us);
    }

    /// Post a message back to the handler currently being called.
    pub fn post_self(&self, msg: M, delay_us: i64) {
        self.poster.post(self.id, msg, delay_us);
    }

    pub fn register(&mut self, handler: Box<dyn Handler<M>>) -> HandlerId {
        let id = self.registry.insert(handler);
        tracing::debug!(%id, registered_by = %self.id, "handler registered");
        id
    }

    /// Unregister `id` and purge its pending messages. Unregistering the
    /// calling handler itself is allowed; it is released when the
    /// callback returns.
    pub fn unregister(&mut self, id: HandlerId) -> Result<()> {
        unregister(self.registry, self.poster, id)
    }

    pub fn stop(&self) {
        self.poster.stop();
    }

    pub fn poster(&self) -> Poster<M> {
        self.poster.clone()
    }
}

/// Timed message queue and single-threaded dispatcher.
pub struct Looper<M> {
    name: String,
    registry: Registry<M>,
    poster: Poster<M>,
}

impl<M: Send + 'static> Looper<M> {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            wakeup: Condvar::new(),
            epoch: Instant::now(),
        });
        Self {
            name: name.to_string(),
            registry: Registry::new(),
            poster: Poster { shared },
        }
    }

    pub fn poster(&self) -> Poster<M> {
        self.poster.clone()
    }

    pub fn register(&mut self, handler: Box<dyn Handler<M>>) -> HandlerId {
        let id = self.registry.insert(handler);
        tracing::debug!(looper = %self.name, %id, "handler registered");
        id
    }

    /// Unregister and release `id`, purging its pending messages.
    ///
    /// Returns [`Error::StaleHandler`] if `id` is not currently registered.
    pub fn unregister(&mut self, id: HandlerId) -> Result<()> {
        unregister(&mut self.registry, &self.poster, id)
    }

    pub fn is_registered(&self, id: HandlerId) -> bool {
        self.registry
            .slots
            .get(id.index as usize)
            .is_some_and(|slot| {
                slot.generation == id.generation && !matches!(slot.state, SlotState::Vacant)
            })
    }

    /// Number of currently registered handlers.
    pub fn handler_count(&self) -> usize {
        self.registry.live
    }

    pub fn post(&self, target: HandlerId, msg: M, delay_us: i64) {
        self.poster.post(target, msg, delay_us);
    }

    pub fn stop(&self) {
        self.poster.stop();
    }

    pub fn now_us(&self) -> i64 {
        self.poster.now_us()
    }

    /// Dispatch on the calling thread until [`stop`](Self::stop) is called.
    ///
    /// Returns the number of messages delivered.
    pub fn run(&mut self) -> usize {
        tracing::debug!(looper = %self.name, handlers = self.registry.live, "looper running");

        let mut delivered = 0;
        while let Some((target, msg)) = self.poster.shared.next() {
            if self.dispatch(target, msg) {
                delivered += 1;
            }
        }

        tracing::debug!(looper = %self.name, delivered, "looper stopped");
        delivered
    }

    /// Dispatch on a dedicated thread named after the looper.
    pub fn spawn(mut self) -> std::io::Result<LooperThread<M>> {
        let poster = self.poster.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                self.run();
                self
            })?;
        Ok(LooperThread { handle, poster })
    }

    /// Deliver `msg` immediately, bypassing the queue and the stop flag.
    #[cfg(test)]
    pub(crate) fn dispatch_now(&mut self, target: HandlerId, msg: M) -> bool {
        self.dispatch(target, msg)
    }

    fn dispatch(&mut self, target: HandlerId, msg: M) -> bool {
        let Some(mut handler) = self.registry.take(target) else {
            tracing::debug!(looper = %self.name, %target, "dropping message for unregistered handler");
            return false;
        };

        let mut ctx = Context {
            id: target,
            registry: &mut self.registry,
            poster: &self.poster,
        };
        handler.on_message(msg, &mut ctx);
        self.registry.restore(target, handler);
        true
    }
}

/// A [`Looper`] running on its own thread.
pub struct LooperThread<M> {
    handle: JoinHandle<Looper<M>>,
    poster: Poster<M>,
}

impl<M> LooperThread<M> {
    pub fn poster(&self) -> Poster<M> {
        self.poster.clone()
    }

    pub fn stop(&self) {
        self.poster.stop();
    }

    /// Wait for the loop to stop and get it back.
    pub fn join(self) -> thread::Result<Looper<M>> {
        self.handle.join()
    }
}
