//! A single-owner, channel-actor queue with conditional dequeue.
//!
//! Every [`Queue`] is serviced by exactly one dedicated thread; callers never
//! touch the buffer directly, they exchange messages with the servicing
//! thread over `crossbeam_channel`. This mirrors `original_source/buffer/queue.go`'s
//! goroutine-per-queue design one-to-one: a `select` over request channels
//! plus a conditionally-offered item channel stands in for Go's conditional
//! `case q.items <- buf[0]`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Select, Sender, bounded, unbounded};

use crate::types::ByteLenable;

/// The admission predicate a [`Queue`] evaluates against its head item.
pub type Condition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

fn always_true<T>() -> Condition<T> {
    Arc::new(|_: &T| true)
}

enum Cmd<T> {
    Push(T),
    Unshift(T),
    SetCondition(Condition<T>),
    ReCheck,
    Reset(Sender<Vec<T>>),
    Filter(Box<dyn FnMut(&T) -> bool + Send>, Sender<Vec<T>>),
    Len(Sender<usize>),
    ByteLen(Sender<usize>),
    Buffer(Sender<Vec<T>>),
    Close,
}

/// A mutable ordered sequence of items with byte-length accounting and an
/// admission predicate gating dequeue of the head. See `spec.md` §4.1.
pub struct Queue<T: ByteLenable + Clone + Send + 'static> {
    cmd_tx: Sender<Cmd<T>>,
    item_rx: Receiver<T>,
    handle: Option<JoinHandle<()>>,
}

impl<T: ByteLenable + Clone + Send + 'static> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").finish_non_exhaustive()
    }
}

impl<T: ByteLenable + Clone + Send + 'static> Queue<T> {
    /// Spawns a new queue and its servicing thread.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = unbounded::<Cmd<T>>();
        // Zero-capacity: handing an item off is a rendezvous with the consumer,
        // exactly like Go's unbuffered `items` channel.
        let (item_tx, item_rx) = bounded::<T>(0);

        let handle = std::thread::Builder::new()
            .name("flowport-queue".into())
            .spawn(move || Self::run(cmd_rx, item_tx))
            .expect("spawn queue thread");

        Self {
            cmd_tx,
            item_rx,
            handle: Some(handle),
        }
    }

    fn run(cmd_rx: Receiver<Cmd<T>>, item_tx: Sender<T>) {
        let mut buf: VecDeque<T> = VecDeque::new();
        let mut byte_len: usize = 0;
        let mut cond: Condition<T> = always_true();
        // Once `Close` is received, the buffer still has to drain: every
        // already-queued item must reach a consumer before this actor exits,
        // regardless of what the admission predicate says.
        let mut closing = false;

        loop {
            if closing && buf.is_empty() {
                return;
            }

            let can_emit = buf.front().map(|head| closing || cond(head)).unwrap_or(false);

            let mut sel = Select::new();
            let cmd_idx = sel.recv(&cmd_rx);
            let item_idx = if can_emit { Some(sel.send(&item_tx)) } else { None };

            let oper = sel.select();
            match oper.index() {
                i if i == cmd_idx => match oper.recv(&cmd_rx) {
                    Ok(Cmd::Close) => closing = true,
                    Ok(cmd) => {
                        if !Self::apply(cmd, &mut buf, &mut byte_len, &mut cond) {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                i if Some(i) == item_idx => {
                    let item = buf.pop_front().expect("can_emit implies non-empty");
                    byte_len -= item.byte_len();
                    // The peer may have gone away between `select()` returning
                    // ready and us completing the send; treat that the same
                    // as any other disconnect on the item channel.
                    if oper.send(&item_tx, item).is_err() {
                        return;
                    }
                }
                _ => unreachable!("Select only offers cmd_idx and item_idx"),
            }
        }
    }

    /// Applies one command; returns `false` if the queue should shut down.
    fn apply(
        cmd: Cmd<T>,
        buf: &mut VecDeque<T>,
        byte_len: &mut usize,
        cond: &mut Condition<T>,
    ) -> bool {
        match cmd {
            Cmd::Push(item) => {
                *byte_len += item.byte_len();
                buf.push_back(item);
            }
            Cmd::Unshift(item) => {
                *byte_len += item.byte_len();
                buf.push_front(item);
            }
            Cmd::SetCondition(new_cond) => *cond = new_cond,
            Cmd::ReCheck => {}
            Cmd::Reset(reply) => {
                let removed: Vec<T> = buf.drain(..).collect();
                *byte_len = 0;
                let _ = reply.send(removed);
            }
            Cmd::Filter(mut pred, reply) => {
                let mut removed = Vec::new();
                let mut kept = VecDeque::with_capacity(buf.len());
                for item in buf.drain(..) {
                    if pred(&item) {
                        kept.push_back(item);
                    } else {
                        *byte_len -= item.byte_len();
                        removed.push(item);
                    }
                }
                *buf = kept;
                let _ = reply.send(removed);
            }
            Cmd::Len(reply) => {
                let _ = reply.send(buf.len());
            }
            Cmd::ByteLen(reply) => {
                let _ = reply.send(*byte_len);
            }
            Cmd::Buffer(reply) => {
                let _ = reply.send(buf.iter().cloned().collect());
            }
            Cmd::Close => return false,
        }
        true
    }

    /// Appends an item to the tail. Never blocks; fails only after `close`.
    pub fn push(&self, item: T) -> crate::Result<()> {
        self.cmd_tx.send(Cmd::Push(item)).map_err(|_| crate::Error::Closed)
    }

    /// Prepends an item at the head.
    pub fn unshift(&self, item: T) -> crate::Result<()> {
        self.cmd_tx.send(Cmd::Unshift(item)).map_err(|_| crate::Error::Closed)
    }

    /// Replaces the admission predicate. A `None` condition means "always true".
    pub fn set_condition(&self, cond: Option<Condition<T>>) -> crate::Result<()> {
        self.cmd_tx
            .send(Cmd::SetCondition(cond.unwrap_or_else(always_true)))
            .map_err(|_| crate::Error::Closed)
    }

    /// Forces the predicate to be re-evaluated against the current head
    /// without mutating the queue's contents.
    pub fn re_check(&self) {
        let _ = self.cmd_tx.send(Cmd::ReCheck);
    }

    /// Atomically empties the queue, returning prior contents in order.
    pub fn reset(&self) -> Vec<T> {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(Cmd::Reset(tx)).is_err() {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    /// Retains items for which `pred` returns true; returns removed items in
    /// original order.
    pub fn filter(&self, pred: impl FnMut(&T) -> bool + Send + 'static) -> Vec<T> {
        let (tx, rx) = bounded(1);
        if self
            .cmd_tx
            .send(Cmd::Filter(Box::new(pred), tx))
            .is_err()
        {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    /// Constant-time observable item count.
    pub fn len(&self) -> usize {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(Cmd::Len(tx)).is_err() {
            return 0;
        }
        rx.recv().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constant-time observable byte-length sum.
    pub fn byte_len(&self) -> usize {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(Cmd::ByteLen(tx)).is_err() {
            return 0;
        }
        rx.recv().unwrap_or(0)
    }

    /// A read-only snapshot of the current contents, head first.
    pub fn buffer(&self) -> Vec<T> {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(Cmd::Buffer(tx)).is_err() {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    /// Blocks until an item is available and the predicate accepts the head,
    /// returning and removing it. Equivalent to `queue.data().recv()`.
    pub fn shift(&self) -> crate::Result<T> {
        self.item_rx.recv().map_err(|_| crate::Error::Closed)
    }

    /// The channel `shift` receives from; used by the dispatcher to select
    /// across multiple queues at once.
    pub fn data(&self) -> &Receiver<T> {
        &self.item_rx
    }

    /// Subsequent `push`/`unshift` fail with `Closed`; once the buffer has
    /// drained, `data()`/`shift()` observe end-of-stream.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }
}

impl<T: ByteLenable + Clone + Send + 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ByteLenable + Clone + Send + 'static> Drop for Queue<T> {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueItem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let q: Queue<QueueItem> = Queue::new();
        q.push(QueueItem::new("", "a")).unwrap();
        q.push(QueueItem::new("", "b")).unwrap();
        assert_eq!(q.shift().unwrap().data, "a");
        assert_eq!(q.shift().unwrap().data, "b");
    }

    #[test]
    fn unshift_prepends() {
        let q: Queue<QueueItem> = Queue::new();
        q.push(QueueItem::new("", "b")).unwrap();
        q.unshift(QueueItem::new("", "a")).unwrap();
        assert_eq!(q.shift().unwrap().data, "a");
        assert_eq!(q.shift().unwrap().data, "b");
    }

    #[test]
    fn byte_len_tracks_buffer() {
        let q: Queue<QueueItem> = Queue::new();
        q.push(QueueItem::new("", "abc")).unwrap();
        q.push(QueueItem::new("", "de")).unwrap();
        assert_eq!(q.byte_len(), 5);
        assert_eq!(q.len(), 2);
        q.shift().unwrap();
        assert_eq!(q.byte_len(), 2);
    }

    #[test]
    fn admission_predicate_gates_head() {
        let q: Queue<QueueItem> = Queue::new();
        let allow = Arc::new(AtomicUsize::new(0));
        let allow_clone = allow.clone();
        q.set_condition(Some(Arc::new(move |_: &QueueItem| {
            allow_clone.load(Ordering::SeqCst) > 0
        })))
        .unwrap();

        q.push(QueueItem::new("", "blocked")).unwrap();
        assert!(q.data().recv_timeout(Duration::from_millis(50)).is_err());

        allow.store(1, Ordering::SeqCst);
        q.re_check();
        assert_eq!(q.shift().unwrap().data, "blocked");
    }

    #[test]
    fn reset_drains_in_order() {
        let q: Queue<QueueItem> = Queue::new();
        q.push(QueueItem::new("", "a")).unwrap();
        q.push(QueueItem::new("", "b")).unwrap();
        let removed = q.reset();
        assert_eq!(
            removed.iter().map(|i| i.data.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(q.len(), 0);
        assert_eq!(q.byte_len(), 0);
    }

    #[test]
    fn filter_keeps_matching_removes_rest() {
        let q: Queue<QueueItem> = Queue::new();
        q.push(QueueItem::new("", "$J=X1")).unwrap();
        q.push(QueueItem::new("", "G0X1")).unwrap();
        q.push(QueueItem::new("", "$J=Y1")).unwrap();
        let removed = q.filter(|item| !item.data.starts_with("$J="));
        assert_eq!(removed.len(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.buffer()[0].data, "G0X1");
    }

    #[test]
    fn close_drains_then_ends_stream() {
        let q: Queue<QueueItem> = Queue::new();
        q.push(QueueItem::new("", "a")).unwrap();
        q.close();
        assert_eq!(q.shift().unwrap().data, "a");
        assert!(q.shift().is_err());
        assert!(q.push(QueueItem::new("", "b")).is_err());
    }
}
