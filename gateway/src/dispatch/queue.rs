//! Priority queue for inference dispatch.
//!
//! Producers (HTTP handlers) push records, one consumer task per worker pops
//! them. Ordering is priority-first, FIFO within a priority class. The queue
//! tracks every pushed-but-not-completed record so shutdown can drain.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use inference_proto::TokenResponse;

use crate::dispatch::worker::WorkerError;
use crate::metrics;

/// Capacity of each record's token channel. Bounded so a slow SSE client
/// backpressures the worker instead of buffering unbounded output.
pub const TOKEN_CHANNEL_CAPACITY: usize = 100;

/// One inference submission in flight, from enqueue to terminal event.
///
/// The submitting endpoint keeps the receiver halves of both channels; the
/// record itself moves endpoint -> queue -> consumer task.
pub struct InferenceRequest {
    pub id: String,
    pub model: String,
    pub prompt: String,
    pub max_tokens: i32,
    pub temperature: f32,
    /// Higher number = higher priority.
    pub priority: i32,
    pub submit_time: Instant,
    /// Write end of the token stream.
    pub token_tx: mpsc::Sender<TokenResponse>,
    /// Write end for the single terminal error.
    pub error_tx: oneshot::Sender<WorkerError>,
}

/// Heap entry wrapping a record with its push sequence number.
///
/// The sequence keeps equal (priority, submit_time) keys FIFO: `BinaryHeap`
/// is not stable and `Instant` can tie on coarse clocks.
struct QueuedRequest {
    seq: u64,
    request: InferenceRequest,
}

impl QueuedRequest {
    fn key(&self) -> (i32, Instant, u64) {
        (self.request.priority, self.request.submit_time, self.seq)
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the earlier submit time,
        // then the earlier push.
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.request.submit_time.cmp(&self.request.submit_time))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedRequest {}

struct QueueState {
    heap: BinaryHeap<QueuedRequest>,
    closed: bool,
    /// Pushed and not yet completed (queued + being processed).
    pending: usize,
    next_seq: u64,
}

/// Thread-safe blocking priority queue shared by all producers and consumers.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    /// Wakes one `pop` waiter per push, every waiter on close.
    notify: Notify,
    /// Wakes `wait_drain` callers when `pending` returns to zero.
    drained: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                closed: false,
                pending: 0,
                next_seq: 0,
            }),
            notify: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Enqueue a record and wake one waiting consumer.
    ///
    /// Returns `false` iff the queue is closed; the record is not enqueued
    /// and the caller must surface service-shutting-down to the client.
    pub async fn push(&self, request: InferenceRequest) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return false;
            }
            state.pending += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueuedRequest { seq, request });
            metrics::INFERENCE_QUEUE_DEPTH.set(state.heap.len() as f64);
        }
        self.notify.notify_one();
        true
    }

    /// Wait until a record is available and return the highest-priority one.
    ///
    /// Returns `None` once the queue is closed and empty. Records still
    /// queued at close time are served before that.
    pub async fn pop(&self) -> Option<InferenceRequest> {
        loop {
            // Created before the state check so a push or close landing
            // between the check and the await still wakes us.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.heap.pop() {
                    metrics::INFERENCE_QUEUE_DEPTH.set(state.heap.len() as f64);
                    metrics::INFERENCE_IN_FLIGHT.inc();
                    return Some(entry.request);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark one popped record as completed (success or failure).
    pub async fn done(&self) {
        let mut state = self.state.lock().await;
        state.pending = state.pending.saturating_sub(1);
        metrics::INFERENCE_IN_FLIGHT.dec();
        if state.pending == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Stop accepting new records and release every waiting consumer.
    /// Queued records are not discarded.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Wait until every pushed record has been completed via [`done`].
    ///
    /// [`done`]: PriorityQueue::done
    pub async fn wait_drain(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let state = self.state.lock().await;
                if state.pending == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Current queue depth (records waiting, not counting in-flight ones).
    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(id: &str, priority: i32) -> InferenceRequest {
        let (token_tx, _token_rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let (error_tx, _error_rx) = oneshot::channel();
        InferenceRequest {
            id: id.to_string(),
            model: "default-model".to_string(),
            prompt: "hello".to_string(),
            max_tokens: 10,
            temperature: 0.7,
            priority,
            submit_time: Instant::now(),
            token_tx,
            error_tx,
        }
    }

    #[tokio::test]
    async fn test_pop_orders_by_priority() {
        let queue = PriorityQueue::new();

        assert!(queue.push(request("low", 1)).await);
        assert!(queue.push(request("high", 10)).await);
        assert!(queue.push(request("medium", 5)).await);

        assert_eq!(queue.pop().await.unwrap().id, "high");
        assert_eq!(queue.pop().await.unwrap().id, "medium");
        assert_eq!(queue.pop().await.unwrap().id, "low");
    }

    #[tokio::test]
    async fn test_fifo_within_equal_priority() {
        let queue = PriorityQueue::new();

        let t1 = Instant::now();
        let t2 = t1 + Duration::from_millis(1);
        let t3 = t2 + Duration::from_millis(1);

        let mut first = request("first", 5);
        first.submit_time = t1;
        let mut second = request("second", 5);
        second.submit_time = t2;
        let mut third = request("third", 5);
        third.submit_time = t3;

        queue.push(first).await;
        queue.push(second).await;
        queue.push(third).await;

        assert_eq!(queue.pop().await.unwrap().id, "first");
        assert_eq!(queue.pop().await.unwrap().id, "second");
        assert_eq!(queue.pop().await.unwrap().id, "third");
    }

    #[tokio::test]
    async fn test_mixed_priority_and_time() {
        let queue = PriorityQueue::new();

        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        let mut old_low = request("old-low", 1);
        old_low.submit_time = now;
        let mut new_high = request("new-high", 10);
        new_high.submit_time = later;
        let mut old_high = request("old-high", 10);
        old_high.submit_time = now;

        queue.push(old_low).await;
        queue.push(new_high).await;
        queue.push(old_high).await;

        assert_eq!(queue.pop().await.unwrap().id, "old-high");
        assert_eq!(queue.pop().await.unwrap().id, "new-high");
        assert_eq!(queue.pop().await.unwrap().id, "old-low");
    }

    #[tokio::test]
    async fn test_equal_submit_time_stays_fifo() {
        let queue = PriorityQueue::new();

        let t = Instant::now();
        for i in 0..5 {
            let mut req = request(&format!("r{}", i), 5);
            req.submit_time = t;
            queue.push(req).await;
        }

        for i in 0..5 {
            assert_eq!(queue.pop().await.unwrap().id, format!("r{}", i));
        }
    }

    #[tokio::test]
    async fn test_len_tracks_push_and_pop() {
        let queue = PriorityQueue::new();
        assert_eq!(queue.len().await, 0);

        queue.push(request("1", 1)).await;
        queue.push(request("2", 1)).await;
        assert_eq!(queue.len().await, 2);

        queue.pop().await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_push_after_close_is_rejected() {
        let queue = PriorityQueue::new();
        queue.close().await;
        assert!(!queue.push(request("late", 1)).await);
    }

    #[tokio::test]
    async fn test_pop_on_closed_empty_queue_returns_none() {
        let queue = PriorityQueue::new();
        queue.close().await;
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_does_not_discard_queued_records() {
        let queue = PriorityQueue::new();
        queue.push(request("a", 2)).await;
        queue.push(request("b", 1)).await;
        queue.close().await;

        assert_eq!(queue.pop().await.unwrap().id, "a");
        assert_eq!(queue.pop().await.unwrap().id, "b");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let queue = Arc::new(PriorityQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        // Give the consumer time to block on the empty queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(request("delayed", 1)).await;

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop did not unblock after push")
            .unwrap();
        assert_eq!(popped.unwrap().id, "delayed");
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_close() {
        let queue = Arc::new(PriorityQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close().await;

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pop did not unblock after close")
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let queue = Arc::new(PriorityQueue::new());
        let producers = 5;
        let per_producer = 100;

        let mut handles = Vec::new();
        for p in 0..producers {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                for j in 0..per_producer {
                    queue.push(request(&format!("{}-{}", p, j), j % 10)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.len().await, producers as usize * per_producer as usize);

        // Everything pops out in non-increasing priority order.
        let mut last_priority = i32::MAX;
        for _ in 0..(producers * per_producer) {
            let req = queue.pop().await.unwrap();
            assert!(req.priority <= last_priority);
            last_priority = req.priority;
        }
    }

    #[tokio::test]
    async fn test_multiple_blocking_consumers_each_get_one() {
        let queue = Arc::new(PriorityQueue::new());

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                queue.pop().await.map(|r| r.priority)
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        for priority in [1, 2, 3] {
            queue.push(request(&format!("p{}", priority), priority)).await;
        }

        let mut received = Vec::new();
        for consumer in consumers {
            let priority = tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .expect("consumer did not wake")
                .unwrap();
            received.push(priority.unwrap());
        }
        received.sort();
        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_wait_drain_returns_after_all_done() {
        let queue = Arc::new(PriorityQueue::new());
        queue.push(request("a", 1)).await;
        queue.push(request("b", 1)).await;
        queue.pop().await.unwrap();
        queue.pop().await.unwrap();
        queue.close().await;

        let drain = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_drain().await })
        };

        // Still two records outstanding; drain must not have finished.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        queue.done().await;
        queue.done().await;

        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("wait_drain did not return after last done")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_drain_with_nothing_pending_returns_immediately() {
        let queue = PriorityQueue::new();
        tokio::time::timeout(Duration::from_millis(100), queue.wait_drain())
            .await
            .expect("wait_drain should not block on an idle queue");
    }
}
