//! Single-producer, single-consumer delivery queue.
//!
//! The session worker pushes items as transport events arrive; the stream
//! handle pulls them when the caller asks for the next message. The buffer is
//! unbounded so the transport is never blocked by a slow consumer; a warning
//! is logged when the buffered depth crosses a configured threshold.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug)]
struct Depth {
    buffered: AtomicUsize,
    warn_threshold: usize,
    warned: AtomicBool,
}

impl Depth {
    fn increment(&self) {
        let depth = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        if self.warn_threshold > 0
            && depth >= self.warn_threshold
            && !self.warned.swap(true, Ordering::AcqRel)
        {
            warn!(
                event = "delivery_queue_high_water",
                depth,
                threshold = self.warn_threshold
            );
        }
    }

    fn decrement(&self) {
        let depth = self.buffered.fetch_sub(1, Ordering::AcqRel) - 1;
        if depth < self.warn_threshold / 2 {
            self.warned.store(false, Ordering::Release);
        }
    }
}

/// Creates a connected producer/consumer pair.
///
/// `warn_threshold` of `0` disables the high-water-mark warning.
pub fn delivery_queue<T>(warn_threshold: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(Depth {
        buffered: AtomicUsize::new(0),
        warn_threshold,
        warned: AtomicBool::new(false),
    });
    (
        QueueProducer {
            tx: Some(tx),
            depth: Arc::clone(&depth),
        },
        QueueConsumer { rx, depth },
    )
}

/// Producer half. Owned by the session worker.
#[derive(Debug)]
pub struct QueueProducer<T> {
    tx: Option<mpsc::UnboundedSender<T>>,
    depth: Arc<Depth>,
}

impl<T> QueueProducer<T> {
    /// Appends an item and wakes the consumer if it is parked.
    ///
    /// Returns `false` when the item was dropped because the queue is done or
    /// the consumer has gone away.
    pub fn push(&mut self, item: T) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        self.depth.increment();
        if tx.send(item).is_err() {
            self.depth.decrement();
            self.tx = None;
            return false;
        }
        true
    }

    /// Pushes a final item and marks the queue done.
    pub fn push_terminal(&mut self, item: T) -> bool {
        let pushed = self.push(item);
        self.mark_done();
        pushed
    }

    /// Signals that no more items will be pushed. Idempotent.
    pub fn mark_done(&mut self) {
        self.tx = None;
    }

    pub fn is_done(&self) -> bool {
        self.tx.is_none()
    }
}

/// Consumer half. Owned by the stream handle.
#[derive(Debug)]
pub struct QueueConsumer<T> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<Depth>,
}

impl<T> QueueConsumer<T> {
    /// Waits for the oldest item. `None` once the producer is done and the
    /// buffer has drained.
    pub async fn pull(&mut self) -> Option<T> {
        std::future::poll_fn(|cx| self.poll_pull(cx)).await
    }

    pub fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                self.depth.decrement();
                Poll::Ready(Some(item))
            }
            other => other,
        }
    }

    /// Number of items pushed but not yet pulled.
    pub fn buffered(&self) -> usize {
        self.depth.buffered.load(Ordering::Acquire)
    }

    /// Stops accepting items and drops everything still buffered.
    ///
    /// Returns how many items were discarded.
    pub fn discard(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            self.depth.decrement();
            discarded += 1;
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::delivery_queue;

    #[tokio::test]
    async fn pull_yields_pushed_items_in_order_then_end() {
        let (mut producer, mut consumer) = delivery_queue(0);
        for value in 0..5 {
            assert!(producer.push(value));
        }
        producer.mark_done();

        let mut seen = Vec::new();
        while let Some(value) = consumer.pull().await {
            seen.push(value);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(consumer.pull().await, None);
    }

    #[tokio::test]
    async fn parked_consumer_wakes_on_push() {
        let (mut producer, mut consumer) = delivery_queue::<&'static str>(0);
        let waiter = tokio::spawn(async move { consumer.pull().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(producer.push("first"));

        let pulled = waiter.await.expect("join");
        assert_eq!(pulled, Some("first"));
    }

    #[tokio::test]
    async fn parked_consumer_wakes_on_mark_done() {
        let (mut producer, mut consumer) = delivery_queue::<u8>(0);
        let waiter = tokio::spawn(async move { consumer.pull().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.mark_done();

        assert_eq!(waiter.await.expect("join"), None);
    }

    #[test]
    fn push_after_done_is_dropped() {
        let (mut producer, mut consumer) = delivery_queue(0);
        assert!(producer.push_terminal(1));
        assert!(producer.is_done());
        assert!(!producer.push(2));
        assert_eq!(consumer.buffered(), 1);
    }

    #[test]
    fn discard_drops_buffered_items_and_rejects_new_ones() {
        let (mut producer, mut consumer) = delivery_queue(0);
        producer.push(1);
        producer.push(2);

        assert_eq!(consumer.discard(), 2);
        assert_eq!(consumer.buffered(), 0);
        assert!(!producer.push(3));
    }

    #[test]
    fn depth_tracks_push_and_pull() {
        let (mut producer, mut consumer) = delivery_queue(2);
        producer.push('a');
        producer.push('b');
        producer.push('c');
        assert_eq!(consumer.buffered(), 3);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let first = runtime.block_on(consumer.pull());
        assert_eq!(first, Some('a'));
        assert_eq!(consumer.buffered(), 2);
    }
}
