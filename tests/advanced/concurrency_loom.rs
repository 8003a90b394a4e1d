#![cfg(all(feature = "advanced-tests", loom))]
//! Concurrency tests for the message queue using loom.
//!
//! These tests exercise `MessageQueue` without any transport. `loom`
//! explores interleavings to ensure per-producer ordering holds and that a
//! concurrent shutdown always releases the consumer.

use loom::{model, sync::Arc, thread};
use tensor_query::{MessageQueue, QueueClosed};

#[test]
fn concurrent_producers_keep_their_order() {
    model(|| {
        let queue = Arc::new(MessageQueue::new());
        let q1 = Arc::clone(&queue);
        let q2 = Arc::clone(&queue);

        let t1 = thread::spawn(move || {
            q1.enqueue((1, 0)).expect("queue open");
            q1.enqueue((1, 1)).expect("queue open");
        });
        let t2 = thread::spawn(move || {
            q2.enqueue((2, 0)).expect("queue open");
        });

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(queue.dequeue().expect("message"));
        }
        t1.join().expect("first producer panicked");
        t2.join().expect("second producer panicked");

        let first: Vec<_> = received.iter().filter(|(p, _)| *p == 1).collect();
        assert_eq!(first, vec![&(1, 0), &(1, 1)]);
        assert!(received.contains(&(2, 0)));
    });
}

#[test]
fn shutdown_releases_blocked_consumer() {
    model(|| {
        let queue: Arc<MessageQueue<u8>> = Arc::new(MessageQueue::new());
        let closer = Arc::clone(&queue);

        let consumer = thread::spawn(move || queue.dequeue());
        closer.shutdown();

        assert_eq!(consumer.join().expect("consumer panicked"), Err(QueueClosed));
    });
}

#[test]
fn message_is_delivered_or_destroyed_once() {
    model(|| {
        let queue: Arc<MessageQueue<u8>> = Arc::new(MessageQueue::new());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || producer_queue.enqueue(7).is_ok());
        let drained = queue.shutdown();
        let accepted = producer.join().expect("producer panicked");

        assert_eq!(usize::from(accepted), drained);
        assert_eq!(queue.try_dequeue(), Err(QueueClosed));
    });
}
