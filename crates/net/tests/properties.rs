//! Property-based tests for byte queues and loopback delivery.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use streamnet::{ByteQueue, NetConfig, Reactor, StreamId};

fn chunks() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..9000), 0..8)
}

// Property: bytes come out in the order they went in, whatever the read sizes
proptest! {
    #[test]
    fn prop_queue_is_fifo(input in chunks(), reads in prop::collection::vec(1usize..6000, 1..16)) {
        let mut queue = ByteQueue::new();
        let expected: Vec<u8> = input.concat();
        for chunk in &input {
            queue.append(chunk);
        }
        prop_assert_eq!(queue.len(), expected.len());

        let mut output = Vec::new();
        let mut sizes = reads.iter().cycle();
        while !queue.is_empty() {
            let mut buf = vec![0u8; *sizes.next().unwrap()];
            let n = queue.extract(&mut buf);
            prop_assert!(n > 0);
            output.extend_from_slice(&buf[..n]);
        }

        prop_assert_eq!(output, expected);
        prop_assert_eq!(queue.len(), 0);
    }
}

// Property: peek followed by consume is the same as extract
proptest! {
    #[test]
    fn prop_peek_consume_matches_extract(input in chunks(), size in 0usize..12000) {
        let mut a = ByteQueue::new();
        for chunk in &input {
            a.append(chunk);
        }
        let mut b = a.dup();

        let mut peeked = vec![0u8; size];
        let n = a.peek(&mut peeked);
        prop_assert_eq!(a.consume(n), n);

        let mut extracted = vec![0u8; size];
        let m = b.extract(&mut extracted);

        prop_assert_eq!(n, m);
        prop_assert_eq!(&peeked[..n], &extracted[..m]);
        prop_assert_eq!(a.to_vec(), b.to_vec());
    }
}

// Property: a duplicate is unaffected by later changes to the source
proptest! {
    #[test]
    fn prop_dup_is_independent(input in chunks(), extra in prop::collection::vec(any::<u8>(), 1..100)) {
        let mut queue = ByteQueue::new();
        for chunk in &input {
            queue.append(chunk);
        }
        let copy = queue.dup();

        queue.append(&extra);
        let len = queue.len();
        queue.consume(len / 2);

        prop_assert_eq!(copy.to_vec(), input.concat());
    }
}

// Property: loopback streams deliver every byte in order regardless of how
// writes and passes interleave
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_loopback_preserves_order(
        writes in prop::collection::vec((prop::collection::vec(any::<u8>(), 1..3000), any::<bool>()), 1..12)
    ) {
        let mut net = Reactor::new(NetConfig::default()).unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&received);
        net.listen(None, None, move |net: &mut Reactor, stream: StreamId| {
            let sink = Rc::clone(&sink);
            net.register_handler(stream, move |net: &mut Reactor, stream: StreamId| {
                let mut buf = [0u8; 1024];
                loop {
                    let n = net.dequeue(stream, &mut buf);
                    if n == 0 {
                        break;
                    }
                    sink.borrow_mut().extend_from_slice(&buf[..n]);
                }
            });
        })
        .unwrap();

        let client = net.connect_loopback().unwrap();
        let mut expected = Vec::new();
        for (data, run_pass) in &writes {
            net.enqueue(client, data).unwrap();
            expected.extend_from_slice(data);
            if *run_pass {
                net.wait(Duration::ZERO);
            }
        }
        net.wait(Duration::ZERO);

        let got = received.borrow().clone();
        prop_assert_eq!(got, expected);
    }
}
