//! Queue behavior under random operation sequences and real thread contention.

use proptest::prelude::*;
use rtcore_realtime::{BoundedMpscQueue, Empty, RingBuffer};
use std::collections::VecDeque;
use std::sync::Barrier;

#[derive(Debug, Clone)]
enum Op {
    Push(u16),
    Pop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![any::<u16>().prop_map(Op::Push), Just(Op::Pop)]
}

proptest! {
    #[test]
    fn ring_matches_bounded_fifo(ops in proptest::collection::vec(op(), 0..512)) {
        let mut ring = RingBuffer::<u16, 8>::new();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(v) => {
                    let res = ring.try_push(v);
                    if model.len() == 8 {
                        prop_assert_eq!(res.unwrap_err().into_inner(), v);
                    } else {
                        prop_assert!(res.is_ok());
                        model.push_back(v);
                    }
                }
                Op::Pop => {
                    prop_assert_eq!(ring.try_pop().ok(), model.pop_front());
                }
            }
            prop_assert_eq!(ring.len(), model.len());
            prop_assert!(ring.len() <= ring.capacity());
        }
    }

    #[test]
    fn mpsc_matches_bounded_fifo_single_thread(ops in proptest::collection::vec(op(), 0..512)) {
        let mut queue = BoundedMpscQueue::<u16, 16>::new();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(v) => {
                    let accepted = queue.try_enqueue(v).is_ok();
                    prop_assert_eq!(accepted, model.len() < 16);
                    if accepted {
                        model.push_back(v);
                    }
                }
                Op::Pop => {
                    prop_assert_eq!(queue.try_dequeue().ok(), model.pop_front());
                }
            }
        }
    }
}

#[test]
fn ring_spsc_across_threads_keeps_order() {
    const COUNT: u64 = 100_000;
    let mut ring = RingBuffer::<u64, 64>::new();
    let (mut producer, mut consumer) = ring.split();

    std::thread::scope(|s| {
        s.spawn(move || {
            for i in 0..COUNT {
                let mut item = i;
                while let Err(rejected) = producer.try_push(item) {
                    item = rejected.into_inner();
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match consumer.try_pop() {
                Ok(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                Err(Empty) => std::hint::spin_loop(),
            }
        }
    });
    assert!(ring.is_empty());
}

#[test]
fn mpsc_delivers_every_item_once_in_producer_order() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 25_000;

    let mut queue = BoundedMpscQueue::<u64, 128>::new();
    let (producer, mut consumer) = queue.split();
    let start = Barrier::new(PRODUCERS as usize);

    std::thread::scope(|s| {
        for p in 0..PRODUCERS {
            let producer = producer.clone();
            let start = &start;
            s.spawn(move || {
                start.wait();
                for seq in 0..PER_PRODUCER {
                    let mut item = (p << 32) | seq;
                    while let Err(full) = producer.try_enqueue(item) {
                        item = full.into_inner();
                        std::thread::yield_now();
                    }
                }
            });
        }

        let mut next = [0u64; PRODUCERS as usize];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            let Ok(item) = consumer.try_dequeue() else {
                std::hint::spin_loop();
                continue;
            };
            let (p, seq) = ((item >> 32) as usize, item & 0xffff_ffff);
            assert_eq!(seq, next[p], "producer {p} out of order");
            next[p] += 1;
            received += 1;
        }
        assert!(next.iter().all(|&n| n == PER_PRODUCER));
    });
    assert_eq!(queue.try_dequeue(), Err(Empty));
}

#[test]
fn mpsc_full_hands_item_back_without_losing_others() {
    let queue = BoundedMpscQueue::<String, 2>::new();
    queue.try_enqueue("a".to_owned()).unwrap();
    queue.try_enqueue("b".to_owned()).unwrap();
    let rejected = queue.try_enqueue("c".to_owned()).unwrap_err();
    assert_eq!(rejected.into_inner(), "c");
    assert_eq!(queue.len(), 2);

    let mut queue = queue;
    assert_eq!(queue.try_dequeue().as_deref(), Ok("a"));
    assert_eq!(queue.try_dequeue().as_deref(), Ok("b"));
}
