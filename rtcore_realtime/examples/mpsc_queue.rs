//! Two producer threads feeding one consumer through a bounded MPSC queue.

use rtcore_realtime::{BoundedMpscQueue, BoundedString};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Sample {
    source: BoundedString<8>,
    value: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    rtcore_realtime::init_tracing();

    let exit = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exit);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))?;

    let mut queue = BoundedMpscQueue::<Sample, 16>::new();
    let (producer, mut consumer) = queue.split();

    std::thread::scope(|s| {
        for name in ["P1", "P2"] {
            let producer = producer.clone();
            let exit = &exit;
            s.spawn(move || {
                let mut value = 0;
                while !exit.load(Ordering::Relaxed) {
                    let sample = Sample {
                        source: BoundedString::from(name),
                        value,
                    };
                    match producer.try_enqueue(sample) {
                        Ok(()) => {
                            info!(source = name, value, "produced");
                            value += 1;
                        }
                        Err(_) => info!(source = name, "queue full"),
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            });
        }

        while !exit.load(Ordering::Relaxed) {
            match consumer.try_dequeue() {
                Ok(sample) => info!(source = %sample.source, value = sample.value, "consumed"),
                Err(_) => std::thread::sleep(Duration::from_millis(250)),
            }
        }
    });
    Ok(())
}
