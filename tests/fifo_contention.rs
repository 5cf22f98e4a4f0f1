//! Cross-thread fifo delivery under producer contention.

use vitrail_dispatch::EventLoop;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const PRODUCERS: usize = 8;
const PER_PRODUCER: u32 = 100_000;

#[test]
fn every_post_runs_exactly_once_in_producer_order() {
    let event_loop = EventLoop::local();
    let seen: Arc<Mutex<Vec<(usize, u32)>>> =
        Arc::new(Mutex::new(Vec::with_capacity(PRODUCERS * PER_PRODUCER as usize)));

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        let handle = event_loop.handle();
        let seen = seen.clone();
        producers.push(thread::spawn(move || {
            for tag in 0..PER_PRODUCER {
                let seen = seen.clone();
                handle.post(move || seen.lock().unwrap().push((producer, tag)));
            }
        }));
    }

    // Quit once everything has arrived; the repeat also keeps the loop from
    // draining itself while producers are still ramping up.
    let watched = seen.clone();
    let _watcher = event_loop.repeat(Duration::from_millis(5), move || {
        if watched.lock().unwrap().len() == PRODUCERS * PER_PRODUCER as usize {
            EventLoop::local().quit(0);
        }
    });

    assert_eq!(event_loop.resume(None), 0);

    for producer in producers {
        producer.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen.len(),
        PRODUCERS * PER_PRODUCER as usize,
        "every post must be delivered exactly once"
    );

    // FIFO per producer: each producer's tag subsequence is strictly
    // increasing, i.e. exactly 0, 1, 2, ...
    let mut next_tag = [0u32; PRODUCERS];
    for (producer, tag) in seen.iter() {
        assert_eq!(
            *tag, next_tag[*producer],
            "posts from producer {producer} arrived out of order"
        );
        next_tag[*producer] += 1;
    }
}
