//! Timer ordering, deadlines, cancellation and repeat pacing.

use vitrail_dispatch::EventLoop;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn timers_fire_in_deadline_order_at_or_after_their_deadline() {
    let event_loop = EventLoop::local();
    let start = Instant::now();
    let fired: Arc<Mutex<Vec<(&str, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut tokens = Vec::new();
    for (tag, offset_ms) in [("a", 50u64), ("b", 10), ("c", 30)] {
        let fired = fired.clone();
        tokens.push(event_loop.delay(start + Duration::from_millis(offset_ms), move || {
            fired.lock().unwrap().push((tag, Instant::now()));
        }));
    }

    assert_eq!(
        event_loop.next_timer_deadline(),
        Some(start + Duration::from_millis(10)),
        "the nearest deadline must be the 10 ms one"
    );

    // All three entries popped: the loop drains itself.
    assert_eq!(event_loop.resume(None), 0);

    let fired = fired.lock().unwrap();
    let order: Vec<&str> = fired.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(order, ["b", "c", "a"]);

    for (tag, at) in fired.iter() {
        let offset = match *tag {
            "a" => 50,
            "b" => 10,
            _ => 30,
        };
        assert!(
            *at >= start + Duration::from_millis(offset),
            "timer {tag} fired before its deadline"
        );
    }
}

#[test]
fn dropping_the_token_cancels_the_timer() {
    let event_loop = EventLoop::local();
    let fired = Arc::new(Mutex::new(false));

    let fired2 = fired.clone();
    let token = event_loop.delay(Instant::now() + Duration::from_millis(10), move || {
        *fired2.lock().unwrap() = true;
    });
    drop(token);

    // Something else keeps the loop alive past the cancelled deadline.
    let _fence = event_loop.delay(Instant::now() + Duration::from_millis(40), || {});

    assert_eq!(event_loop.resume(None), 0);
    assert!(!*fired.lock().unwrap(), "a cancelled timer must not fire");
}

#[test]
fn a_stalled_repeat_does_not_replay_missed_ticks() {
    let event_loop = EventLoop::local();
    let fires: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let fires2 = fires.clone();
    let _tick = event_loop.repeat(Duration::from_millis(5), move || {
        fires2.lock().unwrap().push(Instant::now());
    });

    // Stall the loop thread inside a callback for 100 ms.
    event_loop.post(|| thread::sleep(Duration::from_millis(100)));

    let _quit = event_loop.delay(Instant::now() + Duration::from_millis(200), || {
        EventLoop::local().quit(0);
    });

    assert_eq!(event_loop.resume(None), 0);

    let fires = fires.lock().unwrap();
    assert!(!fires.is_empty(), "the repeat must fire after the stall");

    // The first fire lands right after the stall. Catch-up bursts would put
    // ~20 invocations into the following 10 ms; pacing from the stall's end
    // allows at most two (plus scheduling slack).
    let unblocked = fires[0];
    let burst = fires
        .iter()
        .filter(|at| **at <= unblocked + Duration::from_millis(10))
        .count();
    assert!(
        burst <= 3,
        "missed ticks were replayed in a burst: {burst} fires within 10 ms"
    );

    // And the total over ~200 ms stays near the no-catch-up count.
    assert!(
        fires.len() < 25,
        "too many repeat invocations ({}) for a stalled 5 ms repeat over 200 ms",
        fires.len()
    );
}
