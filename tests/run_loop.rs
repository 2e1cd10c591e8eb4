//! Loop-level scenarios mixing descriptor sources with queued work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_io::{Runtime, Signal, TimerEvent};

#[test]
fn timer_slot_can_quit_the_loop() {
    let rt = Runtime::new().unwrap();
    let timer = TimerEvent::new(&rt).unwrap();

    {
        let handle = rt.clone();
        timer.expired.connect_fn(move |_| handle.quit(5));
    }

    timer.start(Duration::from_millis(20), None).unwrap();
    assert_eq!(rt.exec(), 5);
}

#[test]
fn probe_with_idle_descriptors_reports_nothing() {
    let rt = Runtime::new().unwrap();
    let _timer = TimerEvent::new(&rt).unwrap(); // registered but never armed

    assert!(!rt.poll(Some(Duration::ZERO)).unwrap());
}

#[test]
fn emissions_from_worker_threads_reach_the_loop_thread() {
    let rt = Runtime::new().unwrap();
    let sig: Signal<usize> = Signal::new();

    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        let hits = hits.clone();
        let handle = rt.clone();
        sig.connect_fn(move |&value| {
            seen.lock().unwrap().push(value);
            if hits.fetch_add(1, Ordering::SeqCst) + 1 == 8 {
                handle.quit(0);
            }
        });
    }

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let rt = rt.clone();
            let sig = sig.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis((5 * (i % 3)) as u64));
                assert!(rt.enqueue(&sig, i));
            })
        })
        .collect();

    assert_eq!(rt.exec(), 0);
    for worker in workers {
        worker.join().unwrap();
    }

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
}
