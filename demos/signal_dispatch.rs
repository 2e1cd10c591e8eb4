//! Minimal signal/slot walkthrough: connect, emit from a worker thread,
//! quit from a timer.

use std::sync::Arc;
use std::time::Duration;

use relay_io::{Runtime, Signal, TimerEvent};

struct Accumulator {
    label: &'static str,
}

impl Accumulator {
    fn record(&self, &(a, b): &(i32, i32)) {
        println!("{}: {} + {} = {}", self.label, a, b, a + b);
    }
}

fn main() {
    env_logger::init();

    let runtime = Runtime::new().expect("runtime construction");

    let sums: Signal<(i32, i32)> = Signal::new();

    let primary = Arc::new(Accumulator { label: "primary" });
    sums.connect(&primary, Accumulator::record);
    sums.connect_fn(|&(a, b)| println!("free slot saw ({}, {})", a, b));

    // emissions may come from any thread; slots run on this one
    let worker = {
        let runtime = runtime.clone();
        let sums = sums.clone();
        std::thread::spawn(move || {
            for i in 0..3 {
                runtime.enqueue(&sums, (i, 10 * i));
                std::thread::sleep(Duration::from_millis(50));
            }
        })
    };

    let deadline = TimerEvent::new(&runtime).expect("timer construction");
    {
        let runtime = runtime.clone();
        deadline.expired.connect_fn(move |_| {
            println!("deadline reached, quitting");
            runtime.quit(0);
        });
    }
    deadline
        .start(Duration::from_millis(400), None)
        .expect("timer arm");

    std::process::exit({
        let code = runtime.exec();
        worker.join().expect("worker join");
        code
    });
}
