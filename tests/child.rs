//! Child lifecycle end-to-end through the `executor` helper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_io::{ChildProcess, ChildState, Runtime};

const HELPER: &str = env!("CARGO_BIN_EXE_executor");

fn step_until<F: Fn() -> bool>(rt: &Runtime, ready: F) {
    for _ in 0..60 {
        rt.step(Some(Duration::from_millis(100)));
        if ready() {
            return;
        }
    }
    panic!("condition not reached within the stepping budget");
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Lifecycle {
    Started(libc::pid_t),
    Finished(libc::pid_t, i32),
    Killed(libc::pid_t, i32),
}

fn observe(child: &ChildProcess) -> Arc<Mutex<Vec<Lifecycle>>> {
    let events: Arc<Mutex<Vec<Lifecycle>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let events = events.clone();
        child
            .started
            .connect_fn(move |&pid| events.lock().unwrap().push(Lifecycle::Started(pid)));
    }
    {
        let events = events.clone();
        child.finished.connect_fn(move |&(pid, code)| {
            events.lock().unwrap().push(Lifecycle::Finished(pid, code))
        });
    }
    {
        let events = events.clone();
        child.killed.connect_fn(move |&(pid, sig)| {
            events.lock().unwrap().push(Lifecycle::Killed(pid, sig))
        });
    }

    events
}

#[test]
fn successful_run_starts_then_finishes() {
    let rt = Runtime::new().unwrap();
    let child = ChildProcess::with_helper(&rt, HELPER).unwrap();
    let pid = child.pid();

    assert_eq!(child.state(), ChildState::Initializing);

    let events = observe(&child);

    child.set_arguments(&["/bin/sh", "-c", "true"]).unwrap();
    child.invoke().unwrap();

    step_until(&rt, || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, Lifecycle::Finished(..) | Lifecycle::Killed(..)))
    });

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen[0], Lifecycle::Started(pid));
    assert_eq!(*seen.last().unwrap(), Lifecycle::Finished(pid, 0));
    assert_eq!(
        seen.iter()
            .filter(|ev| matches!(ev, Lifecycle::Finished(..) | Lifecycle::Killed(..)))
            .count(),
        1
    );

    // Finished is sticky
    assert_eq!(child.state(), ChildState::Finished);
    assert_eq!(child.state(), ChildState::Finished);
}

#[test]
fn exit_code_is_propagated() {
    let rt = Runtime::new().unwrap();
    let child = ChildProcess::with_helper(&rt, HELPER).unwrap();
    let pid = child.pid();
    let events = observe(&child);

    child.set_arguments(&["/bin/sh", "-c", "exit 7"]).unwrap();
    child.invoke().unwrap();

    step_until(&rt, || {
        events
            .lock()
            .unwrap()
            .contains(&Lifecycle::Finished(pid, 7))
    });
}

#[test]
fn killed_children_report_the_signal() {
    let rt = Runtime::new().unwrap();
    let child = ChildProcess::with_helper(&rt, HELPER).unwrap();
    let pid = child.pid();
    let events = observe(&child);

    child.set_arguments(&["/bin/sh", "-c", "sleep 30"]).unwrap();
    child.invoke().unwrap();
    child.kill().unwrap();

    step_until(&rt, || {
        events
            .lock()
            .unwrap()
            .contains(&Lifecycle::Killed(pid, libc::SIGKILL))
    });

    // terminal reports are exclusive: killed, never finished
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|ev| matches!(ev, Lifecycle::Finished(..))));
}

#[test]
fn helper_validates_staged_commands() {
    let rt = Runtime::new().unwrap();
    let child = ChildProcess::with_helper(&rt, HELPER).unwrap();

    // a directory is not an executable
    assert!(child.set_executable("/etc").is_err());
    // a missing file reports the lookup failure
    assert!(child.set_executable("/no/such/binary").is_err());
    // a real executable is accepted
    child.set_executable("/bin/sh").unwrap();

    child.set_env_var("RELAY_CHILD_CODE", "31").unwrap();
    child
        .set_arguments(&["/bin/sh", "-c", "exit $RELAY_CHILD_CODE"])
        .unwrap();

    let events = observe(&child);
    let pid = child.pid();
    child.invoke().unwrap();

    step_until(&rt, || {
        events
            .lock()
            .unwrap()
            .contains(&Lifecycle::Finished(pid, 31))
    });
}

#[test]
fn invoke_twice_is_a_programmer_error() {
    let rt = Runtime::new().unwrap();
    let child = ChildProcess::with_helper(&rt, HELPER).unwrap();
    let events = observe(&child);
    let pid = child.pid();

    child.set_arguments(&["/bin/sh", "-c", "true"]).unwrap();
    child.invoke().unwrap();
    assert!(child.invoke().is_err());

    step_until(&rt, || {
        events
            .lock()
            .unwrap()
            .contains(&Lifecycle::Finished(pid, 0))
    });
}

#[test]
fn child_stdout_raises_readability() {
    let rt = Runtime::new().unwrap();
    let child = ChildProcess::with_helper(&rt, HELPER).unwrap();
    let events = observe(&child);
    let pid = child.pid();

    let chunks: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    child.set_arguments(&["/bin/sh", "-c", "printf output"]).unwrap();
    child.invoke().unwrap();

    let reader = Arc::new(ChildReader(child, chunks.clone()));
    reader.0.stdout_message.connect(&reader, |r, _| {
        let mut buf = [0u8; 256];
        if let Ok(n) = r.0.read_stdout(&mut buf) {
            r.1.lock().unwrap().extend_from_slice(&buf[..n]);
        }
    });

    step_until(&rt, || {
        events
            .lock()
            .unwrap()
            .contains(&Lifecycle::Finished(pid, 0))
            && chunks.lock().unwrap().as_slice() == b"output"
    });

    assert_eq!(chunks.lock().unwrap().as_slice(), b"output");
}

struct ChildReader(ChildProcess, Arc<Mutex<Vec<u8>>>);
