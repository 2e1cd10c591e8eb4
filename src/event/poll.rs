use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::ready::Ready;
use crate::runtime::Runtime;
use crate::signal::Signal;
use crate::sys;

/// Watches a borrowed descriptor for readiness.
///
/// The wrapper does not own `fd`; whoever supplied it closes it. Every
/// wakeup is translated to portable [`Ready`] flags and re-raised
/// through [`PollEvent::activated`].
pub struct PollEvent {
    runtime: Runtime,
    fd: RawFd,
    interest: Ready,
    mask: u64,

    /// `(fd, observed flags)` per wakeup.
    pub activated: Signal<(RawFd, Ready)>,
}

impl PollEvent {
    pub fn new(runtime: &Runtime, fd: RawFd, interest: Ready) -> io::Result<PollEvent> {
        let activated: Signal<(RawFd, Ready)> = Signal::new();
        let mask = sys::to_native(interest);

        let queue = runtime.queue().clone();
        let signal = activated.clone();
        runtime.backend().add(
            fd,
            mask,
            Arc::new(move |fd, native| {
                signal.emit(&queue, (fd, sys::from_native(native)));
            }),
        )?;

        Ok(PollEvent {
            runtime: runtime.clone(),
            fd,
            interest,
            mask,
            activated,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }
}

impl Drop for PollEvent {
    fn drop(&mut self) {
        self.runtime.backend().remove(self.fd, self.mask);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::sys::pipe;

    #[test]
    fn readable_pipe_raises_activated() {
        let rt = Runtime::new().unwrap();
        let (reader, mut writer) = pipe::pair().unwrap();

        let watch = PollEvent::new(&rt, reader.as_raw_fd(), Ready::readable()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            watch
                .activated
                .connect_fn(move |&(fd, flags)| seen.lock().unwrap().push((fd, flags)));
        }

        writer.write_all(b"x").unwrap();
        rt.step(Some(Duration::from_millis(500)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, reader.as_raw_fd());
        assert!(seen[0].1.is_readable());
    }

    #[test]
    fn drop_unregisters() {
        let rt = Runtime::new().unwrap();
        let (reader, _writer) = pipe::pair().unwrap();

        let before = rt.backend().watch_count();
        let watch = PollEvent::new(&rt, reader.as_raw_fd(), Ready::readable()).unwrap();
        assert_eq!(rt.backend().watch_count(), before + 1);

        drop(watch);
        assert_eq!(rt.backend().watch_count(), before);
    }
}
