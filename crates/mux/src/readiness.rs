use std::{io, os::fd::RawFd, time::Duration};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};

/// How a descriptor takes part in readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The poller reports readiness changes of the descriptor.
    Polled,
    /// The poller refused the descriptor. Reads on it never block (regular
    /// files), so it is always considered ready.
    AlwaysReady,
}

/// Readiness notification over a set of descriptors.
///
/// Notifications are edge triggered: after a descriptor was reported ready it is
/// reported again only once a read on it returned
/// [`WouldBlock`](io::ErrorKind::WouldBlock) and new data arrived.
pub trait Readiness {
    /// Watch `fd` for readable and hang-up conditions, reported as `token`.
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<Registration>;

    /// Stop watching `fd`.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait until at least one descriptor is ready or `timeout` elapsed, `None`
    /// waits indefinitely. Tokens of ready descriptors are appended to `ready`.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Token>) -> io::Result<()>;
}

/// [`Readiness`] backed by the platform poller (epoll, kqueue) through `mio`.
pub struct MioReadiness {
    poll: Poll,
    events: Events,
}

impl MioReadiness {
    /// Create a poller that reports at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

impl Readiness for MioReadiness {
    fn register(&mut self, fd: RawFd, token: Token) -> io::Result<Registration> {
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => Ok(Registration::Polled),
            // epoll rejects regular files with EPERM.
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                log::trace!("fd={} can't be polled, treat as always ready", fd);
                Ok(Registration::AlwaysReady)
            }
            Err(err) => Err(err),
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Token>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        for event in self.events.iter() {
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready.push(event.token());
            }
        }

        Ok(())
    }
}
