use super::{EventPoller, NotificationHandler, Registry};
use crate::error::ProxyError;
use log::debug;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

/// `select(2)` backed poller. Interest sets are rebuilt from the registry on
/// every call, so the registry is the only state that has to stay coherent.
pub struct SelectPoller {
    registry: Registry,
    spare_time: Duration,
}

impl SelectPoller {
    pub fn new() -> Self {
        Self {
            registry: Registry::with_fd_limit(libc::FD_SETSIZE as RawFd),
            spare_time: Duration::ZERO,
        }
    }
}

impl Default for SelectPoller {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_set() -> libc::fd_set {
    // SAFETY: fd_set is plain data and FD_ZERO fully initialises it.
    unsafe {
        let mut set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }
}

fn to_timeval(wait: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: wait.as_secs() as libc::time_t,
        tv_usec: wait.subsec_micros() as libc::suseconds_t,
    }
}

impl EventPoller for SelectPoller {
    fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn process_pending_events(
        &mut self,
        max_wait: Duration,
        handler: &mut dyn NotificationHandler,
    ) -> Result<usize, ProxyError> {
        let mut read_fds = empty_set();
        let mut write_fds = empty_set();

        // Registry enforces fd < FD_SETSIZE, which keeps FD_SET in bounds.
        for fd in self.registry.read_fds() {
            unsafe { libc::FD_SET(fd, &mut read_fds) };
        }
        for fd in self.registry.write_fds() {
            unsafe { libc::FD_SET(fd, &mut write_fds) };
        }

        let max_fd = self.registry.max_fd();
        let write_ptr = if self.registry.write_count() > 0 {
            &mut write_fds as *mut libc::fd_set
        } else {
            ptr::null_mut()
        };
        let mut timeout = to_timeval(max_wait);

        let started = Instant::now();
        let count_ready = unsafe {
            libc::select(max_fd + 1, &mut read_fds, write_ptr, ptr::null_mut(), &mut timeout)
        };

        if count_ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(ProxyError::Io(err));
        }

        if count_ready == 0 {
            self.spare_time += started.elapsed();
            return Ok(0);
        }

        let mut remaining = count_ready;
        let mut fd: RawFd = 0;
        while remaining > 0 && fd <= max_fd {
            if unsafe { libc::FD_ISSET(fd, &read_fds) } {
                remaining -= 1;
                // Looked up now: an earlier handler in this pass may have
                // dropped or replaced the registration.
                if let Some(token) = self.registry.find_for_read(fd) {
                    if let Err(e) = handler.handle_input_notification(&mut self.registry, fd, token) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        debug!("[SelectPoller] read handler for fd={} failed: {}", fd, e);
                    }
                }
            }

            if !write_ptr.is_null() && unsafe { libc::FD_ISSET(fd, &write_fds) } {
                remaining -= 1;
                if let Some(token) = self.registry.find_for_write(fd) {
                    if let Err(e) = handler.handle_output_notification(&mut self.registry, fd, token) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        debug!("[SelectPoller] write handler for fd={} failed: {}", fd, e);
                    }
                }
            }

            fd += 1;
        }

        Ok(count_ready as usize)
    }

    fn spare_time(&self) -> Duration {
        self.spare_time
    }

    fn clear_spare_time(&mut self) {
        self.spare_time = Duration::ZERO;
    }
}
