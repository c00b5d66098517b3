//! In-process execution with the process-wide stdout/stderr redirected into a pipe.
//!
//! The redirected call is presented as an ordinary [`SupervisedJob`], so the
//! telemetry side cannot tell it apart from a child process. Only one
//! redirection can be active at a time; concurrent captures queue on
//! [`REDIRECT`].

#![allow(unsafe_code)]

use crate::error::TrainingResult;
use crate::supervisor::{LineSplit, SupervisedJob};
use std::sync::Mutex;
#[cfg(unix)]
use {
    crate::supervisor::{JobCompletion, LineStream},
    tokio::sync::oneshot,
};

static REDIRECT: Mutex<()> = Mutex::new(());

/// Run `job` on its own thread with fds 1 and 2 pointed at a fresh pipe.
///
/// The descriptors are restored and the pipe closed when `job` returns, which
/// ends the line stream; the job's result arrives through the completion.
#[cfg(unix)]
pub fn capture<F>(split: LineSplit, job: F) -> TrainingResult<SupervisedJob>
where
    F: FnOnce() -> TrainingResult<()> + Send + 'static,
{
    let (reader, writer) = std::io::pipe()?;
    let lines = LineStream::from_reader(reader, split)?;
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new().name("umbra-capture".to_string()).spawn(move || {
        let _serial = REDIRECT.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let result = match unix::Redirect::install(&writer) {
            Ok(redirect) => {
                drop(writer);
                let result = job();
                drop(redirect);
                result
            }
            Err(e) => Err(e.into()),
        };
        let _ = tx.send(result);
    })?;

    Ok(SupervisedJob::new(lines, JobCompletion::from_native(rx)))
}

#[cfg(not(unix))]
pub fn capture<F>(_split: LineSplit, _job: F) -> TrainingResult<SupervisedJob>
where
    F: FnOnce() -> TrainingResult<()> + Send + 'static,
{
    let _ = &REDIRECT;
    Err(crate::error::TrainingError::Config("in-process execution needs a unix platform".to_string()))
}

#[cfg(unix)]
mod unix {
    use std::io::{self, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    /// Saved copies of the original descriptors, put back on drop.
    pub(super) struct Redirect {
        saved: Vec<(RawFd, OwnedFd)>,
    }

    impl Redirect {
        pub(super) fn install(target: &impl AsRawFd) -> io::Result<Self> {
            flush_std();
            let mut redirect = Self { saved: Vec::with_capacity(2) };
            for fd in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
                // SAFETY: dup has no memory-safety preconditions; a non-negative result is a new fd we own.
                let copy = unsafe { libc::dup(fd) };
                if copy < 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: `copy` was just returned by dup and is owned by nothing else.
                redirect.saved.push((fd, unsafe { OwnedFd::from_raw_fd(copy) }));

                // SAFETY: both descriptors are open for the duration of the call.
                if unsafe { libc::dup2(target.as_raw_fd(), fd) } < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(redirect)
        }
    }

    impl Drop for Redirect {
        fn drop(&mut self) {
            flush_std();
            for (fd, saved) in self.saved.iter().rev() {
                // SAFETY: `saved` is an open descriptor owned by this guard.
                if unsafe { libc::dup2(saved.as_raw_fd(), *fd) } < 0 {
                    tracing::error!(fd, error = %io::Error::last_os_error(), "failed to restore descriptor");
                }
            }
        }
    }

    fn flush_std() {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        // SAFETY: fflush(NULL) flushes every C stdio output stream.
        unsafe {
            libc::fflush(std::ptr::null_mut());
        }
    }
}
