use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use fdist_config::log_maint_debug;

/// A maintenance routine invoked on a fixed interval.
///
/// `run_once` handles its own failures; a failed run is retried on the next
/// tick, never inside the same one.
pub trait Maintainer: Send + 'static {
    fn name(&self) -> &'static str;
    fn run_once(&mut self);
}

/// Runs a [`Maintainer`] on its own named thread until stopped or dropped.
pub struct PeriodicJob {
    name: &'static str,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicJob {
    /// First run after `initial_delay`, then every `interval`.
    pub fn spawn<M: Maintainer>(
        mut maintainer: M,
        initial_delay: Duration,
        interval: Duration,
    ) -> io::Result<Self> {
        let name = maintainer.name();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("fdist-{}", name))
            .spawn(move || {
                let mut wait = initial_delay;
                loop {
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Stop requested or job handle dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    log_maint_debug!("Running maintenance job", job = name);
                    maintainer.run_once();
                    wait = interval;
                }
                log_maint_debug!("Maintenance job stopped", job = name);
            })?;

        Ok(Self {
            name,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the job, waiting for a run in progress to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicJob {
    fn drop(&mut self) {
        self.shutdown();
    }
}
