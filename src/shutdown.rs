//! Cooperative shutdown for background threads.
//!
//! Workers never receive a message on the channel; they only ever see it
//! disconnect, which happens when the [`ShutdownHandle`] is triggered or
//! dropped. Waiting on the channel doubles as an interruptible sleep.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{error, info};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone)]
pub struct ShutdownToken {
    rx: Receiver<()>,
}

impl ShutdownToken {
    /// Sleep for `duration`; returns false if shutdown was requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(self.rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }
}

/// Owns the shutdown signal and the threads that listen to it.
pub struct ShutdownHandle {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        ShutdownHandle {
            tx: Some(tx),
            rx,
            workers: Vec::new(),
        }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken { rx: self.rx.clone() }
    }

    /// Spawn a named worker thread that receives its own token.
    pub fn spawn<F>(&mut self, name: String, f: F) -> std::io::Result<()>
    where
        F: FnOnce(ShutdownToken) + Send + 'static,
    {
        let token = self.token();
        let handle = thread::Builder::new().name(name).spawn(move || f(token))?;
        self.workers.push(handle);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker and wait for all of them to return.
    pub fn shutdown(mut self) {
        self.tx.take();
        info!("Stopping {} background thread(s)", self.workers.len());
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked during shutdown", name);
            }
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}
