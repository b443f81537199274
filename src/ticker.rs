//! Fixed-rate callback source.
//!
//! Runs a listener on its own thread: once immediately, then every
//! `interval`. Ticks missed while the listener ran long are fired back to
//! back to keep the long-run rate. Not driven by the reactor.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::TickerError;

pub trait TickListener: Send + 'static {
    fn on_tick(&mut self);
}

impl<F> TickListener for F
where
    F: FnMut() + Send + 'static,
{
    fn on_tick(&mut self) {
        (*self)()
    }
}

pub struct Ticker {
    listener: Arc<Mutex<dyn TickListener>>,
    interval: Duration,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start<L: TickListener>(interval: Duration, listener: L) -> Result<Self, TickerError> {
        let mut ticker = Self {
            listener: Arc::new(Mutex::new(listener)),
            interval,
            stop: None,
            thread: None,
        };
        ticker.spawn(interval)?;
        Ok(ticker)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Restarts the tick thread with a new period.
    pub fn change_interval(&mut self, interval: Duration) -> Result<(), TickerError> {
        self.stop();
        self.spawn(interval)
    }

    /// Cancels future ticks and waits for the thread to exit.
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn spawn(&mut self, interval: Duration) -> Result<(), TickerError> {
        if interval.is_zero() {
            return Err(TickerError::ZeroInterval);
        }

        let (tx, rx) = mpsc::channel::<()>();
        let listener = self.listener.clone();
        let thread = thread::Builder::new()
            .name("wsmux-ticker".to_string())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Stop requested or ticker dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Ok(mut listener) = listener.lock() {
                        listener.on_tick();
                    }
                    next += interval;
                }
                debug!("Ticker stopped");
            })?;

        self.interval = interval;
        self.stop = Some(tx);
        self.thread = Some(thread);
        Ok(())
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
