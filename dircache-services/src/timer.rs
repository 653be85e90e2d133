// SPDX-License-Identifier: LGPL-3.0-only
//! One-shot idle timer driving cache expiry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy)]
enum TimerCommand {
    Restart,
    Stop,
    SetInterval(Duration),
    Shutdown,
}

/// Fires a callback once after `interval` of inactivity.
///
/// The timer stops after firing and stays stopped until [`TtlTimer::restart`]
/// or [`TtlTimer::set_interval`]. The background task exits on
/// [`TtlTimer::shutdown`] or when the handle is dropped.
#[derive(Debug)]
pub struct TtlTimer {
    tx: mpsc::UnboundedSender<TimerCommand>,
    running: Arc<AtomicBool>,
    interval: Mutex<Duration>,
}

impl TtlTimer {
    /// Start a timer on the current tokio runtime.
    pub fn spawn<F>(interval: Duration, on_elapsed: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(run(rx, interval, running.clone(), on_elapsed));

        Self {
            tx,
            running,
            interval: Mutex::new(interval),
        }
    }

    /// Push the deadline out by a full interval, re-arming a stopped timer.
    pub fn restart(&self) {
        self.running.store(true, Ordering::Release);
        let _ = self.tx.send(TimerCommand::Restart);
    }

    /// Disarm without firing.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.send(TimerCommand::Stop);
    }

    /// Change the interval and restart.
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock().unwrap_or_else(PoisonError::into_inner) = interval;
        self.running.store(true, Ordering::Release);
        let _ = self.tx.send(TimerCommand::SetInterval(interval));
    }

    /// Current interval.
    pub fn interval(&self) -> Duration {
        *self.interval.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the background task for good.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.send(TimerCommand::Shutdown);
    }
}

async fn run<F>(
    mut rx: mpsc::UnboundedReceiver<TimerCommand>,
    mut interval: Duration,
    running: Arc<AtomicBool>,
    on_elapsed: F,
) where
    F: Fn() + Send + 'static,
{
    let mut deadline = Some(Instant::now() + interval);
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(TimerCommand::Restart) => {
                    deadline = Some(Instant::now() + interval);
                    running.store(true, Ordering::Release);
                },
                Some(TimerCommand::SetInterval(next)) => {
                    interval = next;
                    deadline = Some(Instant::now() + interval);
                    running.store(true, Ordering::Release);
                },
                Some(TimerCommand::Stop) => {
                    deadline = None;
                    running.store(false, Ordering::Release);
                },
                Some(TimerCommand::Shutdown) | None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                running.store(false, Ordering::Release);
                on_elapsed();
            },
        }
    }
    log::debug!("TTL timer task exiting");
}
