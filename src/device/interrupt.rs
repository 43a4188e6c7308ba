//! Interrupt delivery and the DPC rendezvous.
//!
//! The enumeration plumbing delivers interrupts as messages on a channel;
//! the dispatch thread runs the engine's ISR for each one and, when the
//! interrupt is claimed, its DPC. Readers block on [`DpcEvent`], a
//! manual-reset event the DPC signals after publishing the cursor.

use std::sync::mpsc;
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::engine::CxEngine;
use std::sync::Arc;

pub type IrqSender = mpsc::Sender<()>;
pub type IrqReceiver = mpsc::Receiver<()>;

/// Creates the interrupt delivery channel between the interrupt source
/// and the dispatch thread.
pub fn irq_channel() -> (IrqSender, IrqReceiver) {
    mpsc::channel()
}

/// Manual-reset event: `clear` then `wait_timeout` pairs with `set` from
/// the DPC. Waking does not consume the signal; readers clear explicitly
/// before waiting, exactly like the edge-triggered rendezvous it models.
#[derive(Default)]
pub struct DpcEvent {
    signalled: Mutex<bool>,
    cvar: Condvar,
}

impl DpcEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signalled = lock_ignore_poison(&self.signalled);
        *signalled = true;
        self.cvar.notify_all();
    }

    pub fn clear(&self) {
        *lock_ignore_poison(&self.signalled) = false;
    }

    /// Waits until the event is signalled or `timeout` elapses; returns
    /// whether it was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = lock_ignore_poison(&self.signalled);
        while !*signalled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(signalled, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            signalled = guard;
        }
        true
    }
}

fn lock_ignore_poison<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Spawns the dispatch thread: ISR per delivered interrupt, DPC when
/// claimed. The thread exits when the interrupt source hangs up.
pub fn spawn_dispatch(engine: Arc<CxEngine>, irq: IrqReceiver) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("cx-irq".into())
        .spawn(move || {
            while irq.recv().is_ok() {
                if engine.isr() {
                    engine.dpc();
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_times_out_when_unset() {
        let event = DpcEvent::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn set_wakes_a_waiter() {
        let event = Arc::new(DpcEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        // Losing this race only makes the test trivially pass via the
        // pre-signalled path below.
        thread::sleep(Duration::from_millis(5));
        event.set();
        assert!(waiter.join().unwrap());

        // A signal set before the wait is observed without blocking.
        assert!(event.wait_timeout(Duration::from_millis(1)));

        event.clear();
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }
}
