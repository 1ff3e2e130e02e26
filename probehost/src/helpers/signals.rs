//! # Signals
//!
//! Provides a simple way for threads to synchronize their termination,
//! optionally driven by the standard termination signals.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Result;
use log::info;
use signal_hook::iterator::Signals;

#[derive(Clone)]
pub(crate) struct Running {
    condition: Arc<AtomicBool>,
}

impl Running {
    // Create a new Running instance.
    //
    // - Helps handling loops in various threads to synchronize termination.
    // - This instance will also stop upon receiving one of the termination
    //   signals (e.g. SIGTERM).
    pub(crate) fn new() -> Result<Running> {
        let mut sigs = Signals::new(signal_hook::consts::TERM_SIGNALS)?;

        let run = Self::ignore_signals();
        let condition = Arc::clone(&run.condition);

        thread::spawn(move || {
            sigs.wait();
            condition.store(true, Ordering::Relaxed);
            info!("Received signal, terminating...");
        });

        Ok(run)
    }

    // Same as `new()` but without handling termination signals. Termination
    // *must* be manually handled here.
    pub(crate) fn ignore_signals() -> Running {
        Self {
            condition: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn running(&self) -> bool {
        !self.condition.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate(&self) {
        self.condition.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate() {
        let run = Running::ignore_signals();
        let clone = run.clone();

        assert!(run.running());
        assert!(clone.running());

        clone.terminate();
        assert!(!run.running());
        assert!(!clone.running());
    }
}
