// ABOUTME: Cooperative STOP/KILL cancellation, checked between statements and parsed tokens

use crate::error::ControlFlow;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Ordinal-ordered so a higher-priority signal always wins over a lower
/// one already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Signal {
    None = 0,
    Stop = 1,
    Kill = 2,
}

impl Signal {
    fn from_u8(v: u8) -> Signal {
        match v {
            2 => Signal::Kill,
            1 => Signal::Stop,
            _ => Signal::None,
        }
    }
}

/// An atomic-flag cooperative checkpoint: OS signal handlers trap
/// `SIGINT`/`SIGTERM` into an atomic flag polled at safe points, rather
/// than acting from within the handler itself. Generalized here to
/// script-level cancellation raised from anywhere that holds a clone of
/// the `Arc`.
#[derive(Debug, Default)]
pub struct SignalCell {
    state: AtomicU8,
}

impl SignalCell {
    pub fn new() -> Arc<Self> {
        Arc::new(SignalCell {
            state: AtomicU8::new(Signal::None as u8),
        })
    }

    /// Records `s` as pending if it outranks whatever is already pending.
    pub fn raise(&self, s: Signal) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if s as u8 > current {
                    Some(s as u8)
                } else {
                    None
                }
            });
    }

    /// Checked between every parsed statement and every macro step (spec
    /// §5). `Stop` raises and clears the signal; `Kill` raises but leaves
    /// the flag set so subsequent checkpoints also abort.
    pub fn check(&self) -> Result<(), ControlFlow> {
        match Signal::from_u8(self.state.load(Ordering::SeqCst)) {
            Signal::None => Ok(()),
            Signal::Stop => {
                self.state
                    .store(Signal::None as u8, Ordering::SeqCst);
                Err(ControlFlow::Stop)
            }
            Signal::Kill => Err(ControlFlow::Kill),
        }
    }
}
