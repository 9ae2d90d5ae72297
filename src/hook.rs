//! Restart hook invoked after every successful transfer.
//!
//! The host registers at most one hook before the measurement starts. It runs
//! on the driver's callback thread, inside the same time budget as the
//! transfer, so it must be fast and must not block. A typical hook re-arms the
//! acquisition hardware.

use thiserror::Error;

/// Non-zero status returned by a failing hook.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("restart hook failed with status {code}")]
pub struct HookFailure {
    /// Status code reported by the hook
    pub code: i32,
}

/// Niladic callback run after each transfer.
pub trait RestartHook: Send {
    /// Called once per successful transfer, after the slot id flipped.
    fn restart(&mut self) -> Result<(), HookFailure>;
}

impl<F> RestartHook for F
where
    F: FnMut() -> Result<(), HookFailure> + Send,
{
    fn restart(&mut self) -> Result<(), HookFailure> {
        self()
    }
}

/// Adapter for hooks that report a C-style status code (0 = success).
#[derive(Debug)]
pub struct StatusHook<F>(pub F);

impl<F> RestartHook for StatusHook<F>
where
    F: FnMut() -> i32 + Send,
{
    fn restart(&mut self) -> Result<(), HookFailure> {
        match (self.0)() {
            0 => Ok(()),
            code => Err(HookFailure { code }),
        }
    }
}
