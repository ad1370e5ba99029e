//! Interrupt masking around locks that interrupt handlers also take.

/// Execute code with local interrupts disabled.
///
/// Only bare-metal x86_64 builds touch the interrupt flag; hosted builds
/// (unit tests) run `f` directly.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        f()
    }
}
