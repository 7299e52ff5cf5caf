/*!
 * Synchronization Primitives
 *
 * Busy-wait with voluntary yield instead of blocking synchronization: the
 * critical sections guarded here are a few word writes (at most a realloc),
 * so spin cost beats syscall/lock overhead. The backoff curve is an explicit
 * parameter rather than a hidden loop.
 */

mod config;
mod spinwait;

pub use config::SpinConfig;
pub use spinwait::SpinWait;
