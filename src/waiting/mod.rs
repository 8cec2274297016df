//! Time primitives that tests can replace.

pub mod debounce;
pub mod delay;

pub use debounce::{Debouncer, TokenBucket};
pub use delay::{Delay, FakeDelay, NoDelay, TimerDelay};
