//! `fleet-cache`: keyed cache with sliding TTL eviction.
//!
//! Every read restarts the entry's countdown, so a value that keeps being used
//! stays cached and an idle one is dropped one TTL after its last use. The
//! remote script executor keeps its connections here.

mod countdown;

pub use countdown::CountdownCache;
