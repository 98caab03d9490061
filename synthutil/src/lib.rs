//! Utilities shared by the population synthesis crates: timing and progress reporting, a bounded
//! worker pool, deterministic random number streams, and small IO helpers.

#[macro_use]
extern crate log;

mod io;
pub mod logger;
mod random;
mod time;
mod utils;

pub use crate::io::{read_json, write_json};
pub use crate::random::{fork_rng, seeded_rng};
pub use crate::time::{elapsed_seconds, prettyprint_time, Parallelism, Timer};
pub use crate::utils::prettyprint_usize;

const PROGRESS_FREQUENCY_SECONDS: f64 = 0.2;
