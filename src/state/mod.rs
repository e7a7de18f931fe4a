pub mod cooldown;
pub mod latency;
pub mod score;

pub use cooldown::*;
pub use latency::*;
pub use score::*;
