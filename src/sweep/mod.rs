pub mod record;
pub mod scheduler;

pub use record::*;
pub use scheduler::*;
