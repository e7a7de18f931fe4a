pub mod correlate;
pub mod icmp;
pub mod sender;
pub mod socket;
pub mod tcp;

pub use correlate::*;
pub use icmp::*;
pub use sender::*;
pub use socket::*;
pub use tcp::*;
