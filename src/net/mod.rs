//! Name resolution and TCP connection establishment
//!
//! Both steps are blocking. Resolution goes through the [`AddressResolver`]
//! trait so callers can substitute their own lookup; establishment walks the
//! resolved list strictly in order within one time budget.

pub mod establish;
pub mod resolver;

pub use establish::{establish, Attempt, Established};
pub use resolver::{AddressResolver, SystemResolver};

/// Default connect timeout budget in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;

/// Default read timeout in seconds
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 15;
