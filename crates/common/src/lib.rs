//! Shared types for the order write-path stores.

pub mod clock;
pub mod id;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::{IdGenerator, UuidGenerator};
pub use types::Version;
