//! Repository implementations for database operations

pub mod evolution;
pub mod signals;
pub mod strategies;
pub mod trades;

pub use evolution::*;
pub use signals::*;
pub use strategies::*;
pub use trades::*;
