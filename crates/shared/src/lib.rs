//! Shared wire types for the deskline real-time client.

pub mod error;
pub mod events;
pub mod protocol;

pub use error::*;
pub use events::*;
pub use protocol::*;
