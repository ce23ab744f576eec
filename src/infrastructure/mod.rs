//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod connection_counter;
pub mod shutdown;

pub use connection_counter::ConnectionCounter;
pub use shutdown::{shutdown_signal, ShutdownController};
