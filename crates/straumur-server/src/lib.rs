//! WebSocket front end for the straumur answer service.
//!
//! Each connection gets a [`Session`] that answers one question at a time,
//! and the [`ConnectionRegistry`] lets the [`Server`] close every live
//! connection on shutdown.

pub mod registry;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_support;

pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{Server, ServerBuilder, SHUTDOWN_REASON};
pub use session::{Session, BUSY_MESSAGE};
