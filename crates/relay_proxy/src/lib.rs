//! Relay proxy.
//!
//! Speaks the PostgreSQL wire protocol to clients, classifies each statement
//! and routes it to an instance that has applied every pending write on the
//! tables it touches.

pub mod codec;
pub mod node;
pub mod params;
pub mod router;
pub mod server;
pub mod session;

pub use router::{InstanceRouter, RouteOutcome};
pub use server::ProxyServer;
pub use session::{Session, SessionConfig};
