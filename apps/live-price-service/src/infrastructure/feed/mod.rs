//! Push Feed Integration
//!
//! WebSocket client for the push price feed: wire messages, codec,
//! heartbeat monitoring, reconnect policy, the per-session connection state
//! machine and the supervisor that keeps a session alive.

pub mod codec;
pub mod connection;
pub mod health;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod supervisor;

pub use connection::{ControlRequest, StreamConnection, StreamConnectionError, StreamEvent};
pub use health::{ConnectionHealth, ConnectionState, HealthSnapshot};
pub use supervisor::ConnectionSupervisor;
