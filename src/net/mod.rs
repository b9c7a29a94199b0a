//! Message transports, RTT tracking and fault injection

pub mod ping;
pub mod simulator;
pub mod transport;

pub use ping::PingTracker;
pub use simulator::{Delivery, NetworkSimulator, SimulatedTransport, SimulatorSettings};
pub use transport::{ChannelTransport, SharedTransport, Transport, TransportError};
