//! Application state shared across routes

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::game::RoomManager;
use crate::net::{NetworkSimulator, SharedTransport, SimulatedTransport, Transport};
use crate::util::{SharedClock, SystemClock};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub rooms: Arc<RoomManager>,
    /// Present only when fault injection is configured
    pub simulator: Option<Arc<NetworkSimulator>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: SharedClock) -> Self {
        let config = Arc::new(config);
        let rooms = Arc::new(RoomManager::new(config.room.clone(), clock.clone()));

        let simulator = config.simulator.is_enabled().then(|| {
            info!(
                latency_ms = config.simulator.latency_ms,
                loss_percent = config.simulator.loss_percent,
                jitter_ms = config.simulator.jitter_ms,
                "Network simulation enabled"
            );
            Arc::new(NetworkSimulator::new(config.simulator))
        });

        Self {
            config,
            clock,
            rooms,
            simulator,
        }
    }

    /// Wrap a per-connection transport in the network simulator, if enabled
    pub fn decorate<M, T>(&self, inner: Arc<T>) -> SharedTransport<M>
    where
        M: Send + 'static,
        T: Transport<M> + 'static,
    {
        match &self.simulator {
            Some(simulator) => Arc::new(SimulatedTransport::new(inner, simulator.clone())),
            None => inner,
        }
    }
}
