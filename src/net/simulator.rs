//! Network condition simulator
//!
//! Artificial latency, jitter and packet loss layered over any [`Transport`].
//! Each connection gets its own decorated transport; nothing here is global.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::transport::{Transport, TransportError};

/// Simulation settings, clamped to sane development ranges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorSettings {
    /// One-way latency in milliseconds (0..=300)
    pub latency_ms: u64,
    /// Drop probability in percent (0..=20)
    pub loss_percent: f64,
    /// Maximum ± jitter in milliseconds, applied only with latency
    pub jitter_ms: u64,
}

impl SimulatorSettings {
    pub const MAX_LATENCY_MS: u64 = 300;
    pub const MAX_LOSS_PERCENT: f64 = 20.0;
    pub const DEFAULT_JITTER_MS: u64 = 20;

    pub fn new(latency_ms: u64, loss_percent: f64, jitter_ms: u64) -> Self {
        let loss_percent = if loss_percent.is_finite() {
            loss_percent.clamp(0.0, Self::MAX_LOSS_PERCENT)
        } else {
            0.0
        };
        Self {
            latency_ms: latency_ms.min(Self::MAX_LATENCY_MS),
            loss_percent,
            jitter_ms: jitter_ms.min(latency_ms.min(Self::MAX_LATENCY_MS)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0.0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.latency_ms > 0 || self.loss_percent > 0.0
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self::disabled()
    }
}

/// What happens to a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Drop,
    After(Duration),
}

/// Rolls loss and delay for each message
#[derive(Debug)]
pub struct NetworkSimulator {
    settings: SimulatorSettings,
    rng: Mutex<ChaCha8Rng>,
}

impl NetworkSimulator {
    pub fn new(settings: SimulatorSettings) -> Self {
        Self {
            settings,
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Deterministic simulator for tests
    pub fn with_seed(settings: SimulatorSettings, seed: u64) -> Self {
        Self {
            settings,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn settings(&self) -> SimulatorSettings {
        self.settings
    }

    pub fn decide(&self) -> Delivery {
        let SimulatorSettings {
            latency_ms,
            loss_percent,
            jitter_ms,
        } = self.settings;
        let mut rng = self.rng.lock();

        if loss_percent > 0.0 && rng.gen::<f64>() * 100.0 < loss_percent {
            return Delivery::Drop;
        }
        if latency_ms == 0 {
            return Delivery::After(Duration::ZERO);
        }

        let jitter = if jitter_ms > 0 {
            rng.gen_range(-(jitter_ms as i64)..=jitter_ms as i64)
        } else {
            0
        };
        let delay = (latency_ms as i64 + jitter).max(0) as u64;
        Delivery::After(Duration::from_millis(delay))
    }
}

/// Transport decorator that applies a [`NetworkSimulator`]
pub struct SimulatedTransport<T: ?Sized> {
    inner: Arc<T>,
    simulator: Arc<NetworkSimulator>,
}

impl<T: ?Sized> SimulatedTransport<T> {
    pub fn new(inner: Arc<T>, simulator: Arc<NetworkSimulator>) -> Self {
        Self { inner, simulator }
    }
}

impl<M, T> Transport<M> for SimulatedTransport<T>
where
    M: Send + 'static,
    T: Transport<M> + ?Sized + 'static,
{
    fn send(&self, msg: M) -> Result<(), TransportError> {
        match self.simulator.decide() {
            Delivery::Drop => {
                trace!("Simulated packet loss");
                Ok(())
            }
            Delivery::After(delay) if delay.is_zero() => self.inner.send(msg),
            Delivery::After(delay) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let inner = self.inner.clone();
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = inner.send(msg) {
                            debug!(error = %e, "Delayed delivery failed");
                        }
                    });
                    Ok(())
                }
                // No runtime to schedule on, deliver immediately
                Err(_) => self.inner.send(msg),
            },
        }
    }
}
