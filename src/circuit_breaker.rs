//! Circuit breaker for connection attempts.
//!
//! Two states only. OPEN always carries the instant it opened, so a state
//! without a timestamp cannot be represented.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{DirectoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed,
    Open {
        since: Instant,
        since_wall: DateTime<Utc>,
    },
}

impl BreakerState {
    fn open_now() -> Self {
        BreakerState::Open {
            since: Instant::now(),
            since_wall: Utc::now(),
        }
    }
}

/// What the caller may do after asking the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal attempt with one immediate retry
    Closed,
    /// Single probe after the cool-down
    Probe,
}

/// Serializable view for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    pub cool_down_ms: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
    cool_down: Duration,
}

impl CircuitBreaker {
    pub fn new(cool_down: Duration) -> Self {
        Self {
            state: RwLock::new(BreakerState::Closed),
            cool_down,
        }
    }

    /// Decides whether a connection attempt may touch the network.
    ///
    /// Fails with `BreakerOpen` while the cool-down is running.
    pub async fn admit(&self) -> Result<Admission> {
        match *self.state.read().await {
            BreakerState::Closed => Ok(Admission::Closed),
            BreakerState::Open { since, .. } => {
                let elapsed = since.elapsed();
                if elapsed >= self.cool_down {
                    debug!("Circuit breaker cool-down elapsed, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(DirectoryError::BreakerOpen(format!(
                        "connection attempts suspended for another {} ms",
                        (self.cool_down - elapsed).as_millis()
                    )))
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if matches!(*state, BreakerState::Open { .. }) {
            info!("Circuit breaker transitioning to CLOSED after successful probe");
        }
        *state = BreakerState::Closed;
    }

    /// Opens the breaker, or restarts the cool-down if it is already open.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        match *state {
            BreakerState::Closed => warn!(
                "Circuit breaker transitioning to OPEN, retrying after {} ms",
                self.cool_down.as_millis()
            ),
            BreakerState::Open { .. } => warn!("Circuit breaker probe failed, staying OPEN"),
        }
        *state = BreakerState::open_now();
    }

    pub async fn state(&self) -> CircuitState {
        match *self.state.read().await {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
        }
    }

    pub async fn status(&self) -> BreakerStatus {
        let (state, opened_at) = match *self.state.read().await {
            BreakerState::Closed => (CircuitState::Closed, None),
            BreakerState::Open { since_wall, .. } => (CircuitState::Open, Some(since_wall)),
        };
        BreakerStatus {
            state,
            opened_at,
            cool_down_ms: self.cool_down.as_millis() as u64,
        }
    }
}
