//! Pre-trade risk gate.
//!
//! Synchronous predicates with no I/O: instrument whitelist, the emergency
//! kill-switch, and the per-instrument absolute position cap. A denial is
//! not an error; the executor treats it as a skip signal and still credits
//! the delta ledger so the miss stays accounted for.

use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;

use crate::config::Config;

/// Why a placement was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDenial {
    UnsupportedInstrument,
    EmergencyStop,
    PositionLimit,
}

impl fmt::Display for RiskDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedInstrument => write!(f, "instrument not whitelisted"),
            Self::EmergencyStop => write!(f, "emergency stop active"),
            Self::PositionLimit => write!(f, "position limit exceeded"),
        }
    }
}

pub struct RiskGate {
    /// coin -> maximum absolute position in Follower base units
    max_positions: HashMap<String, Decimal>,
    emergency_stop: bool,
}

impl RiskGate {
    pub fn new(config: &Config) -> Self {
        Self {
            max_positions: config
                .instruments
                .iter()
                .map(|(coin, instrument)| (coin.clone(), instrument.max_position))
                .collect(),
            emergency_stop: config.emergency_stop,
        }
    }

    pub fn supported(&self, coin: &str) -> bool {
        self.max_positions.contains_key(coin)
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.emergency_stop
    }

    /// Whether `|current| + proposed` stays within the instrument cap.
    pub fn within_position_limit(
        &self,
        coin: &str,
        current_signed_position: Decimal,
        proposed_size: Decimal,
    ) -> bool {
        match self.max_positions.get(coin) {
            Some(max) => current_signed_position.abs() + proposed_size <= *max,
            None => false,
        }
    }

    /// Combined check used by the executor before every placement.
    pub fn evaluate(
        &self,
        coin: &str,
        current_signed_position: Decimal,
        proposed_size: Decimal,
    ) -> Result<(), RiskDenial> {
        if self.emergency_stop_active() {
            return Err(RiskDenial::EmergencyStop);
        }
        if !self.supported(coin) {
            return Err(RiskDenial::UnsupportedInstrument);
        }
        if !self.within_position_limit(coin, current_signed_position, proposed_size) {
            return Err(RiskDenial::PositionLimit);
        }
        Ok(())
    }
}
