use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input = 0,
    Output = 1,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Input
    }
}

impl TryFrom<i32> for Direction {
    type Error = GpioError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::Input),
            1 => Ok(Direction::Output),
            _ => Err(GpioError::InvalidOperation(format!(
                "unknown direction {value}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Low = 0,
    High = 1,
}

impl Default for State {
    fn default() -> Self {
        State::Low
    }
}

impl State {
    pub fn from_bit(bit: bool) -> Self {
        if bit { State::High } else { State::Low }
    }

    pub fn is_high(self) -> bool {
        self == State::High
    }
}

impl TryFrom<i32> for State {
    type Error = GpioError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(State::Low),
            1 => Ok(State::High),
            _ => Err(GpioError::InvalidOperation(format!("unknown state {value}"))),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Low => f.write_str("LOW"),
            State::High => f.write_str("HIGH"),
        }
    }
}

/// Opaque token handed back unchanged with every event of a subscription.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserData(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub pin: u32,
    pub state: State,
    pub user_data: UserData,
    pub timestamp_ms: u64,
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
