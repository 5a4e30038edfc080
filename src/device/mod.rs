pub mod charger;
pub mod meter;
pub mod retry;
pub mod simulated;
pub mod vehicle;

pub use charger::*;
pub use meter::*;
pub use retry::*;
pub use vehicle::*;

use thiserror::Error;

/// Device-level errors shared by meters, chargers and vehicles.
///
/// `Config` is fatal at initialisation. `Device` and `Timeout` are transient
/// and eligible for retry. `Asleep` is vehicle-specific and yields a graceful
/// "unknown" instead of a fault. Invariant violations are bugs and panic.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("device: {0}")]
    Device(String),
    #[error("vehicle asleep")]
    Asleep,
    #[error("timeout")]
    Timeout,
}

impl DeviceError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, DeviceError::Device(_) | DeviceError::Timeout)
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Wake-up capability shared by chargers and vehicles.
#[async_trait::async_trait]
pub trait Resurrector: Send + Sync {
    async fn wake_up(&self) -> DeviceResult<()>;
}

/// RFID/MAC style identification capability shared by chargers and vehicles.
#[async_trait::async_trait]
pub trait Identifier: Send + Sync {
    /// Returns the identification token of the connected vehicle, if any.
    async fn identify(&self) -> DeviceResult<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(DeviceError::Device("x".into()).is_retriable());
        assert!(DeviceError::Timeout.is_retriable());
        assert!(!DeviceError::Config("x".into()).is_retriable());
        assert!(!DeviceError::Asleep.is_retriable());
    }
}
