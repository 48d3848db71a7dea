//! Global Kill Switch
//!
//! A persisted process-wide flag blocking all campaign start and resume
//! operations while active. Stored in the shared key-value store so every
//! node observes the same state.

use crate::Result;

pub(crate) const KILL_SWITCH_KEY: &str = "platform:killswitch";

#[async_trait::async_trait]
pub trait KillSwitch: Send + Sync {
    /// Activate with an operator-supplied reason.
    async fn activate(&self, reason: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    /// The active reason, or `None` when the switch is off.
    async fn status(&self) -> Result<Option<String>>;
}
