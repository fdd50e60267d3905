//! Coordinator configuration

use serde::{Deserialize, Serialize};

/// Configuration for [`RotationCoordinator`](crate::coordinator::RotationCoordinator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Require the supplied old secret to equal the current master secret
    ///
    /// With this off, a repeated `A → B` rotation is only caught when a
    /// record fails to decrypt under `A`, which an empty store never does.
    pub verify_current: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            verify_current: true,
        }
    }
}
