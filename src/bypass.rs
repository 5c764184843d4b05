// Bypass dispatcher: short-circuits the entire coordinator for pre-upgrade
// clusters. Evaluated per call, not once at startup, so an in-flight upgrade
// flips behavior without a restart.

use crate::config::CoordinatorConfig;

/// Current cluster compatibility version, supplied by the (out-of-scope)
/// cluster configuration service. Modeled as a trait so tests can fake it
/// without standing up the real config collaborator.
pub trait ClusterCompatSource: Send + Sync {
    fn compat_version(&self) -> u32;
}

/// Always reports the maximum compat version, i.e. bypass never engages
/// purely from compat level (the default for fresh clusters and tests).
pub struct AlwaysCurrent;

impl ClusterCompatSource for AlwaysCurrent {
    fn compat_version(&self) -> u32 {
        u32::MAX
    }
}

/// Whether the coordinator should run in bypass mode for this call
/// (below-threshold compat version, or an explicit forced flag).
pub fn is_bypassed(config: &CoordinatorConfig, compat_version: u32) -> bool {
    config.bypass_forced || compat_version < config.compat_version_threshold
}
