use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`SnapDictionary`](crate::SnapDictionary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapConfig {
    /// Start a background collection from `create_snapshot` when enough
    /// generations have piled up.
    pub collect_auto: bool,
    /// Generations `live_gen` must be ahead of both the floor and the last
    /// collection before an automatic collection starts.
    pub collect_min_gen_delta: u64,
    /// Chains at least this long are reported at WARN during collection.
    pub chain_warn_len: usize,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            collect_auto: true,
            collect_min_gen_delta: 8,
            chain_warn_len: 64,
        }
    }
}

impl SnapConfig {
    /// Collection only runs when `collect`/`collect_async` is called.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            collect_auto: false,
            ..Self::default()
        }
    }
}
