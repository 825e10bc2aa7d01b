use std::time::Duration;

/// Tunable limits for graph construction and the fixpoint run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Treat blocks containing rare opcodes (`CREATE`, `REVERT`, ...) as
    /// skipped from the start.
    pub allow_skip: bool,
    /// Stack depth below which digging produces loop-breaker phis instead of
    /// ordinary stack phis. Negative, counted from the block entry.
    pub loop_breaker_depth: i64,
    /// Recursion depth for collecting candidate jump targets from a node's
    /// argument tree.
    pub possible_value_depth: u32,
    /// Shallower recursion depth used when the node's valuation already
    /// carries a possible-value set.
    pub possible_value_depth_with_set: u32,
    /// Hard cap on processed worklist updates; exceeding it is fatal.
    pub max_updates: usize,
    /// Hard cap on fixpoint wall-clock time; exceeding it is fatal.
    pub max_duration: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            allow_skip: false,
            loop_breaker_depth: -90,
            possible_value_depth: 7,
            possible_value_depth_with_set: 5,
            max_updates: 400_000,
            max_duration: Duration::from_secs(60),
        }
    }
}

impl AnalysisConfig {
    pub fn with_skip() -> Self {
        Self {
            allow_skip: true,
            ..Self::default()
        }
    }
}
