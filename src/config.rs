/*!
 * Configuration
 * Plain-struct config with documented defaults, overlaid from
 * `HEAL_*` environment variables. Bad values fall back to the default and
 * log a warning rather than panicking — config loading is a boundary, same
 * as any other external input in this pipeline.
 */

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub polling_interval_ms: u64,

    pub ewma_alpha: f64,
    pub ewma_stddev_threshold: f64,

    pub dedup_window_ms: u64,
    pub lease_timeout_ms: u64,
    pub check_interval_ms: u64,
    pub max_attempts: u32,
    pub suppression_window_ms: u64,

    pub cascade_window_ms: u64,
    pub cascade_threshold: usize,
    pub settling_cycles: u32,
    pub max_concurrent_proposals: usize,
    pub cascade_exit_threshold_ms: u64,

    pub max_rejections: u32,
    pub rejection_window_ms: u64,
    pub suppression_ttl_minutes: u64,

    pub soak_cycles: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_interval_ms: 5_000,

            ewma_alpha: 0.3,
            ewma_stddev_threshold: 3.0,

            dedup_window_ms: 300_000,
            lease_timeout_ms: 60_000,
            check_interval_ms: 15_000,
            max_attempts: 3,
            suppression_window_ms: 1_800_000,

            cascade_window_ms: 10_000,
            cascade_threshold: 5,
            settling_cycles: 3,
            max_concurrent_proposals: 3,
            cascade_exit_threshold_ms: 30_000,

            max_rejections: 3,
            rejection_window_ms: 3_600_000,
            suppression_ttl_minutes: 30,

            soak_cycles: 5,
        }
    }
}

impl Config {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Overlay defaults with `HEAL_*` environment variables, skipping (and
    /// warning on) any value that fails to parse.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        macro_rules! overlay {
            ($field:ident, $env:literal) => {
                if let Ok(raw) = std::env::var($env) {
                    match raw.parse() {
                        Ok(value) => cfg.$field = value,
                        Err(_) => warn!(
                            env = $env,
                            raw, "invalid config value, keeping default"
                        ),
                    }
                }
            };
        }

        overlay!(polling_interval_ms, "HEAL_POLLING_INTERVAL_MS");
        overlay!(ewma_alpha, "HEAL_EWMA_ALPHA");
        overlay!(ewma_stddev_threshold, "HEAL_EWMA_STDDEV_THRESHOLD");
        overlay!(dedup_window_ms, "HEAL_DEDUP_WINDOW_MS");
        overlay!(lease_timeout_ms, "HEAL_LEASE_TIMEOUT_MS");
        overlay!(check_interval_ms, "HEAL_CHECK_INTERVAL_MS");
        overlay!(max_attempts, "HEAL_MAX_ATTEMPTS");
        overlay!(suppression_window_ms, "HEAL_SUPPRESSION_WINDOW_MS");
        overlay!(cascade_window_ms, "HEAL_CASCADE_WINDOW_MS");
        overlay!(cascade_threshold, "HEAL_CASCADE_THRESHOLD");
        overlay!(settling_cycles, "HEAL_SETTLING_CYCLES");
        overlay!(max_concurrent_proposals, "HEAL_MAX_CONCURRENT_PROPOSALS");
        overlay!(cascade_exit_threshold_ms, "HEAL_CASCADE_EXIT_THRESHOLD_MS");
        overlay!(max_rejections, "HEAL_MAX_REJECTIONS");
        overlay!(rejection_window_ms, "HEAL_REJECTION_WINDOW_MS");
        overlay!(suppression_ttl_minutes, "HEAL_SUPPRESSION_TTL_MINUTES");
        overlay!(soak_cycles, "HEAL_SOAK_CYCLES");

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.polling_interval_ms, 5_000);
        assert_eq!(cfg.ewma_alpha, 0.3);
        assert_eq!(cfg.dedup_window_ms, 300_000);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.cascade_threshold, 5);
        assert_eq!(cfg.soak_cycles, 5);
        assert_eq!(cfg.max_rejections, 3);
    }

    #[test]
    fn invalid_env_value_keeps_default() {
        std::env::set_var("HEAL_EWMA_ALPHA", "not-a-number");
        let cfg = Config::from_env();
        assert_eq!(cfg.ewma_alpha, Config::default().ewma_alpha);
        std::env::remove_var("HEAL_EWMA_ALPHA");
    }

    #[test]
    fn valid_env_value_overlays_default() {
        std::env::set_var("HEAL_CASCADE_THRESHOLD", "9");
        let cfg = Config::from_env();
        assert_eq!(cfg.cascade_threshold, 9);
        std::env::remove_var("HEAL_CASCADE_THRESHOLD");
    }
}
