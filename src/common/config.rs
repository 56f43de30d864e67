//! Simulator configuration loaded from TOML.
//!
//! Every table and key is optional; missing values fall back to defaults.
//!
//! ```toml
//! [handover]
//! settle_delay_us = 10
//! detach_delay_us = 2000
//! attach_delay_us = 3000
//! fixed_margin_db = 3.0
//! hysteresis_factor = 0.0
//! signal_floor_dbm = -110.0
//!
//! [gate]
//! capacity = 1024
//! overflow_policy = "drop_oldest"
//!
//! [simulation]
//! beacon_period_ms = 100
//! backhaul_delay_us = 1000
//! duration_ms = 60000
//! seed = 7
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::Context;
use embassy_time::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::gate::QueueConfig;
use crate::handover::HandoverConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub beacon_period_ms: u64,
    /// Core network to base station latency.
    pub backhaul_delay_us: u64,
    pub duration_ms: u64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            beacon_period_ms: 100,
            backhaul_delay_us: 1_000,
            duration_ms: 60_000,
            seed: 7,
        }
    }
}

impl SimulationConfig {
    pub fn beacon_period(&self) -> Duration {
        Duration::from_millis(self.beacon_period_ms)
    }

    pub fn backhaul_delay(&self) -> Duration {
        Duration::from_micros(self.backhaul_delay_us)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for this crate, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub handover: HandoverConfig,
    pub gate: QueueConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

impl SimulatorConfig {
    /// Load configuration from a TOML file.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(config_path).with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let config = Self::parse(&content).with_context(|| format!("Invalid config file {}", config_path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: SimulatorConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Derive the config path from a scene file path.
    ///
    /// Replaces the scene filename with "config.toml" in the same directory.
    pub fn config_path_from_scene(scene_path: &str) -> PathBuf {
        let scene = Path::new(scene_path);
        scene.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    /// Check the timing relationships the handover sequence relies on.
    ///
    /// All beacons of a round are delivered in one handler, so the settle
    /// delay must expire before the next round. Packets already on the
    /// backhaul towards a losing station must reach it while its forwarding
    /// entry still exists.
    pub fn validate(&self) -> Result<(), Error> {
        let handover = &self.handover;
        let simulation = &self.simulation;

        if simulation.beacon_period_ms == 0 {
            return Err(Error::InvalidConfig("beacon_period_ms must be positive".to_string()));
        }
        if handover.settle_delay_us >= simulation.beacon_period_ms.saturating_mul(1_000) {
            return Err(Error::InvalidConfig(format!(
                "settle_delay_us {} must be shorter than the beacon period ({} ms)",
                handover.settle_delay_us, simulation.beacon_period_ms
            )));
        }
        let shortest_phase = handover.detach_delay_us.min(handover.attach_delay_us);
        if simulation.backhaul_delay_us >= shortest_phase {
            return Err(Error::InvalidConfig(format!(
                "backhaul_delay_us {} must be shorter than both handover phases ({} us)",
                simulation.backhaul_delay_us, shortest_phase
            )));
        }
        if handover.hysteresis_factor < 0.0 || handover.fixed_margin_db < 0.0 {
            return Err(Error::InvalidConfig("hysteresis parameters must not be negative".to_string()));
        }
        if self.gate.capacity == 0 {
            return Err(Error::InvalidConfig("gate capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// `log` level filter for this crate.
    pub fn log_level(&self) -> log::LevelFilter {
        self.logging.level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', using info", self.logging.level);
            log::LevelFilter::Info
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::OverflowPolicy;

    #[test]
    fn empty_config_uses_defaults() {
        let config = SimulatorConfig::parse("").unwrap();
        assert_eq!(config, SimulatorConfig::default());
        assert_eq!(config.gate.capacity, 1024);
        assert_eq!(config.gate.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.simulation.beacon_period(), Duration::from_millis(100));
    }

    #[test]
    fn partial_tables_are_merged_with_defaults() {
        let config = SimulatorConfig::parse(
            r#"
            [handover]
            hysteresis_factor = 20.0

            [gate]
            overflow_policy = "drop_newest"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.handover.hysteresis_factor, 20.0);
        assert_eq!(config.handover.detach_delay_us, 2_000);
        assert_eq!(config.gate.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn settle_delay_must_be_shorter_than_the_beacon_period() {
        let mut config = SimulatorConfig::default();
        config.handover.settle_delay_us = 100_000;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn huge_beacon_period_does_not_overflow() {
        let mut config = SimulatorConfig::default();
        config.simulation.beacon_period_ms = u64::MAX;
        assert!(config.validate().is_ok());

        config.handover.settle_delay_us = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn backhaul_must_be_shorter_than_the_phases() {
        let mut config = SimulatorConfig::default();
        config.simulation.backhaul_delay_us = 2_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_path_sits_next_to_the_scene() {
        assert_eq!(
            SimulatorConfig::config_path_from_scene("scenes/highway.json"),
            PathBuf::from("scenes/config.toml")
        );
    }
}
