use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::Grade;

/// Engine configuration, read from an optional JSON file.
///
/// Example:
/// ```json
/// {
///   "ratios": { "a": 0.1, "b": 0.2, "c": 0.4, "d": 0.2, "e": 0.1 },
///   "e_floor": { "enabled": true, "min_share": 0.05 },
///   "confirm": { "workers": 8 }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GradingConfig {
    pub ratios: GradeRatios,
    pub e_floor: EFloorConfig,
    pub cache: CacheConfig,
    pub confirm: ConfirmConfig,
    pub sync: SyncConfig,
    pub warning: WarningConfig,
}

/// Share of the population allotted to each grade. Must sum to 1.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GradeRatios {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
}

impl Default for GradeRatios {
    fn default() -> Self {
        Self {
            a: 0.1,
            b: 0.2,
            c: 0.4,
            d: 0.2,
            e: 0.1,
        }
    }
}

impl GradeRatios {
    pub fn get(&self, grade: Grade) -> f64 {
        match grade {
            Grade::A => self.a,
            Grade::B => self.b,
            Grade::C => self.c,
            Grade::D => self.d,
            Grade::E => self.e,
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for grade in Grade::ALL {
            let ratio = self.get(grade);
            if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
                errors.push(format!(
                    "ratios.{}: must be within [0, 1], got {ratio}",
                    grade.as_str().to_lowercase()
                ));
            }
        }
        let sum: f64 = Grade::ALL.iter().map(|grade| self.get(*grade)).sum();
        if (sum - 1.0).abs() > 1e-6 {
            errors.push(format!("ratios: must sum to 1, got {sum}"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Guarantees E at least `min_share` of the population by raising the D cutoff.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EFloorConfig {
    pub enabled: bool,
    pub min_share: f64,
}

impl Default for EFloorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_share: 0.05,
        }
    }
}

impl EFloorConfig {
    /// The floor to enforce, if any.
    pub fn floor(&self) -> Option<f64> {
        self.enabled.then_some(self.min_share)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfirmConfig {
    /// Size of the batch-confirm worker pool.
    pub workers: usize,
    /// Lifetime of a per-key confirm token.
    pub lock_ttl_secs: u64,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_ttl_secs: 30,
        }
    }
}

impl ConfirmConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { chunk_size: 5_000 }
    }
}

/// Share of students changing grade above which a preview is flagged.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WarningConfig {
    pub warning_swing: f64,
    pub danger_swing: f64,
}

impl Default for WarningConfig {
    fn default() -> Self {
        Self {
            warning_swing: 0.10,
            danger_swing: 0.30,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<GradingConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => GradingConfig::default(),
    };

    if let Err(errors) = validate_config(&config) {
        anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }
    Ok(config)
}

/// Returns every problem at once, not just the first.
pub fn validate_config(config: &GradingConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if let Err(ratio_errors) = config.ratios.validate() {
        errors.extend(ratio_errors);
    }

    let floor = config.e_floor.min_share;
    if !(0.0..=1.0).contains(&floor) {
        errors.push(format!("e_floor.min_share: must be within [0, 1], got {floor}"));
    }

    if config.confirm.workers == 0 {
        errors.push("confirm.workers: must be at least 1".to_string());
    }
    if config.confirm.lock_ttl_secs == 0 {
        errors.push("confirm.lock_ttl_secs: must be at least 1".to_string());
    }
    if config.sync.chunk_size == 0 {
        errors.push("sync.chunk_size: must be at least 1".to_string());
    }

    let warning = config.warning;
    let in_unit = |swing: f64| (0.0..=1.0).contains(&swing);
    if !in_unit(warning.warning_swing) || !in_unit(warning.danger_swing) {
        errors.push("warning: swings must be within [0, 1]".to_string());
    } else if warning.warning_swing > warning.danger_swing {
        errors.push(format!(
            "warning.warning_swing ({}) must not exceed warning.danger_swing ({})",
            warning.warning_swing, warning.danger_swing
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
