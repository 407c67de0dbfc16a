//! Auto-tuning module
//!
//! Sizes the migration worker pools from detected hardware when the
//! configuration leaves them at zero. Dumping is read-heavy on the source,
//! importing is write-heavy on the target, so the two pools are sized
//! independently.

use sysinfo::System;

/// Tuned pool sizes based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Concurrent inventory dumpers
    pub dump_workers: usize,
    /// Concurrent importers
    pub import_workers: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            dump_workers: 2,
            import_workers: 2,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune pool sizes based on detected hardware
///
/// Allocation strategy:
/// - dumpers get half the cores (min 1, max 16)
/// - importers get a quarter of the cores (min 1, max 8), since each one
///   holds a target transaction open per batch
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let dump_workers = (cores / 2).clamp(1, 16);
    let import_workers = (cores / 4).clamp(1, 8);

    let config = TunedConfig {
        dump_workers,
        import_workers,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::debug!(
        cores = cores,
        ram_mb = ram_mb,
        dump_workers = config.dump_workers,
        import_workers = config.import_workers,
        "Auto-tuned pipeline pools based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         Pipeline: {} dump workers, {} import workers",
        config.detected_cores, config.detected_ram_mb, config.dump_workers, config.import_workers,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tune_returns_sensible_values() {
        let config = auto_tune();

        assert!(config.dump_workers >= 1);
        assert!(config.dump_workers <= 16);
        assert!(config.import_workers >= 1);
        assert!(config.import_workers <= 8);
        assert!(config.dump_workers >= config.import_workers);
    }

    #[test]
    fn test_summary_mentions_pools() {
        let summary = tuning_summary(&TunedConfig::default());
        assert!(summary.contains("2 dump workers"));
    }
}
