use crate::cancel::DEFAULT_BUDGET_SAMPLE_INTERVAL;
use crate::guard::DEFAULT_REPEAT_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DriverSettings {
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_true")]
    pub only_ascii: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_report_slow_units")]
    pub report_slow_units: u64,
    #[serde(default = "default_true")]
    pub save_minimized_corpus: bool,
    #[serde(default = "default_true")]
    pub use_traces: bool,
    #[serde(default = "default_verbosity")]
    pub verbosity: u32,
    #[serde(default = "default_corpus_dirs")]
    pub corpus_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub seed: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_len() -> usize {
    12
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_report_slow_units() -> u64 {
    2
}
fn default_verbosity() -> u32 {
    1
}
pub fn default_corpus_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/var/tmp/corpus-minimized"),
        PathBuf::from("/var/tmp/corpus"),
    ]
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            only_ascii: true,
            timeout_secs: default_timeout_secs(),
            report_slow_units: default_report_slow_units(),
            save_minimized_corpus: true,
            use_traces: true,
            verbosity: default_verbosity(),
            corpus_dirs: default_corpus_dirs(),
            seed: 0,
        }
    }
}

/// Process ceilings applied before trials start.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LimitSettings {
    #[serde(default = "default_true")]
    pub apply: bool,
    #[serde(default)]
    pub core_file_size: u64,
    #[serde(default = "default_data_seg_size")]
    pub data_seg_size: u64,
}

fn default_data_seg_size() -> u64 {
    200_000_000
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            apply: true,
            core_file_size: 0,
            data_seg_size: default_data_seg_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BudgetSettings {
    #[serde(default = "default_work_mem_kb")]
    pub work_mem_kb: usize,
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
    #[serde(default = "default_max_stack_depth_kb")]
    pub max_stack_depth_kb: usize,
}

fn default_work_mem_kb() -> usize {
    4096
}
fn default_sample_interval() -> u64 {
    DEFAULT_BUDGET_SAMPLE_INTERVAL
}
fn default_max_stack_depth_kb() -> usize {
    2048
}

impl BudgetSettings {
    pub fn ceiling_bytes(&self) -> usize {
        self.work_mem_kb.saturating_mul(1024)
    }
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            work_mem_kb: default_work_mem_kb(),
            sample_interval: default_sample_interval(),
            max_stack_depth_kb: default_max_stack_depth_kb(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GuardSettings {
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: u32,
}

fn default_repeat_threshold() -> u32 {
    DEFAULT_REPEAT_THRESHOLD
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            repeat_threshold: default_repeat_threshold(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Statement timeout left in place by environment setup.
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_statement_timeout_ms: u64,
    /// Statement timeout while fuzzing. Slow but legitimate queries must fit.
    #[serde(default = "default_run_timeout_ms")]
    pub run_statement_timeout_ms: u64,
}

fn default_setup_timeout_ms() -> u64 {
    1000
}
fn default_run_timeout_ms() -> u64 {
    3000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            setup_statement_timeout_ms: default_setup_timeout_ms(),
            run_statement_timeout_ms: default_run_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProgressSettings {
    #[serde(default = "default_leak_min_trials")]
    pub leak_min_trials: u64,
    #[serde(default = "default_leak_burst_bytes")]
    pub leak_burst_bytes: i64,
    #[serde(default = "default_leak_burst_min_trials")]
    pub leak_burst_min_trials: u64,
}

fn default_leak_min_trials() -> u64 {
    200
}
fn default_leak_burst_bytes() -> i64 {
    10_000
}
fn default_leak_burst_min_trials() -> u64 {
    5
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            leak_min_trials: default_leak_min_trials(),
            leak_burst_bytes: default_leak_burst_bytes(),
            leak_burst_min_trials: default_leak_burst_min_trials(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub guard: GuardSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub progress: ProgressSettings,
    /// Where the death callback writes final statistics as JSON.
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
}

impl HarnessConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: HarnessConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_harness_contract() {
        let config = HarnessConfig::default();
        assert_eq!(config.driver.max_len, 12);
        assert!(config.driver.only_ascii);
        assert_eq!(config.driver.timeout_secs, 30);
        assert_eq!(config.budget.sample_interval, 20_000);
        assert_eq!(config.budget.ceiling_bytes(), 4096 * 1024);
        assert_eq!(config.guard.repeat_threshold, 10);
        assert_eq!(config.timeouts.run_statement_timeout_ms, 3000);
        assert_eq!(config.limits.core_file_size, 0);
        assert!(config.limits.apply);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "stats-path = \"/tmp/stats.json\"\n\n[budget]\nwork-mem-kb = 64\n\n[driver]\nmax-len = 20\nseed = 7"
        )
        .unwrap();

        let config = HarnessConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.budget.work_mem_kb, 64);
        assert_eq!(config.budget.sample_interval, 20_000);
        assert_eq!(config.driver.max_len, 20);
        assert_eq!(config.driver.seed, 7);
        assert_eq!(config.driver.corpus_dirs, default_corpus_dirs());
        assert_eq!(config.stats_path, Some(PathBuf::from("/tmp/stats.json")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[guard]\nrepeat-limit = 3").unwrap();
        let err = HarnessConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = HarnessConfig::load_from_file(Path::new("/nonexistent/regfuzz.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn shipped_config_parses() {
        let config: HarnessConfig = toml::from_str(include_str!("../../regfuzz.toml")).unwrap();
        assert_eq!(config.driver, DriverSettings::default());
        assert_eq!(config.limits, LimitSettings::default());
        assert_eq!(config.budget, BudgetSettings::default());
        assert_eq!(config.progress, ProgressSettings::default());
    }
}
