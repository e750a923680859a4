//! Glue between the harness and a coverage-guided fuzz engine.
//!
//! The engine owns the main loop. It calls [`FuzzTarget::execute_one`] once per
//! generated input, [`FuzzTarget::on_death`] before it exits, and receives named
//! findings through a [`FindingSink`].

use crate::config::DriverSettings;
use crate::findings::FindingSink;
use crate::signals;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Callbacks the fuzz engine invokes.
pub trait FuzzTarget {
    /// Runs one input. `None` means the engine had no buffer to hand over.
    fn execute_one(&mut self, data: Option<&[u8]>);
    fn on_death(&mut self);
}

pub trait FuzzEngine {
    /// Runs the fuzz loop to completion and returns the process exit code.
    fn fuzz(&mut self, options: &DriverOptions, target: &mut dyn FuzzTarget) -> i32;
    /// Where the harness sends named findings.
    fn finding_sink(&self) -> Arc<dyn FindingSink>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    pub runs: u64,
    pub verbosity: u32,
    pub only_ascii: bool,
    pub timeout: Duration,
    pub report_slow_units: Duration,
    pub save_minimized_corpus: bool,
    pub use_traces: bool,
    pub corpus_dirs: Vec<PathBuf>,
    pub max_len: usize,
    pub seed: u64,
}

impl DriverOptions {
    pub fn from_settings(settings: &DriverSettings, runs: u64) -> Self {
        Self {
            runs,
            verbosity: settings.verbosity,
            only_ascii: settings.only_ascii,
            timeout: Duration::from_secs(settings.timeout_secs),
            report_slow_units: Duration::from_secs(settings.report_slow_units),
            save_minimized_corpus: settings.save_minimized_corpus,
            use_traces: settings.use_traces,
            corpus_dirs: settings.corpus_dirs.clone(),
            max_len: settings.max_len,
            seed: settings.seed,
        }
    }

    /// Renders the options as an argv for engines that parse libFuzzer flags.
    pub fn to_args(&self) -> Vec<String> {
        let flag = |b: bool| u8::from(b);
        let mut args = vec![
            "regfuzz".to_string(),
            format!("-runs={}", self.runs),
            format!("-verbosity={}", self.verbosity),
            format!("-only_ascii={}", flag(self.only_ascii)),
            format!("-timeout={}", self.timeout.as_secs()),
            format!("-report_slow_units={}", self.report_slow_units.as_secs()),
            format!("-save_minimized_corpus={}", flag(self.save_minimized_corpus)),
            format!("-use_traces={}", flag(self.use_traces)),
        ];
        args.extend(self.corpus_dirs.iter().map(|d| d.display().to_string()));
        args.push(format!("-max_len={}", self.max_len));
        args
    }
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from_settings(&DriverSettings::default(), 0)
    }
}

/// Installs crash translation, then hands control to the fuzz engine.
pub fn drive<F: FuzzEngine + ?Sized>(
    engine: &mut F,
    options: &DriverOptions,
    target: &mut dyn FuzzTarget,
) -> i32 {
    if let Err(e) = signals::install_crash_translation() {
        warn!("could not install abort translation: {e}");
    }
    info!("starting fuzz engine: {}", options.to_args().join(" "));
    engine.fuzz(options, target)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub name: String,
    pub input: Vec<u8>,
    pub input_hash: String,
}

/// Records named findings against the input currently being executed.
#[derive(Debug, Default)]
pub struct FindingLog {
    current: Mutex<Vec<u8>>,
    findings: Mutex<Vec<Finding>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FindingLog {
    pub fn set_current(&self, input: &[u8]) {
        let mut current = lock(&self.current);
        current.clear();
        current.extend_from_slice(input);
    }

    pub fn findings(&self) -> Vec<Finding> {
        lock(&self.findings).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.findings).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FindingSink for FindingLog {
    fn report_error(&self, name: &str) {
        let input = lock(&self.current).clone();
        let input_hash = format!("{:x}", md5::compute(&input));
        lock(&self.findings).push(Finding {
            name: name.to_string(),
            input,
            input_hash,
        });
    }
}

/// Generation-only stand-in for a coverage-guided engine: seeded random inputs,
/// no mutation, no coverage feedback, no corpus persistence.
#[derive(Debug)]
pub struct RandomDriver {
    rng: ChaCha8Rng,
    log: Arc<FindingLog>,
}

impl RandomDriver {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            log: Arc::new(FindingLog::default()),
        }
    }

    pub fn log(&self) -> &Arc<FindingLog> {
        &self.log
    }

    fn generate(&mut self, options: &DriverOptions) -> Vec<u8> {
        let len = self.rng.random_range(0..=options.max_len);
        (0..len)
            .map(|_| {
                if options.only_ascii {
                    self.rng.random_range(32u8..127u8)
                } else {
                    self.rng.random()
                }
            })
            .collect()
    }
}

impl FuzzEngine for RandomDriver {
    fn fuzz(&mut self, options: &DriverOptions, target: &mut dyn FuzzTarget) -> i32 {
        let started = Instant::now();
        for _ in 0..options.runs {
            let input = self.generate(options);
            self.log.set_current(&input);

            let unit_started = Instant::now();
            target.execute_one(Some(&input));
            let elapsed = unit_started.elapsed();

            if elapsed >= options.timeout {
                warn!(
                    "unit took {:?}, over the {:?} timeout: {:?}",
                    elapsed,
                    options.timeout,
                    String::from_utf8_lossy(&input)
                );
                self.log.report_error("timeout");
            } else if options.verbosity > 0 && elapsed >= options.report_slow_units {
                info!(
                    "slow unit: {:?} for {:?}",
                    elapsed,
                    String::from_utf8_lossy(&input)
                );
            }
        }
        target.on_death();
        info!(
            "done {} runs in {:?}, {} findings",
            options.runs,
            started.elapsed(),
            self.log.len()
        );
        0
    }

    fn finding_sink(&self) -> Arc<dyn FindingSink> {
        self.log.clone()
    }
}
