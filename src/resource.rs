//! Resource-aware concurrency sizing.
//!
//! Every operation class declares `[min, max]` bounds and an estimated memory
//! cost per concurrent unit. [`ResourceManager::concurrency`] combines those
//! with a fresh [`ResourceSnapshot`]:
//!
//! ```text
//! memory_bound = floor(free_memory_gb * 0.7 / cost_per_unit)
//! cpu_bound    = max(2, floor(cpu_cores * 0.75))
//! result       = clamp(min(memory_bound, cpu_bound), min, max)
//! ```
//!
//! An explicit override (`class:value,class:value`) wins over the computed
//! value, and the runtime throttle multiplier scales whatever is chosen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::contract::{ResourceProvider, ResourceSnapshot};
use crate::error::ResourceError;

const MEMORY_HEADROOM: f64 = 0.7;
const CPU_SHARE: f64 = 0.75;
const CPU_FLOOR: usize = 2;

pub const MIN_RATE_MULTIPLIER: f64 = 0.1;
pub const MAX_RATE_MULTIPLIER: f64 = 1.0;

/// A class of work sized independently by the resource manager.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationClass {
    pub name: &'static str,
    pub min: usize,
    pub max: usize,
    /// Estimated resident memory per concurrent unit, in GB.
    pub memory_cost_gb: f64,
}

impl OperationClass {
    /// Per-item document pipelines (fetch, resolve, write).
    pub const PAGES: OperationClass = OperationClass {
        name: "pages",
        min: 1,
        max: 16,
        memory_cost_gb: 0.25,
    };

    /// Raw asset downloads.
    pub const DOWNLOADS: OperationClass = OperationClass {
        name: "downloads",
        min: 2,
        max: 32,
        memory_cost_gb: 0.05,
    };

    /// Image decode / resize / re-encode.
    pub const IMAGES: OperationClass = OperationClass {
        name: "images",
        min: 1,
        max: 8,
        memory_cost_gb: 0.5,
    };

    pub fn new(
        name: &'static str,
        min: usize,
        max: usize,
        memory_cost_gb: f64,
    ) -> Result<Self, ResourceError> {
        if min > max {
            return Err(ResourceError::InvalidBounds {
                class: name.to_string(),
                min,
                max,
            });
        }
        Ok(Self {
            name,
            min,
            max,
            memory_cost_gb,
        })
    }

    pub fn defaults() -> Vec<OperationClass> {
        vec![Self::PAGES, Self::DOWNLOADS, Self::IMAGES]
    }
}

/// Pure sizing rule, without overrides or throttling.
pub fn compute_concurrency(class: &OperationClass, snapshot: &ResourceSnapshot) -> usize {
    let memory_bound = if class.memory_cost_gb > 0.0 {
        // `as usize` saturates: NaN and negatives become 0, infinity usize::MAX.
        (snapshot.free_memory_gb * MEMORY_HEADROOM / class.memory_cost_gb).floor() as usize
    } else {
        usize::MAX
    };
    let cpu_bound = ((snapshot.cpu_cores as f64 * CPU_SHARE).floor() as usize).max(CPU_FLOOR);

    memory_bound.min(cpu_bound).max(class.min).min(class.max)
}

/// Parses an override string of the form `class:value,class:value`.
///
/// Whitespace around entries is ignored and an empty string yields no overrides.
pub fn parse_overrides(
    spec: &str,
    classes: &[OperationClass],
) -> Result<HashMap<&'static str, usize>, ResourceError> {
    let mut overrides = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (class, value) = entry
            .split_once(':')
            .ok_or_else(|| ResourceError::MalformedOverride(entry.to_string()))?;
        let class = class.trim();
        let value = value.trim();
        let known = classes
            .iter()
            .find(|c| c.name == class)
            .ok_or_else(|| ResourceError::UnknownClass(class.to_string()))?;
        let parsed = value
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| ResourceError::InvalidValue {
                class: class.to_string(),
                value: value.to_string(),
            })?;
        overrides.insert(known.name, parsed);
    }
    Ok(overrides)
}

/// Computes safe concurrency ceilings per operation class.
pub struct ResourceManager {
    provider: Arc<dyn ResourceProvider>,
    classes: Vec<OperationClass>,
    overrides: HashMap<&'static str, usize>,
    rate_multiplier: AtomicU64,
}

impl ResourceManager {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            provider,
            classes: OperationClass::defaults(),
            overrides: HashMap::new(),
            rate_multiplier: AtomicU64::new(MAX_RATE_MULTIPLIER.to_bits()),
        }
    }

    /// Replaces the registered classes. Overrides are validated against these.
    pub fn with_classes(mut self, classes: Vec<OperationClass>) -> Self {
        self.classes = classes;
        self
    }

    /// Applies an override string. A malformed string is a configuration error.
    pub fn with_overrides(mut self, spec: &str) -> Result<Self, ResourceError> {
        self.overrides = parse_overrides(spec, &self.classes)?;
        if !self.overrides.is_empty() {
            info!(overrides = ?self.overrides, "[RESOURCE] Concurrency overrides active");
        }
        Ok(self)
    }

    pub fn classes(&self) -> &[OperationClass] {
        &self.classes
    }

    /// Current throttle multiplier in `[0.1, 1.0]`.
    pub fn rate_multiplier(&self) -> f64 {
        f64::from_bits(self.rate_multiplier.load(Ordering::Relaxed))
    }

    /// Sets the throttle multiplier, clamped into `[0.1, 1.0]`.
    pub fn set_rate_multiplier(&self, multiplier: f64) {
        let clamped = if multiplier.is_nan() {
            MAX_RATE_MULTIPLIER
        } else {
            multiplier.clamp(MIN_RATE_MULTIPLIER, MAX_RATE_MULTIPLIER)
        };
        if clamped != multiplier {
            warn!(requested = multiplier, applied = clamped, "[RESOURCE] Rate multiplier clamped");
        }
        self.rate_multiplier
            .store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// Safe concurrency for `class`, never below 1.
    pub fn concurrency(&self, class: &OperationClass) -> usize {
        let base = match self.overrides.get(class.name) {
            Some(value) => *value,
            None => compute_concurrency(class, &self.provider.snapshot()),
        };
        let scaled = ((base as f64) * self.rate_multiplier()).floor() as usize;
        let result = scaled.max(1);
        debug!(class = class.name, base, result, "[RESOURCE] Concurrency decided");
        result
    }
}

/// Reads the real host: logical CPUs and `/proc/meminfo` on Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResources;

impl ResourceProvider for SystemResources {
    fn snapshot(&self) -> ResourceSnapshot {
        let (free_kb, total_kb) = read_meminfo().unwrap_or((FALLBACK_FREE_KB, FALLBACK_TOTAL_KB));
        ResourceSnapshot {
            cpu_cores: detect_cpu_cores(),
            free_memory_gb: kb_to_gb(free_kb),
            total_memory_gb: kb_to_gb(total_kb),
        }
    }
}

const FALLBACK_TOTAL_KB: u64 = 8 * 1024 * 1024;
const FALLBACK_FREE_KB: u64 = 4 * 1024 * 1024;

fn kb_to_gb(kb: u64) -> f64 {
    kb as f64 / (1024.0 * 1024.0)
}

/// Number of logical CPUs, 1 if detection fails.
pub fn detect_cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content)
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo() -> Option<(u64, u64)> {
    None
}

/// Returns `(available_kb, total_kb)`; `MemFree` stands in when `MemAvailable` is absent.
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        content
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let free = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((free, total))
}
