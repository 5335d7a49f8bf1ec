//! Run argument construction and quantization negotiation

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Parameters callers may pass through to `run`.
pub const ALLOWED_RUN_PARAMS: &[&str] = &["temperature", "context", "threads", "gpu", "seed"];

/// Caller-supplied run parameters, ordered so argument lists are stable.
pub type RunParams = BTreeMap<String, String>;

/// Engines at or above this version understand `--quantization`.
pub const QUANTIZATION_MIN_VERSION: (u32, u32, u32) = (0, 1, 0);

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version pattern is valid")
});

/// Build `run <model> --<param> <value> ...`, dropping keys outside the allow-list.
pub fn build_run_args(model: &str, params: &RunParams) -> Vec<String> {
    let mut args = vec!["run".to_string(), model.to_string()];
    for (key, value) in params {
        if ALLOWED_RUN_PARAMS.contains(&key.as_str()) {
            args.push(format!("--{key}"));
            args.push(value.clone());
        } else {
            warn!(model, param = %key, "Dropping unsupported run parameter");
        }
    }
    args
}

/// Extract `(major, minor, patch)` from version output such as
/// `ollama version is 0.1.32`.
pub fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION.captures(text)?;
    let major = caps.get(1)?.as_str().parse().ok()?;
    let minor = caps.get(2)?.as_str().parse().ok()?;
    let patch = match caps.get(3) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    Some((major, minor, patch))
}

/// Flag appended to `run` when reduced precision is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationFlag {
    /// `--quantization=8bit`
    EightBit,
    /// `--f16`, for engines that predate `--quantization`
    HalfPrecision,
}

impl QuantizationFlag {
    pub fn as_arg(&self) -> &'static str {
        match self {
            QuantizationFlag::EightBit => "--quantization=8bit",
            QuantizationFlag::HalfPrecision => "--f16",
        }
    }
}

impl fmt::Display for QuantizationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// Pick a quantization flag from the version probe output.
///
/// `None` means the probe failed and no flag should be passed.
pub fn negotiate_quantization(probe: Option<&str>) -> Option<QuantizationFlag> {
    let Some(output) = probe else {
        warn!("Could not determine engine version, running without quantization flag");
        return None;
    };

    match parse_version(output) {
        Some(version) if version >= QUANTIZATION_MIN_VERSION => Some(QuantizationFlag::EightBit),
        _ => Some(QuantizationFlag::HalfPrecision),
    }
}
