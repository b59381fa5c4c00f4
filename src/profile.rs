//! In-memory profile: a named set of stack samples with typed values.
//!
//! Every instrumentation backend produces a [`Profile`]; the dispatcher then
//! serializes it as pprof protobuf ([`crate::encode`]), as readable text, or
//! as folded stacks.

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use itertools::Itertools;

/// A sample value's kind and unit, e.g. `contentions`/`count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueType {
    pub kind: String,
    pub unit: String,
}

impl ValueType {
    /// Create a value type
    pub fn new(kind: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            unit: unit.into(),
        }
    }
}

/// One aggregated stack with its values, in `sample_types` order.
///
/// Frames are leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub frames: Vec<String>,
    pub values: Vec<i64>,
}

impl Sample {
    /// Create a sample
    #[must_use]
    pub const fn new(frames: Vec<String>, values: Vec<i64>) -> Self {
        Self { frames, values }
    }
}

/// A named sample set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    name: String,
    sample_types: Vec<ValueType>,
    period_type: Option<ValueType>,
    period: i64,
    duration: Duration,
    default_sample_type: Option<String>,
    samples: Vec<Sample>,
}

impl Profile {
    /// Create an empty profile with the given sample types.
    pub fn new(name: impl Into<String>, sample_types: Vec<ValueType>) -> Self {
        Self {
            name: name.into(),
            sample_types,
            period_type: None,
            period: 0,
            duration: Duration::ZERO,
            default_sample_type: None,
            samples: Vec::new(),
        }
    }

    /// Set the sampling period and its type.
    #[must_use]
    pub fn with_period(mut self, period_type: ValueType, period: i64) -> Self {
        self.period_type = Some(period_type);
        self.period = period;
        self
    }

    /// Set the wall time covered by the profile.
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Name the sample type readers show first, e.g. `inuse_space`.
    #[must_use]
    pub fn with_default_sample_type(mut self, kind: impl Into<String>) -> Self {
        self.default_sample_type = Some(kind.into());
        self
    }

    /// Append a sample. Samples with the same frames are merged.
    pub fn add(&mut self, frames: Vec<String>, values: Vec<i64>) {
        match self.samples.iter_mut().find(|s| s.frames == frames) {
            Some(existing) => {
                for (acc, value) in existing.values.iter_mut().zip(values) {
                    *acc = acc.saturating_add(value);
                }
            }
            None => self.samples.push(Sample::new(frames, values)),
        }
    }

    /// Build a profile from a map of stacks to values.
    pub fn from_stacks(
        name: impl Into<String>,
        sample_types: Vec<ValueType>,
        stacks: HashMap<Vec<String>, Vec<i64>>,
    ) -> Self {
        let mut profile = Self::new(name, sample_types);
        profile.samples = stacks
            .into_iter()
            .map(|(frames, values)| Sample::new(frames, values))
            .sorted_by(|a, b| b.values.cmp(&a.values).then_with(|| a.frames.cmp(&b.frames)))
            .collect();
        profile
    }

    /// Get the profile name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the sample types
    #[must_use]
    pub fn sample_types(&self) -> &[ValueType] {
        &self.sample_types
    }

    /// Get the period type
    #[must_use]
    pub const fn period_type(&self) -> Option<&ValueType> {
        self.period_type.as_ref()
    }

    /// Get the sampling period
    #[must_use]
    pub const fn period(&self) -> i64 {
        self.period
    }

    /// Get the covered duration
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Get the default sample type, if one was set
    #[must_use]
    pub fn default_sample_type(&self) -> Option<&str> {
        self.default_sample_type.as_deref()
    }

    /// Get the samples
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Render a human-readable text profile.
    ///
    /// ```text
    /// --- mutex:
    /// sample_types=contentions/count delay/nanoseconds
    /// sampling period=10
    /// 3 1200 @ app::worker <- std::thread::spawn
    /// #	app::worker
    /// #	std::thread::spawn
    /// ```
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "--- {}:", self.name)?;
        writeln!(
            out,
            "sample_types={}",
            self.sample_types
                .iter()
                .map(|t| format!("{}/{}", t.kind, t.unit))
                .join(" ")
        )?;
        if let Some(kind) = &self.default_sample_type {
            writeln!(out, "default_sample_type={kind}")?;
        }
        if let Some(period_type) = &self.period_type {
            writeln!(
                out,
                "sampling period={} {}/{}",
                self.period, period_type.kind, period_type.unit
            )?;
        }
        if !self.duration.is_zero() {
            writeln!(out, "duration={}ms", self.duration.as_millis())?;
        }
        for sample in &self.samples {
            writeln!(
                out,
                "{} @ {}",
                sample.values.iter().join(" "),
                sample.frames.iter().join(" <- ")
            )?;
            for frame in &sample.frames {
                writeln!(out, "#\t{frame}")?;
            }
        }
        Ok(())
    }

    /// Render folded stacks (`root;...;leaf value`), using the first value.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn write_folded<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for sample in &self.samples {
            let value = sample.values.first().copied().unwrap_or_default();
            writeln!(out, "{} {value}", sample.frames.iter().rev().join(";"))?;
        }
        Ok(())
    }
}
