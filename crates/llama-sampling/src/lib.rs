//! # llama-sampling
//!
//! Next-token selection for llama.rs.
//!
//! A [`SamplerPipeline`] is an ordered list of [`SamplerStage`]s applied to the
//! raw logits of one decode step:
//! - Min-p filtering (relative to the most likely token)
//! - Temperature scaling
//! - A terminal seeded draw from the remaining distribution
//!
//! The pipeline owns its RNG, so two pipelines built from the same seed pick
//! the same tokens for the same logits.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    InvalidTemperature,
    InvalidMinP,
    NoValidTokens,
    MissingDistStage,
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::InvalidTemperature => write!(f, "Temperature must be > 0"),
            SamplingError::InvalidMinP => write!(f, "min_p must be in [0, 1]"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens after filtering"),
            SamplingError::MissingDistStage => {
                write!(f, "Pipeline must end with exactly one dist stage")
            }
        }
    }
}

impl std::error::Error for SamplingError {}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    /// Drop candidates whose probability is below `p` times the top
    /// probability, keeping at least `min_keep`.
    MinP { p: f32, min_keep: usize },
    /// Divide logits by the temperature.
    Temperature(f32),
    /// Draw one candidate from the softmax of what is left.
    Dist { seed: u64 },
}

impl SamplerStage {
    fn validate(&self) -> SamplingResult<()> {
        match *self {
            SamplerStage::MinP { p, .. } if !(0.0..=1.0).contains(&p) => {
                Err(SamplingError::InvalidMinP)
            }
            SamplerStage::Temperature(t) if !(t.is_finite() && t > 0.0) => {
                Err(SamplingError::InvalidTemperature)
            }
            _ => Ok(()),
        }
    }
}

/// Ordered sampler chain with its own RNG.
#[derive(Debug, Clone)]
pub struct SamplerPipeline {
    stages: Vec<SamplerStage>,
    rng: SeededRng,
}

impl SamplerPipeline {
    /// Build a pipeline; the last stage must be the only `Dist`.
    pub fn new(stages: Vec<SamplerStage>) -> SamplingResult<Self> {
        for stage in &stages {
            stage.validate()?;
        }
        let dist_count = stages
            .iter()
            .filter(|s| matches!(s, SamplerStage::Dist { .. }))
            .count();
        let seed = match stages.last() {
            Some(SamplerStage::Dist { seed }) if dist_count == 1 => *seed,
            _ => return Err(SamplingError::MissingDistStage),
        };
        Ok(Self {
            stages,
            rng: SeededRng::new(seed),
        })
    }

    /// min-p 0.05 (keep 1), temperature 0.8, seeded draw.
    pub fn baseline(seed: u64) -> Self {
        Self {
            stages: vec![
                SamplerStage::MinP {
                    p: 0.05,
                    min_keep: 1,
                },
                SamplerStage::Temperature(0.8),
                SamplerStage::Dist { seed },
            ],
            rng: SeededRng::new(seed),
        }
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Pick a token index from `logits` and advance the RNG.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .collect();
        if candidates.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        for stage in &self.stages {
            match *stage {
                SamplerStage::MinP { p, min_keep } => apply_min_p(&mut candidates, p, min_keep),
                SamplerStage::Temperature(t) => {
                    for (_, logit) in candidates.iter_mut() {
                        *logit /= t;
                    }
                }
                SamplerStage::Dist { .. } => {
                    let r = self.rng.next_f32();
                    return draw(&candidates, r);
                }
            }
        }
        Err(SamplingError::MissingDistStage)
    }
}

/// Keep candidates with `prob >= p * p_max`, i.e. `logit >= max + ln p`.
fn apply_min_p(candidates: &mut Vec<(usize, f32)>, p: f32, min_keep: usize) {
    if p <= 0.0 || candidates.len() <= min_keep.max(1) {
        return;
    }
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let max_logit = candidates[0].1;
    let threshold = max_logit + p.ln();
    let passing = candidates.iter().take_while(|(_, l)| *l >= threshold).count();
    candidates.truncate(passing.max(min_keep.max(1)));
}

fn draw(candidates: &[(usize, f32)], r: f32) -> SamplingResult<usize> {
    let probs = softmax(candidates);
    let mut cumsum = 0.0;
    for (&(id, _), &prob) in candidates.iter().zip(&probs) {
        cumsum += prob;
        if r < cumsum {
            return Ok(id);
        }
    }

    // Fallback to last candidate with nonzero probability
    candidates
        .iter()
        .zip(&probs)
        .rev()
        .find(|(_, prob)| **prob > 0.0)
        .map(|(&(id, _), _)| id)
        .ok_or(SamplingError::NoValidTokens)
}

fn softmax(candidates: &[(usize, f32)]) -> Vec<f32> {
    let max_logit = candidates
        .iter()
        .map(|&(_, l)| l)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates
        .iter()
        .map(|&(_, l)| (l - max_logit).exp())
        .collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / candidates.len() as f32; candidates.len()]
    }
}

/// User-facing sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub min_p: f32,
    pub temperature: f32,
    /// Fixed seed; when absent one is derived from the clock.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min_p: 0.05,
            temperature: 0.8,
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn resolved_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x5eed)
        })
    }

    pub fn build(&self) -> SamplingResult<SamplerPipeline> {
        SamplerPipeline::new(vec![
            SamplerStage::MinP {
                p: self.min_p,
                min_keep: 1,
            },
            SamplerStage::Temperature(self.temperature),
            SamplerStage::Dist {
                seed: self.resolved_seed(),
            },
        ])
    }
}
