//! Sampler contract for generation, plus greedy and nucleus samplers.
//!
//! A sampler sees one row of replicated logits per step. Every worker of a
//! shard group calls it with the same seed and logits, so every worker picks
//! the same token without a broadcast.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Error, Result};

/// Parameters for sampling
#[derive(Debug, Clone)]
pub struct SamplingOptions {
    /// Temperature for logit scaling (higher = more random). Must be > 0.
    pub temperature: f32,
    /// Nucleus probability threshold in (0, 1].
    pub top_p: f32,
    /// Base seed; step `t` samples with `seed + t`.
    pub seed: u64,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            seed: 42,
        }
    }
}

/// What the sampler knows about the step it is sampling for.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Zero-based index of the token being generated.
    pub step: usize,
    /// Token fed to the decode step that produced these logits.
    pub token: u32,
    /// Tokens generated so far in this sequence.
    pub generated: &'a [u32],
}

/// Side information returned with every sampled token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleInfo {
    /// Probability the sampler assigned to the chosen token.
    pub probability: f32,
}

pub trait Sampler: Send + Sync {
    /// Pick the next token from one row of logits.
    ///
    /// # Errors
    /// Returns an error for empty logits or invalid options.
    fn sample(
        &self,
        seed: u64,
        logits: &[f32],
        step: StepInput<'_>,
        options: &SamplingOptions,
    ) -> Result<(u32, SampleInfo)>;
}

/// Always picks the highest logit; ties go to the lowest index.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(
        &self,
        _seed: u64,
        logits: &[f32],
        _step: StepInput<'_>,
        _options: &SamplingOptions,
    ) -> Result<(u32, SampleInfo)> {
        let probs = softmax(logits, 1.0)?;
        let (idx, p) = argmax(&probs);
        Ok((token_id(idx)?, SampleInfo { probability: p }))
    }
}

/// Temperature + top-p sampling with a seeded `StdRng`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NucleusSampler;

impl Sampler for NucleusSampler {
    fn sample(
        &self,
        seed: u64,
        logits: &[f32],
        _step: StepInput<'_>,
        options: &SamplingOptions,
    ) -> Result<(u32, SampleInfo)> {
        if options.temperature <= 0.0 || !(options.top_p > 0.0 && options.top_p <= 1.0) {
            return Err(Error::InvalidInput(format!(
                "temperature {} / top_p {} out of range",
                options.temperature, options.top_p
            )));
        }
        let probs = softmax(logits, options.temperature)?;

        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut cumulative = 0.0f32;
        let mut cutoff = indexed.len();
        for (i, &(_, p)) in indexed.iter().enumerate() {
            cumulative += p;
            if cumulative >= options.top_p {
                cutoff = i + 1;
                break;
            }
        }
        let nucleus = &indexed[..cutoff];

        let nucleus_sum: f32 = nucleus.iter().map(|(_, p)| p).sum();
        let mut rng = StdRng::seed_from_u64(seed);
        let r: f32 = rng.gen();
        let mut cumul = 0.0;
        for &(idx, p) in nucleus {
            cumul += p / nucleus_sum;
            if cumul >= r {
                return Ok((token_id(idx)?, SampleInfo { probability: p }));
            }
        }
        let (idx, p) = nucleus[0];
        Ok((token_id(idx)?, SampleInfo { probability: p }))
    }
}

fn softmax(logits: &[f32], temperature: f32) -> Result<Vec<f32>> {
    if logits.is_empty() {
        return Err(Error::InvalidInput("cannot sample from empty logits".into()));
    }
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|l| ((l - max_logit) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }
    Ok(probs)
}

fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &v) in values.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

fn token_id(idx: usize) -> Result<u32> {
    u32::try_from(idx).map_err(|_| Error::InvalidInput(format!("token index {idx} overflows u32")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> StepInput<'static> {
        StepInput {
            step: 0,
            token: 0,
            generated: &[],
        }
    }

    #[test]
    fn test_greedy_picks_max() {
        let (tok, info) = GreedySampler
            .sample(0, &[0.1, 3.0, -1.0, 3.0], step(), &SamplingOptions::default())
            .unwrap();
        assert_eq!(tok, 1);
        assert!(info.probability > 0.4 && info.probability < 0.5);
    }

    #[test]
    fn test_nucleus_is_seed_deterministic() {
        let logits = [1.0, 1.2, 0.8, 1.1, 0.9];
        let options = SamplingOptions {
            temperature: 1.0,
            top_p: 1.0,
            seed: 0,
        };
        let a = NucleusSampler.sample(7, &logits, step(), &options).unwrap();
        let b = NucleusSampler.sample(7, &logits, step(), &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tiny_top_p_is_greedy() {
        let logits = [0.0, 5.0, 1.0];
        let options = SamplingOptions {
            temperature: 0.7,
            top_p: 1e-6,
            seed: 0,
        };
        for seed in 0..16 {
            let (tok, _) = NucleusSampler.sample(seed, &logits, step(), &options).unwrap();
            assert_eq!(tok, 1);
        }
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = SamplingOptions {
            temperature: 0.0,
            ..SamplingOptions::default()
        };
        assert!(NucleusSampler
            .sample(0, &[1.0, 2.0], step(), &options)
            .is_err());
        assert!(GreedySampler
            .sample(0, &[], step(), &SamplingOptions::default())
            .is_err());
    }
}
