//! Soft-knee bus compressor.

use crate::envelope::EnvelopeFollower;
use crate::{db_to_lin, lin_to_db};

/// Static curve and timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub ratio: f32,
    pub knee_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        CompressorParams {
            threshold_db: -12.0,
            ratio: 4.0,
            knee_db: 6.0,
            attack_ms: 8.0,
            release_ms: 120.0,
            makeup_db: 3.0,
        }
    }
}

/// Feed-forward single-band compressor: a level follower drives a
/// soft-knee gain computer, makeup is applied after reduction.
#[derive(Debug, Clone)]
pub struct BusCompressor {
    params: CompressorParams,
    level: EnvelopeFollower,
    makeup_lin: f32,
}

impl BusCompressor {
    pub fn new(params: CompressorParams, sample_rate: u32) -> Self {
        BusCompressor {
            level: EnvelopeFollower::new(params.attack_ms, params.release_ms, sample_rate),
            makeup_lin: db_to_lin(params.makeup_db),
            params,
        }
    }

    /// Compress one sample.
    pub fn process(&mut self, sample: f32) -> f32 {
        let env = self.level.process(sample);
        if env <= 0.0 {
            // Silence: no reduction, and makeup on zero is still zero.
            return sample * self.makeup_lin;
        }
        let level_db = lin_to_db(env);
        let reduction_db = self.gain_reduction_db(level_db);
        sample * db_to_lin(reduction_db) * self.makeup_lin
    }

    // Classic soft-knee gain computer (reduction is <= 0 dB).
    fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let p = &self.params;
        let over = level_db - p.threshold_db;
        let half_knee = p.knee_db / 2.0;
        let slope = 1.0 / p.ratio - 1.0;
        if over <= -half_knee {
            0.0
        } else if over < half_knee {
            let t = over + half_knee;
            slope * t * t / (2.0 * p.knee_db)
        } else {
            slope * over
        }
    }
}
