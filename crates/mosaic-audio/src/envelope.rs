//! One-pole attack/release envelope follower.

/// Tracks the amplitude envelope of a signal with separate attack and
/// release time constants. State starts at zero so a silent prefix leaves
/// the follower untouched.
#[derive(Debug, Clone)]
pub struct EnvelopeFollower {
    attack_coef: f32,
    release_coef: f32,
    value: f32,
}

impl EnvelopeFollower {
    pub fn new(attack_ms: f32, release_ms: f32, sample_rate: u32) -> Self {
        EnvelopeFollower {
            attack_coef: one_pole_coef(attack_ms, sample_rate),
            release_coef: one_pole_coef(release_ms, sample_rate),
            value: 0.0,
        }
    }

    /// Feed one sample; returns the updated envelope.
    pub fn process(&mut self, sample: f32) -> f32 {
        let rect = sample.abs();
        let coef = if rect > self.value { self.attack_coef } else { self.release_coef };
        self.value += coef * (rect - self.value);
        self.value
    }

    /// Move toward an explicit target instead of a rectified sample;
    /// used for gain smoothing where the "signal" is a target gain.
    pub fn follow(&mut self, target: f32) -> f32 {
        let coef = if target < self.value { self.attack_coef } else { self.release_coef };
        self.value += coef * (target - self.value);
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Reset state, preserving a chosen resting value (1.0 for gains).
    pub fn reset_to(&mut self, value: f32) {
        self.value = value;
    }
}

// coef = 1 - exp(-1 / (tau_samples)); tau in ms.
fn one_pole_coef(ms: f32, sample_rate: u32) -> f32 {
    let tau_samples = (ms * sample_rate as f32 / 1000.0).max(1.0);
    1.0 - (-1.0 / tau_samples).exp()
}
