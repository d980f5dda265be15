//! N→1 mixer with per-source ducking and crowd scaling.

use tracing::debug;

use crate::dynamics::{BusCompressor, CompressorParams};
use crate::envelope::EnvelopeFollower;
use crate::{db_to_lin, lin_to_db};

/// Mixer tuning. Defaults match the protocol's reference behavior.
#[derive(Debug, Clone, Copy)]
pub struct MixerParams {
    pub sample_rate: u32,
    /// Envelope/duck-gain attack.
    pub attack_ms: f32,
    /// Envelope/duck-gain release.
    pub release_ms: f32,
    /// Sources whose envelope sits below this are treated as silent.
    pub activity_floor_db: f32,
    /// A source within this margin of the loudest active source is a
    /// leader and is not ducked.
    pub leader_margin_db: f32,
    /// Attenuation applied to non-leaders.
    pub duck_db: f32,
    pub base_gain: f32,
    /// Crowd scaling exponent: bus gain is `base_gain · n^-alpha` for n
    /// active sources.
    pub crowd_alpha: f32,
    pub compressor: CompressorParams,
}

impl Default for MixerParams {
    fn default() -> Self {
        MixerParams {
            sample_rate: 48_000,
            attack_ms: 12.0,
            release_ms: 160.0,
            activity_floor_db: -70.0,
            leader_margin_db: 6.0,
            duck_db: -12.0,
            base_gain: 1.0,
            crowd_alpha: 0.5,
            compressor: CompressorParams::default(),
        }
    }
}

struct Source {
    slot: u32,
    env: EnvelopeFollower,
    gain: EnvelopeFollower,
}

/// The mixing bus. Sources are registered by slot id; per-sample input is
/// a sparse `(slot, sample)` list and anything unlisted reads as silence.
pub struct Mixer {
    params: MixerParams,
    duck_lin: f32,
    floor_lin: f32,
    margin_lin: f32,
    sources: Vec<Source>,
    comp: BusCompressor,
}

impl Mixer {
    pub fn new(params: MixerParams) -> Self {
        Mixer {
            duck_lin: db_to_lin(params.duck_db),
            floor_lin: db_to_lin(params.activity_floor_db),
            margin_lin: db_to_lin(-params.leader_margin_db),
            sources: Vec::new(),
            comp: BusCompressor::new(params.compressor, params.sample_rate),
            params,
        }
    }

    /// Register a source. Idempotent; a re-added slot keeps its state.
    pub fn add_source(&mut self, slot: u32) {
        if self.sources.iter().any(|s| s.slot == slot) {
            return;
        }
        let mut gain = EnvelopeFollower::new(
            self.params.attack_ms,
            self.params.release_ms,
            self.params.sample_rate,
        );
        gain.reset_to(1.0);
        self.sources.push(Source {
            slot,
            env: EnvelopeFollower::new(
                self.params.attack_ms,
                self.params.release_ms,
                self.params.sample_rate,
            ),
            gain,
        });
        debug!(slot, sources = self.sources.len(), "mixer source added");
    }

    pub fn remove_source(&mut self, slot: u32) {
        self.sources.retain(|s| s.slot != slot);
        debug!(slot, sources = self.sources.len(), "mixer source removed");
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Current duck gain of a source, for diagnostics and tests.
    pub fn source_gain(&self, slot: u32) -> Option<f32> {
        self.sources.iter().find(|s| s.slot == slot).map(|s| s.gain.value())
    }

    /// Current envelope of a source in dB.
    pub fn source_level_db(&self, slot: u32) -> Option<f32> {
        self.sources.iter().find(|s| s.slot == slot).map(|s| lin_to_db(s.env.value()))
    }

    /// Produce one output sample from one sample per source.
    pub fn mix_sample(&mut self, inputs: &[(u32, f32)]) -> f32 {
        // Pass 1: envelopes and activity.
        let mut loudest = 0.0f32;
        let mut active_count = 0usize;
        for src in &mut self.sources {
            let sample = lookup(inputs, src.slot);
            let env = src.env.process(sample);
            if env >= self.floor_lin {
                active_count += 1;
                if env > loudest {
                    loudest = env;
                }
            }
        }

        // Pass 2: duck targets and the sum.
        let leader_floor = loudest * self.margin_lin;
        let mut sum = 0.0f32;
        for src in &mut self.sources {
            let env = src.env.value();
            let active = env >= self.floor_lin;
            let target = if active && env < leader_floor { self.duck_lin } else { 1.0 };
            let gain = src.gain.follow(target);
            sum += lookup(inputs, src.slot) * gain;
        }

        let crowd = if active_count > 0 {
            self.params.base_gain * (active_count as f32).powf(-self.params.crowd_alpha)
        } else {
            self.params.base_gain
        };

        self.comp.process(sum * crowd).clamp(-1.0, 1.0)
    }

    /// Mix whole blocks: `inputs` pairs slot ids with per-source sample
    /// blocks (shorter blocks are padded with silence). `out` length
    /// decides the frame count.
    pub fn mix_block(&mut self, inputs: &[(u32, &[f32])], out: &mut [f32]) {
        let mut frame: Vec<(u32, f32)> = Vec::with_capacity(inputs.len());
        for (i, slot_out) in out.iter_mut().enumerate() {
            frame.clear();
            for (slot, block) in inputs {
                frame.push((*slot, block.get(i).copied().unwrap_or(0.0)));
            }
            *slot_out = self.mix_sample(&frame);
        }
    }
}

fn lookup(inputs: &[(u32, f32)], slot: u32) -> f32 {
    inputs
        .iter()
        .find(|(s, _)| *s == slot)
        .map(|(_, v)| *v)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_to_samples(ms: u32) -> usize {
        48_000 * ms as usize / 1000
    }

    #[test]
    fn ducking_settles_to_expected_gains() {
        // -6 dBFS and -30 dBFS steady sources; after 200 ms the louder
        // gain is ~1.0 and the quieter ~10^(-12/20) within 5%.
        let mut mixer = Mixer::new(MixerParams::default());
        mixer.add_source(1);
        mixer.add_source(2);
        let loud = db_to_lin(-6.0);
        let quiet = db_to_lin(-30.0);
        for _ in 0..ms_to_samples(200) {
            mixer.mix_sample(&[(1, loud), (2, quiet)]);
        }
        let g_loud = mixer.source_gain(1).unwrap();
        let g_quiet = mixer.source_gain(2).unwrap();
        assert!((g_loud - 1.0).abs() < 0.05, "loud gain {g_loud}");
        let expect = db_to_lin(-12.0);
        assert!(
            (g_quiet - expect).abs() / expect < 0.05,
            "quiet gain {g_quiet}, expected ~{expect}"
        );
    }

    #[test]
    fn comparable_sources_are_co_leaders() {
        // Two sources within the 6 dB margin: neither is ducked.
        let mut mixer = Mixer::new(MixerParams::default());
        mixer.add_source(1);
        mixer.add_source(2);
        let a = db_to_lin(-6.0);
        let b = db_to_lin(-9.0);
        for _ in 0..ms_to_samples(200) {
            mixer.mix_sample(&[(1, a), (2, b)]);
        }
        assert!((mixer.source_gain(1).unwrap() - 1.0).abs() < 0.05);
        assert!((mixer.source_gain(2).unwrap() - 1.0).abs() < 0.05);
    }

    #[test]
    fn inactive_sources_do_not_count_toward_crowd() {
        let mut mixer = Mixer::new(MixerParams::default());
        for slot in 1..=8 {
            mixer.add_source(slot);
        }
        // Only slot 1 speaks; the rest are silent.
        let amp = db_to_lin(-20.0);
        let mut out = 0.0;
        for _ in 0..ms_to_samples(200) {
            out = mixer.mix_sample(&[(1, amp)]);
        }
        // crowd gain for n=1 is 1.0; with makeup +3 dB the steady output
        // sits near -17 dB, far above what n=8 crowd scaling would give.
        assert!(lin_to_db(out) > -19.0, "out {} dB", lin_to_db(out));
    }

    #[test]
    fn output_is_bounded_for_bounded_input() {
        let mut mixer = Mixer::new(MixerParams::default());
        for slot in 0..16 {
            mixer.add_source(slot);
        }
        // Worst case: all sources slam between full-scale extremes.
        let mut inputs = Vec::new();
        for i in 0..ms_to_samples(300) {
            inputs.clear();
            for slot in 0..16 {
                let s = if (i + slot as usize) % 2 == 0 { 1.0 } else { -1.0 };
                inputs.push((slot, s));
            }
            let out = mixer.mix_sample(&inputs);
            assert!((-1.0..=1.0).contains(&out), "unbounded output {out}");
        }
    }

    // Delaying every input by k samples delays the output by exactly k.
    #[test]
    fn mixer_is_time_invariant() {
        let k = 97;
        let signal: Vec<f32> = (0..4800)
            .map(|i| ((i as f32 * 0.05).sin() * 0.7) + 0.1)
            .collect();

        let mut direct = Mixer::new(MixerParams::default());
        direct.add_source(1);
        let direct_out: Vec<f32> = signal.iter().map(|&s| direct.mix_sample(&[(1, s)])).collect();

        let mut delayed = Mixer::new(MixerParams::default());
        delayed.add_source(1);
        let mut delayed_out = Vec::new();
        for _ in 0..k {
            delayed_out.push(delayed.mix_sample(&[(1, 0.0)]));
        }
        for &s in &signal {
            delayed_out.push(delayed.mix_sample(&[(1, s)]));
        }

        // The silent prefix must itself be silent, and the rest must be
        // the direct output shifted by exactly k samples.
        assert!(delayed_out[..k].iter().all(|&s| s == 0.0));
        assert_eq!(&delayed_out[k..], &direct_out[..]);
    }

    #[test]
    fn unknown_slots_read_as_silence() {
        let mut mixer = Mixer::new(MixerParams::default());
        mixer.add_source(1);
        // Input names a slot that is not registered; it must be ignored.
        let out = mixer.mix_sample(&[(9, 1.0)]);
        assert_eq!(out, 0.0);
    }

    #[test]
    fn remove_source_stops_contribution() {
        let mut mixer = Mixer::new(MixerParams::default());
        mixer.add_source(1);
        mixer.add_source(2);
        for _ in 0..ms_to_samples(50) {
            mixer.mix_sample(&[(1, 0.5), (2, 0.5)]);
        }
        mixer.remove_source(1);
        assert_eq!(mixer.source_count(), 1);
        assert!(mixer.source_gain(1).is_none());
    }
}
