//! Audio mixer thread.
//!
//! Drains slot-tagged PCM off the mixer lane into per-source buffers,
//! mixes one block per tick, and broadcasts the bus as an AUDIO_BATCH
//! from slot 0 (the server itself).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use mosaic_audio::{Mixer, MixerParams};
use mosaic_core::queue::QueueError;
use mosaic_proto::messages::{AudioBatchHeader, SampleFormat};
use mosaic_proto::{PacketFlags, PacketType};

use crate::broadcast;
use crate::server::ServerContext;

/// Mix cadence. 20 ms blocks at 48 kHz mono.
const TICK: Duration = Duration::from_millis(20);
const SAMPLE_RATE: u32 = 48_000;
const BLOCK: usize = (SAMPLE_RATE as usize / 1000) * 20;

/// How much audio a source may buffer before old samples are cut. Keeps
/// one laggy client from accruing unbounded delay.
const MAX_BUFFER: usize = BLOCK * 8;

pub fn run(ctx: &ServerContext) {
    info!(rate = SAMPLE_RATE, block = BLOCK, "mixer started");
    let mut mixer = Mixer::new(MixerParams { sample_rate: SAMPLE_RATE, ..MixerParams::default() });
    let mut buffers: HashMap<u32, VecDeque<f32>> = HashMap::new();
    let mut block_in: Vec<(u32, Vec<f32>)> = Vec::new();
    let mut bus = vec![0.0f32; BLOCK];
    let mut next_tick = Instant::now() + TICK;

    loop {
        if ctx.shutting_down() {
            break;
        }

        // Ingest until the tick.
        loop {
            let now = Instant::now();
            if now >= next_tick {
                break;
            }
            match ctx.mixer_in.pop(next_tick - now) {
                Ok((slot, samples)) => {
                    let buf = buffers.entry(slot).or_default();
                    buf.extend(samples);
                    while buf.len() > MAX_BUFFER {
                        buf.pop_front();
                    }
                }
                Err(QueueError::PopTimeout(_)) => break,
                Err(QueueError::Closed) => return,
                Err(_) => break,
            }
        }
        next_tick += TICK;

        // Prune departed sources, register new ones.
        let active: Vec<u32> = ctx.registry.active().iter().map(|s| s.slot_id).collect();
        let departed: Vec<u32> =
            buffers.keys().filter(|slot| !active.contains(slot)).copied().collect();
        for slot in departed {
            mixer.remove_source(slot);
            buffers.remove(&slot);
        }
        for &slot in &active {
            mixer.add_source(slot);
        }

        if active.len() < 2 {
            // Nobody to mix for; drop buffered audio so it does not play
            // back stale when a second participant joins.
            for buf in buffers.values_mut() {
                buf.clear();
            }
            continue;
        }

        // One block per source, silence-padded.
        block_in.clear();
        for (&slot, buf) in buffers.iter_mut() {
            let take = buf.len().min(BLOCK);
            let mut samples: Vec<f32> = buf.drain(..take).collect();
            samples.resize(BLOCK, 0.0);
            block_in.push((slot, samples));
        }
        let borrowed: Vec<(u32, &[f32])> =
            block_in.iter().map(|(s, v)| (*s, v.as_slice())).collect();
        mixer.mix_block(&borrowed, &mut bus);

        // Packetize: f32le mono from the server slot.
        let header = AudioBatchHeader {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            sample_fmt: SampleFormat::F32le,
            frame_count: BLOCK as u32,
        };
        let mut payload = Vec::with_capacity(AudioBatchHeader::WIRE_LEN + BLOCK * 4);
        header.encode_into(&mut payload);
        for s in &bus {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        broadcast::media_from_server(ctx, PacketType::AudioBatch, PacketFlags::empty(), payload);
    }
    debug!("mixer stopped");
}
