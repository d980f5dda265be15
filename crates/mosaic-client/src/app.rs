//! Client orchestration: threads, caches, and the render tick.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mosaic_core::channel::PacketWriter;
use mosaic_core::compress;
use mosaic_core::config::{ColorModeOption, Config};
use mosaic_core::errors::{CoreError, Severity};
use mosaic_core::queue::{Lane, OverflowPolicy, QueueError};
use mosaic_core::registry::Outbound;
use mosaic_crypto::identity::Identity;
use mosaic_proto::messages::{
    AudioBatchHeader, ClientJoin, ClientLeave, ErrorMsg, Heartbeat, PixelFormat, SampleFormat,
    VideoFrameHeader,
};
use mosaic_proto::{PacketFlags, PacketType};
use mosaic_render::ansi::HOME_AND_CLEAR;
use mosaic_render::grid::compose_grid;
use mosaic_render::render::DEFAULT_RAMP;
use mosaic_render::{Mode, RenderOptions, Renderer, RgbImage};

use crate::capture::{self, AudioCapture, CaptureDevice, TestPatternCamera, ToneMic};
use crate::session;

/// Sink for decoded peer audio. Actual playback devices are external
/// collaborators; the default sink discards.
pub trait PlaybackSink: Send {
    fn play(&mut self, slot: u32, samples: &[f32]);
}

pub struct NullSink;

impl PlaybackSink for NullSink {
    fn play(&mut self, _slot: u32, _samples: &[f32]) {}
}

struct Shared {
    /// Latest decoded frame per origin slot (slot 0 = server-composed).
    frames: Mutex<HashMap<u32, (RgbImage, Instant)>>,
    roster: Mutex<HashMap<u32, String>>,
    send_lane: Lane<Outbound>,
    shutdown: AtomicBool,
    server_composed: AtomicBool,
    /// First process-fatal failure from a worker thread (capture death,
    /// for the exit-code-5 contract).
    fatal: Mutex<Option<CoreError>>,
}

impl Shared {
    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.send_lane.close();
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

pub fn mode_for(option: ColorModeOption) -> Mode {
    match option {
        ColorModeOption::Mono => Mode::Mono,
        ColorModeOption::Fg256 => Mode::Fg256,
        ColorModeOption::Bg256 => Mode::Bg256,
        ColorModeOption::Fg24 => Mode::FgTrue,
        ColorModeOption::Bg24 => Mode::BgTrue,
    }
}

/// Terminal cell grid, from the environment the launcher gives us
/// (terminal I/O proper is a collaborator, not ours).
pub fn terminal_dims() -> (usize, usize) {
    let cols = std::env::var("COLUMNS").ok().and_then(|v| v.parse().ok()).unwrap_or(80);
    let lines = std::env::var("LINES").ok().and_then(|v| v.parse().ok()).unwrap_or(24);
    (cols, lines)
}

pub fn run(config: Config, identity: Identity) -> Result<(), CoreError> {
    config.validate_client()?;
    let connection = session::connect(&config, &identity)?;
    let slot_id = connection.slot_id;
    let caps = connection.caps;
    info!(slot = slot_id, "connected");

    let shared = Arc::new(Shared {
        frames: Mutex::new(HashMap::new()),
        roster: Mutex::new(HashMap::new()),
        send_lane: Lane::new(config.send_queue_depth, OverflowPolicy::DropOldest),
        shutdown: AtomicBool::new(false),
        server_composed: AtomicBool::new(false),
        fatal: Mutex::new(None),
    });

    let session::Connection { mut reader, writer, .. } = connection;

    // Writer thread: drains the send lane, seals, writes.
    let writer_handle = {
        let shared = Arc::clone(&shared);
        let deadline = config.frame_deadline();
        thread::Builder::new().name("send".into()).spawn(move || {
            write_loop(&shared, writer, deadline);
        })?
    };

    // Reader thread: classify and fill the caches.
    {
        let shared = Arc::clone(&shared);
        let max_frame = config.max_frame_bytes as usize;
        thread::Builder::new().name("recv".into()).spawn(move || {
            let mut sink = NullSink;
            loop {
                if shared.shutting_down() {
                    break;
                }
                match reader.recv() {
                    Ok(pkt) => {
                        if let Err(e) = classify(&shared, max_frame, &mut sink, pkt) {
                            match e.severity() {
                                Severity::Packet => {
                                    warn!(code = e.stable_code(), "packet dropped: {e}")
                                }
                                _ => {
                                    warn!(code = e.stable_code(), "connection failed: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(CoreError::Io(e))
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        continue
                    }
                    Err(e) => match e.severity() {
                        Severity::Packet => warn!(code = e.stable_code(), "packet dropped: {e}"),
                        _ => {
                            if !shared.shutting_down() {
                                warn!(code = e.stable_code(), "connection lost: {e}");
                            }
                            break;
                        }
                    },
                }
            }
            shared.request_shutdown();
        })?;
    }

    // Capture threads.
    if config.enable_video {
        let shared = Arc::clone(&shared);
        let fps = config.capture_fps;
        let (w, h) = (
            320usize.min(caps.max_width as usize),
            240usize.min(caps.max_height as usize),
        );
        let seed = (slot_id % 251) as u8;
        thread::Builder::new().name("camera".into()).spawn(move || {
            let camera = TestPatternCamera::new(w.max(2), h.max(2), fps, seed);
            if let Err(e) = video_capture_loop(&shared, camera) {
                warn!(code = e.stable_code(), "video capture stopped: {e}");
                *shared.fatal.lock() = Some(e);
                shared.request_shutdown();
            }
        })?;
    }
    if config.enable_audio && caps.audio {
        let shared = Arc::clone(&shared);
        thread::Builder::new().name("mic".into()).spawn(move || {
            let mic = ToneMic::new(48_000, 220.0 + (slot_id as f32) * 40.0, 0.15);
            if let Err(e) = audio_capture_loop(&shared, mic) {
                warn!(code = e.stable_code(), "audio capture stopped: {e}");
            }
        })?;
    }

    // Render loop on this thread.
    let result = render_loop(&config, &shared, slot_id);

    shared.request_shutdown();
    let _ = writer_handle.join();
    if let Some(fatal) = shared.fatal.lock().take() {
        return Err(fatal);
    }
    result
}

fn classify(
    shared: &Shared,
    max_frame: usize,
    sink: &mut dyn PlaybackSink,
    pkt: mosaic_proto::Packet,
) -> Result<(), CoreError> {
    let typ = match pkt.header.typ() {
        Some(t) => t,
        None if pkt.header.flags.non_fatal() => {
            debug!(raw = pkt.header.packet_type, "skipping unknown packet type");
            return Ok(());
        }
        None => {
            return Err(CoreError::Message(mosaic_proto::MessageError::BadField("packet type")))
        }
    };
    match typ {
        PacketType::VideoFrame => {
            let origin = pkt.header.client_id;
            let raw;
            let body: &[u8] = if pkt.header.flags.compressed() {
                raw = compress::decompress(&pkt.payload, max_frame)?;
                &raw
            } else {
                &pkt.payload
            };
            let (header, offset) = VideoFrameHeader::decode(body)?;
            let pixels = &body[offset..];
            let image = match header.pixel_format {
                PixelFormat::Rgb24 => {
                    RgbImage::from_rgb24(header.width as usize, header.height as usize, pixels.to_vec())
                }
                PixelFormat::Yuv420p => {
                    RgbImage::from_yuv420p(header.width as usize, header.height as usize, pixels)
                }
            }
            .map_err(|_| CoreError::Message(mosaic_proto::MessageError::BadField("frame geometry")))?;
            if origin == 0 {
                shared.server_composed.store(true, Ordering::Relaxed);
            }
            shared.frames.lock().insert(origin, (image, Instant::now()));
            Ok(())
        }
        PacketType::AudioBatch => {
            let raw;
            let body: &[u8] = if pkt.header.flags.compressed() {
                raw = compress::decompress(&pkt.payload, max_frame)?;
                &raw
            } else {
                &pkt.payload
            };
            let (header, offset) = AudioBatchHeader::decode(body)?;
            let pcm = &body[offset..];
            if header.sample_fmt == SampleFormat::F32le && pcm.len() % 4 == 0 {
                let samples: Vec<f32> = pcm
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                sink.play(pkt.header.client_id, &samples);
            }
            Ok(())
        }
        PacketType::Ping => {
            let hb = Heartbeat::decode(&pkt.payload)?;
            shared
                .send_lane
                .push_blocking(
                    Outbound::new(PacketType::Pong, PacketFlags::empty(), 0, Arc::new(hb.encode())),
                    Duration::from_millis(50),
                )
                .map_err(CoreError::from)
        }
        PacketType::Pong => Ok(()),
        PacketType::ClientJoin => {
            let join = ClientJoin::decode(&pkt.payload)?;
            info!(slot = join.slot_id, name = %join.display_name, "participant joined");
            shared.roster.lock().insert(join.slot_id, join.display_name);
            Ok(())
        }
        PacketType::ClientLeave => {
            let leave = ClientLeave::decode(&pkt.payload)?;
            info!(slot = leave.slot_id, "participant left");
            shared.roster.lock().remove(&leave.slot_id);
            // Never paint a frame from a departed slot again.
            shared.frames.lock().remove(&leave.slot_id);
            Ok(())
        }
        PacketType::GridLayout => {
            shared.server_composed.store(true, Ordering::Relaxed);
            Ok(())
        }
        PacketType::Error => {
            if let Ok(msg) = ErrorMsg::decode(&pkt.payload) {
                warn!(code = %msg.code, "server error: {}", msg.detail);
            }
            Ok(())
        }
        PacketType::Close => {
            info!("server closed the session");
            shared.request_shutdown();
            Ok(())
        }
        _ => {
            if pkt.header.flags.non_fatal() {
                Ok(())
            } else {
                Err(CoreError::Message(mosaic_proto::MessageError::BadField("unexpected type")))
            }
        }
    }
}

fn write_loop(shared: &Shared, mut writer: PacketWriter<std::net::TcpStream>, deadline: Duration) {
    loop {
        match shared.send_lane.pop(Duration::from_millis(100)) {
            Ok(out) => {
                if out.is_media() && out.queued_at.elapsed() > deadline {
                    continue;
                }
                if let Err(e) = writer.send(out.packet_type, out.flags, &out.payload) {
                    debug!(code = e.stable_code(), "write failed: {e}");
                    shared.request_shutdown();
                    break;
                }
            }
            Err(QueueError::PopTimeout(_)) => {
                if shared.shutting_down() {
                    let _ = writer.send(PacketType::Close, PacketFlags::empty(), &[]);
                    break;
                }
            }
            Err(_) => {
                let _ = writer.send(PacketType::Close, PacketFlags::empty(), &[]);
                break;
            }
        }
    }
    let _ = writer.flush();
}

fn video_capture_loop(shared: &Shared, mut camera: impl CaptureDevice) -> Result<(), CoreError> {
    capture::with_backoff(|| camera.open())?;
    let start = Instant::now();
    while !shared.shutting_down() {
        let frame = match camera.read_frame() {
            Ok(f) => f,
            Err(e) => {
                camera.close();
                capture::with_backoff(|| camera.open())?;
                warn!(code = e.stable_code(), "camera re-opened after failure");
                continue;
            }
        };
        let header = VideoFrameHeader {
            width: frame.width() as u16,
            height: frame.height() as u16,
            pixel_format: PixelFormat::Rgb24,
            pts_ns: start.elapsed().as_nanos() as u64,
        };
        let mut body = Vec::with_capacity(VideoFrameHeader::WIRE_LEN + frame.data().len());
        header.encode_into(&mut body);
        body.extend_from_slice(frame.data());
        let (payload, flags) = match compress::maybe_compress(&body, compress::DEFAULT_LEVEL) {
            Some(c) => (c, PacketFlags::empty().with(PacketFlags::COMPRESSED)),
            None => (body, PacketFlags::empty()),
        };
        match shared.send_lane.push(Outbound::new(
            PacketType::VideoFrame,
            flags,
            0,
            Arc::new(payload),
        )) {
            Ok(_) => {}
            Err(_) => break, // lane closed: shutting down
        }
    }
    camera.close();
    Ok(())
}

fn audio_capture_loop(shared: &Shared, mut mic: impl AudioCapture) -> Result<(), CoreError> {
    capture::with_backoff(|| mic.open())?;
    while !shared.shutting_down() {
        let samples = match mic.read_batch() {
            Ok(s) => s,
            Err(e) => {
                mic.close();
                capture::with_backoff(|| mic.open())?;
                warn!(code = e.stable_code(), "microphone re-opened after failure");
                continue;
            }
        };
        let header = AudioBatchHeader {
            sample_rate: 48_000,
            channels: 1,
            sample_fmt: SampleFormat::F32le,
            frame_count: samples.len() as u32,
        };
        let mut body = Vec::with_capacity(AudioBatchHeader::WIRE_LEN + samples.len() * 4);
        header.encode_into(&mut body);
        for s in &samples {
            body.extend_from_slice(&s.to_le_bytes());
        }
        if shared
            .send_lane
            .push(Outbound::new(PacketType::AudioBatch, PacketFlags::empty(), 0, Arc::new(body)))
            .is_err()
        {
            break;
        }
    }
    mic.close();
    Ok(())
}

fn render_loop(config: &Config, shared: &Shared, _own_slot: u32) -> Result<(), CoreError> {
    let mode = mode_for(config.color_mode);
    let mut renderer = Renderer::new(mode, DEFAULT_RAMP, config.force_scalar)
        .map_err(|e| CoreError::Config(mosaic_core::config::ConfigError::Invalid(e.to_string())))?;
    info!(path = renderer.path().name(), "renderer ready");

    let (term_w, term_h) = terminal_dims();
    let tick = Duration::from_secs(1) / config.render_fps.max(1);
    let deadline = config.frame_deadline();
    let stdout = std::io::stdout();
    let mut next_tick = Instant::now();
    let snapshot_wait = Instant::now() + Duration::from_secs(5);

    loop {
        if shared.shutting_down() {
            break;
        }
        next_tick += tick;
        if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }

        let composed: Option<RgbImage> = {
            let mut frames = shared.frames.lock();
            frames.retain(|_, (_, at)| at.elapsed() <= deadline * 8);
            if shared.server_composed.load(Ordering::Relaxed) {
                frames.get(&0).map(|(img, _)| img.clone())
            } else {
                let cells: Vec<(u32, &RgbImage)> =
                    frames.iter().map(|(slot, (img, _))| (*slot, img)).collect();
                if cells.is_empty() {
                    None
                } else {
                    compose_grid(&cells, term_w.max(2) * 2, term_h.max(2) * 4).ok()
                }
            }
        };

        let image = match composed {
            Some(img) => img,
            None => {
                if config.snapshot_mode && Instant::now() > snapshot_wait {
                    return Err(CoreError::Capture("no frame arrived for snapshot".into()));
                }
                continue;
            }
        };

        let opts = RenderOptions { width: term_w, height: term_h, stretch: config.stretch };
        let rendered = match renderer.render(&image, opts) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(code = e.stable_code(), "render failed: {e}");
                continue;
            }
        };

        // One batched write per frame: home + clear-to-end + rows.
        let mut out = stdout.lock();
        let _ = out.write_all(HOME_AND_CLEAR);
        let _ = out.write_all(rendered);
        let _ = out.flush();

        if config.snapshot_mode {
            info!("snapshot rendered, exiting");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_modes_map_one_to_one() {
        assert_eq!(mode_for(ColorModeOption::Mono), Mode::Mono);
        assert_eq!(mode_for(ColorModeOption::Fg256), Mode::Fg256);
        assert_eq!(mode_for(ColorModeOption::Bg256), Mode::Bg256);
        assert_eq!(mode_for(ColorModeOption::Fg24), Mode::FgTrue);
        assert_eq!(mode_for(ColorModeOption::Bg24), Mode::BgTrue);
    }

    #[test]
    fn terminal_dims_default_sanely() {
        let (w, h) = terminal_dims();
        assert!(w > 0 && h > 0);
    }
}
