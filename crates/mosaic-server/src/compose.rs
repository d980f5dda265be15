//! Server-composed grid thread.
//!
//! At a fixed cadence, takes the latest decoded frame of every active
//! participant, composes the deterministic grid (slots sorted by id,
//! smallest grid with enough cells, per-cell letterbox), and broadcasts
//! the result as one VIDEO_FRAME per tick. Runs only while composed mode
//! applies; in pass-through mode the thread idles.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use mosaic_core::compress;
use mosaic_proto::messages::{GridLayout, PixelFormat, VideoFrameHeader};
use mosaic_proto::{PacketFlags, PacketType};
use mosaic_render::grid::{compose_grid, grid_dims};
use mosaic_render::RgbImage;

use crate::broadcast;
use crate::server::ServerContext;

/// Composed output frame geometry. Client renderers downscale to their
/// own terminals, so this only needs to be big enough to survive that.
const OUT_WIDTH: usize = 960;
const OUT_HEIGHT: usize = 540;

pub fn run(ctx: &ServerContext) {
    let tick = Duration::from_secs(1) / ctx.config.render_fps.max(1);
    info!(fps = ctx.config.render_fps, "compose thread started");
    let mut last_layout: Option<(usize, usize)> = None;
    let mut next_tick = Instant::now();

    loop {
        if ctx.shutting_down() {
            break;
        }
        next_tick += tick;
        if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }

        if !ctx.composing() {
            last_layout = None;
            continue;
        }

        // Snapshot fresh frames, dropping ones past the deadline.
        let deadline = ctx.config.frame_deadline();
        let frames: Vec<(u32, RgbImage)> = {
            let mut cache = ctx.frame_cache.lock();
            cache.retain(|_, f| f.received_at.elapsed() <= deadline * 8);
            cache
                .iter()
                .filter(|(_, f)| f.received_at.elapsed() <= deadline)
                .map(|(slot, f)| (*slot, f.image.clone()))
                .collect()
        };
        if frames.is_empty() {
            continue;
        }

        let cells: Vec<(u32, &RgbImage)> = frames.iter().map(|(s, i)| (*s, i)).collect();
        let composed = match compose_grid(&cells, OUT_WIDTH, OUT_HEIGHT) {
            Ok(img) => img,
            Err(e) => {
                warn!(error = %e, "grid composition failed");
                continue;
            }
        };

        // Announce layout changes so clients can adjust.
        let layout = grid_dims(cells.len());
        if last_layout != Some(layout) {
            last_layout = Some(layout);
            let (rows, cols) = layout;
            let msg = GridLayout {
                rows: rows as u8,
                cols: cols as u8,
                cell_width: (OUT_WIDTH / cols) as u16,
                cell_height: (OUT_HEIGHT / rows) as u16,
            };
            debug!(rows, cols, "grid layout changed");
            broadcast::control(ctx, None, PacketType::GridLayout, msg.encode());
        }

        let header = VideoFrameHeader {
            width: composed.width() as u16,
            height: composed.height() as u16,
            pixel_format: PixelFormat::Rgb24,
            pts_ns: now_ns(),
        };
        let mut body = Vec::with_capacity(VideoFrameHeader::WIRE_LEN + composed.data().len());
        header.encode_into(&mut body);
        body.extend_from_slice(composed.data());

        let (payload, flags) = match compress::maybe_compress(&body, compress::DEFAULT_LEVEL) {
            Some(compressed) => (compressed, PacketFlags::empty().with(PacketFlags::COMPRESSED)),
            None => (body, PacketFlags::empty()),
        };
        broadcast::media_from_server(ctx, PacketType::VideoFrame, flags, payload);
    }
    debug!("compose thread stopped");
}

fn now_ns() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}
