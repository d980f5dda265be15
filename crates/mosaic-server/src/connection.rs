//! Per-connection threads: handshake, then a reader and a writer.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use mosaic_core::channel::{PacketReader, PacketWriter};
use mosaic_core::compress;
use mosaic_core::errors::{CoreError, Severity};
use mosaic_core::handshake::{HandshakeError, ServerHandshake};
use mosaic_core::queue::QueueError;
use mosaic_core::registry::{ClientSlot, Outbound, SlotRole, SlotState};
use mosaic_crypto::identity::EphemeralKey;
use mosaic_crypto::session::{Direction, OpenKey, SealKey};
use mosaic_proto::messages::{
    AudioBatchHeader, AuthResponse, Capabilities, ErrorMsg, Heartbeat, Hello, SampleFormat,
    VideoFrameHeader,
};
use mosaic_proto::{Packet, PacketFlags, PacketType};
use mosaic_render::RgbImage;

use crate::broadcast;
use crate::server::{CachedFrame, ServerContext};

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Entry point for a fresh connection: run the handshake, register the
/// slot, then split into reader/writer threads. Errors are logged here
/// rather than propagated; one bad connection never takes the server down.
pub fn serve(ctx: Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    match establish(&ctx, stream, peer) {
        Ok((slot, reader, writer)) => {
            let writer_slot = Arc::clone(&slot);
            let writer_ctx = Arc::clone(&ctx);
            let name = format!("send-{}", slot.slot_id);
            let writer_handle = thread::Builder::new().name(name).spawn(move || {
                write_loop(&writer_ctx, &writer_slot, writer);
            });
            match writer_handle {
                Ok(_) => read_loop(&ctx, &slot, reader),
                Err(e) => {
                    warn!(error = %e, "failed to spawn writer");
                    ctx.registry.close_slot(slot.slot_id);
                    ctx.registry.detach(slot.slot_id, SlotRole::Reader);
                    ctx.registry.detach(slot.slot_id, SlotRole::Writer);
                }
            }
        }
        Err(e) => {
            info!(%peer, code = e.stable_code(), error = %e, "handshake failed");
        }
    }
}

type Established = (Arc<ClientSlot>, PacketReader<TcpStream>, PacketWriter<TcpStream>);

fn establish(
    ctx: &ServerContext,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<Established, CoreError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(ctx.config.handshake_timeout()))?;
    // Same underlying socket as reader and writer; used to retune the
    // read timeout once the handshake is done.
    let sock = stream.try_clone()?;

    let mut reader = PacketReader::new(stream.try_clone()?, ctx.config.max_frame_bytes);
    let mut writer = PacketWriter::new(stream);
    let mut hs = ServerHandshake::new(EphemeralKey::generate(), ctx.auth.clone());

    let hello_pkt = recv_handshake(&mut reader, &hs)?;
    expect_type(&hello_pkt, PacketType::Hello, &hs)?;
    let hello = Hello::decode(&hello_pkt.payload).map_err(HandshakeError::from)?;

    let server_hello = hs.on_hello(&ctx.identity, &hello)?;
    writer.send(PacketType::ServerHello, PacketFlags::empty(), &server_hello.encode())?;

    // Everything after SERVER_HELLO is sealed.
    let keys = hs.take_keys().expect("keys exist after on_hello");
    writer.enable_sealing(SealKey::new(&keys.s2c, Direction::ServerToClient));
    reader.enable_opening(OpenKey::new(&keys.c2s, Direction::ClientToServer));

    if let Some(challenge) = hs.auth_challenge() {
        writer.send(PacketType::AuthChallenge, PacketFlags::empty(), &challenge.encode())?;
        let resp_pkt = recv_handshake(&mut reader, &hs)?;
        expect_type(&resp_pkt, PacketType::AuthResponse, &hs)?;
        let resp = AuthResponse::decode(&resp_pkt.payload).map_err(HandshakeError::from)?;
        hs.on_auth_response(&resp)?;
    }

    let negotiated = clamp_caps(hello.caps, ctx);
    let display_name = hs.client_name().unwrap_or("anonymous").to_owned();
    let slot = ctx.registry.add(display_name, peer, negotiated)?;
    if let Err(e) = finish(&mut hs, &mut writer, &slot, negotiated) {
        // The slot was allocated but never went live; release it fully.
        ctx.registry.close_slot(slot.slot_id);
        ctx.registry.detach(slot.slot_id, SlotRole::Reader);
        ctx.registry.detach(slot.slot_id, SlotRole::Writer);
        return Err(e);
    }
    writer.set_client_id(slot.slot_id);

    // Fast liveness polls from here on; the handshake needed the longer
    // timeout, steady state does not.
    sock.set_read_timeout(Some(std::time::Duration::from_secs(1)))?;

    slot.set_state(SlotState::Active);
    slot.last_rx_ns.store(now_ns(), Ordering::Relaxed);

    // Tell the room about the newcomer, and the newcomer about the room.
    broadcast::announce_join(ctx, &slot);
    broadcast::send_roster(ctx, &slot);

    info!(slot = slot.slot_id, %peer, name = %slot.display_name, "client joined");
    Ok((slot, reader, writer))
}

fn finish(
    hs: &mut ServerHandshake,
    writer: &mut PacketWriter<TcpStream>,
    slot: &ClientSlot,
    negotiated: Capabilities,
) -> Result<(), CoreError> {
    let established = hs.establish(slot.slot_id, negotiated)?;
    writer.send(PacketType::SessionEstablished, PacketFlags::empty(), &established.encode())?;
    Ok(())
}

fn recv_handshake(
    reader: &mut PacketReader<TcpStream>,
    hs: &ServerHandshake,
) -> Result<Packet, CoreError> {
    match reader.recv() {
        Ok(p) => Ok(p),
        Err(CoreError::Io(e)) if is_timeout(&e) => {
            Err(HandshakeError::Timeout(hs.state_name()).into())
        }
        Err(e) => Err(e),
    }
}

fn expect_type(pkt: &Packet, want: PacketType, hs: &ServerHandshake) -> Result<(), CoreError> {
    if pkt.header.typ() == Some(want) {
        Ok(())
    } else {
        Err(HandshakeError::UnexpectedPacket {
            got: pkt.header.packet_type,
            state: hs.state_name(),
        }
        .into())
    }
}

fn clamp_caps(requested: Capabilities, ctx: &ServerContext) -> Capabilities {
    Capabilities {
        color_mode: requested.color_mode,
        max_width: requested.max_width.min(1920),
        max_height: requested.max_height.min(1080),
        audio: requested.audio && ctx.config.enable_audio,
    }
}

// ============================================================================
// Receive path
// ============================================================================

/// Reader thread body: decode, decrypt, classify, dispatch.
pub fn read_loop(ctx: &ServerContext, slot: &Arc<ClientSlot>, mut reader: PacketReader<TcpStream>) {
    // The handshake's read timeout stays installed; from here on it is
    // only the liveness poll interval for this loop.
    loop {
        if ctx.shutting_down() {
            break;
        }
        match slot.state() {
            SlotState::Closed | SlotState::Draining => break,
            _ => {}
        }

        let packet = match reader.recv() {
            Ok(p) => p,
            Err(CoreError::Io(e)) if is_timeout(&e) => continue,
            Err(e) => match e.severity() {
                Severity::Packet => {
                    warn!(slot = slot.slot_id, code = e.stable_code(), "packet dropped: {e}");
                    continue;
                }
                _ => {
                    debug!(slot = slot.slot_id, code = e.stable_code(), "connection lost: {e}");
                    break;
                }
            },
        };

        slot.last_rx_ns.store(now_ns(), Ordering::Relaxed);
        slot.rx_packets.fetch_add(1, Ordering::Relaxed);
        slot.rx_bytes.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        if let Err(e) = classify(ctx, slot, packet) {
            match e.severity() {
                Severity::Packet => {
                    warn!(slot = slot.slot_id, code = e.stable_code(), "packet dropped: {e}");
                }
                _ => {
                    let _ = slot.push_control(Outbound::new(
                        PacketType::Error,
                        PacketFlags::empty().with(PacketFlags::NON_FATAL),
                        0,
                        Arc::new(
                            ErrorMsg { code: e.stable_code().into(), detail: e.to_string() }.encode(),
                        ),
                    ));
                    break;
                }
            }
        }
    }
    ctx.registry.close_slot(slot.slot_id);
    ctx.registry.detach(slot.slot_id, SlotRole::Reader);
    info!(
        slot = slot.slot_id,
        rx_packets = slot.rx_packets.load(Ordering::Relaxed),
        rx_bytes = slot.rx_bytes.load(Ordering::Relaxed),
        tx_packets = slot.tx_packets.load(Ordering::Relaxed),
        tx_bytes = slot.tx_bytes.load(Ordering::Relaxed),
        "connection finished"
    );
}

fn classify(ctx: &ServerContext, slot: &Arc<ClientSlot>, packet: Packet) -> Result<(), CoreError> {
    let typ = match packet.header.typ() {
        Some(t) => t,
        None => {
            // Unknown type: skip when flagged non-fatal, otherwise a
            // protocol violation.
            if packet.header.flags.non_fatal() {
                debug!(slot = slot.slot_id, raw = packet.header.packet_type, "skipping unknown packet type");
                return Ok(());
            }
            return Err(HandshakeError::UnexpectedPacket {
                got: packet.header.packet_type,
                state: "Active",
            }
            .into());
        }
    };

    match typ {
        PacketType::VideoFrame => handle_video(ctx, slot, packet),
        PacketType::AudioBatch => handle_audio(ctx, slot, packet),
        PacketType::Ping => {
            let hb = Heartbeat::decode(&packet.payload)?;
            slot.push_control(Outbound::new(
                PacketType::Pong,
                PacketFlags::empty(),
                0,
                Arc::new(hb.encode()),
            ))
            .map_err(CoreError::from)
        }
        PacketType::Pong => Ok(()), // freshness was recorded on receive
        PacketType::Close => {
            info!(slot = slot.slot_id, "client sent CLOSE");
            slot.set_state(SlotState::Draining);
            Ok(())
        }
        PacketType::Capabilities | PacketType::ClientJoin => Ok(()),
        other => {
            if packet.header.flags.non_fatal() {
                debug!(slot = slot.slot_id, ?other, "ignoring packet type");
                Ok(())
            } else {
                Err(HandshakeError::UnexpectedPacket {
                    got: packet.header.packet_type,
                    state: "Active",
                }
                .into())
            }
        }
    }
}

fn handle_video(ctx: &ServerContext, slot: &Arc<ClientSlot>, packet: Packet) -> Result<(), CoreError> {
    if !ctx.config.enable_video {
        return Ok(());
    }
    if ctx.composing() {
        // Composed mode: decode into the frame cache; the compose thread
        // does the fan-out.
        let raw;
        let body: &[u8] = if packet.header.flags.compressed() {
            raw = compress::decompress(&packet.payload, ctx.config.max_frame_bytes as usize)?;
            &raw
        } else {
            &packet.payload
        };
        let (header, offset) = VideoFrameHeader::decode(body)?;
        let pixels = &body[offset..];
        let image = match header.pixel_format {
            mosaic_proto::messages::PixelFormat::Rgb24 => RgbImage::from_rgb24(
                header.width as usize,
                header.height as usize,
                pixels.to_vec(),
            ),
            mosaic_proto::messages::PixelFormat::Yuv420p => {
                RgbImage::from_yuv420p(header.width as usize, header.height as usize, pixels)
            }
        }
        .map_err(|_| CoreError::Message(mosaic_proto::MessageError::BadField("frame geometry")))?;

        ctx.frame_cache.lock().insert(
            slot.slot_id,
            CachedFrame { image, received_at: std::time::Instant::now() },
        );
        Ok(())
    } else {
        // Pass-through: share the sealed-side payload by refcount.
        broadcast::video(ctx, slot.slot_id, packet.header.flags, packet.payload);
        Ok(())
    }
}

fn handle_audio(ctx: &ServerContext, slot: &Arc<ClientSlot>, packet: Packet) -> Result<(), CoreError> {
    if !ctx.config.enable_audio || !slot.caps.audio {
        return Ok(());
    }
    let raw;
    let body: &[u8] = if packet.header.flags.compressed() {
        raw = compress::decompress(&packet.payload, ctx.config.max_frame_bytes as usize)?;
        &raw
    } else {
        &packet.payload
    };
    let (header, offset) = AudioBatchHeader::decode(body)?;
    let pcm = &body[offset..];
    let samples = decode_samples(&header, pcm)?;
    // Audio lane policy is drop-newest; a full mixer drops this batch.
    let _ = ctx.mixer_in.push((slot.slot_id, samples));
    Ok(())
}

fn decode_samples(header: &AudioBatchHeader, pcm: &[u8]) -> Result<Vec<f32>, CoreError> {
    match header.sample_fmt {
        SampleFormat::F32le => {
            if pcm.len() % 4 != 0 {
                return Err(CoreError::Message(mosaic_proto::MessageError::BadField("pcm length")));
            }
            Ok(pcm
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect())
        }
        SampleFormat::S16le => {
            if pcm.len() % 2 != 0 {
                return Err(CoreError::Message(mosaic_proto::MessageError::BadField("pcm length")));
            }
            Ok(pcm
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
                .collect())
        }
    }
}

// ============================================================================
// Send path
// ============================================================================

/// Writer thread body: drain the slot's queue, seal, write.
pub fn write_loop(ctx: &ServerContext, slot: &Arc<ClientSlot>, mut writer: PacketWriter<TcpStream>) {
    let deadline = ctx.config.frame_deadline();
    let poll = std::time::Duration::from_millis(100);
    loop {
        match slot.send_queue.pop(poll) {
            Ok(out) => {
                if out.is_media() && out.queued_at.elapsed() > deadline {
                    debug!(slot = slot.slot_id, "stale media dropped at send");
                    continue;
                }
                if let Err(e) = writer.send_from(out.origin_slot, out.packet_type, out.flags, &out.payload)
                {
                    debug!(slot = slot.slot_id, code = e.stable_code(), "write failed: {e}");
                    break;
                }
                slot.last_tx_ns.store(now_ns(), Ordering::Relaxed);
                slot.tx_packets.fetch_add(1, Ordering::Relaxed);
                slot.tx_bytes.fetch_add(out.payload.len() as u64, Ordering::Relaxed);
            }
            Err(QueueError::PopTimeout(_)) => {
                if slot.state() == SlotState::Closed || ctx.shutting_down() {
                    break;
                }
                // Draining: the reader stopped, we flush what is queued.
                if slot.state() == SlotState::Draining && slot.send_queue.is_empty() {
                    let _ = writer.send(PacketType::Close, PacketFlags::empty(), &[]);
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = writer.flush();
    ctx.registry.close_slot(slot.slot_id);
    ctx.registry.detach(slot.slot_id, SlotRole::Writer);
    debug!(slot = slot.slot_id, "writer detached");
}
