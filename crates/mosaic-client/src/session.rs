//! Client connection establishment.

use std::net::TcpStream;

use tracing::info;

use mosaic_core::channel::{PacketReader, PacketWriter};
use mosaic_core::config::Config;
use mosaic_core::errors::CoreError;
use mosaic_core::handshake::{ClientHandshake, HandshakeError};
use mosaic_crypto::identity::{EphemeralKey, Identity};
use mosaic_crypto::known_hosts::{KnownHosts, TofuPolicy};
use mosaic_crypto::session::{Direction, OpenKey, SealKey};
use mosaic_proto::messages::{
    AuthChallenge, Capabilities, ServerHello, SessionEstablished,
};
use mosaic_proto::{Packet, PacketFlags, PacketType};

/// An established, sealed connection.
pub struct Connection {
    pub reader: PacketReader<TcpStream>,
    pub writer: PacketWriter<TcpStream>,
    pub slot_id: u32,
    pub caps: Capabilities,
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

fn recv_step(
    reader: &mut PacketReader<TcpStream>,
    hs: &ClientHandshake,
) -> Result<Packet, CoreError> {
    match reader.recv() {
        Ok(p) => Ok(p),
        Err(CoreError::Io(e)) if is_timeout(&e) => {
            Err(HandshakeError::Timeout(hs.state_name()).into())
        }
        Err(e) => Err(e),
    }
}

/// Dial the server and run the handshake to completion.
pub fn connect(config: &Config, identity: &Identity) -> Result<Connection, CoreError> {
    let addr = config.connect_addr.as_deref().expect("validated");
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.handshake_timeout()))?;
    let sock = stream.try_clone()?;

    let mut reader = PacketReader::new(stream.try_clone()?, config.max_frame_bytes);
    let mut writer = PacketWriter::new(stream);

    let caps = Capabilities {
        color_mode: config.color_mode.to_wire(),
        max_width: 1280,
        max_height: 720,
        audio: config.enable_audio,
    };
    let password = config.resolve_password()?;
    let (mut hs, hello) = ClientHandshake::start(
        identity,
        EphemeralKey::generate(),
        caps,
        config.display_name.clone(),
        password,
    );
    writer.send(PacketType::Hello, PacketFlags::empty(), &hello.encode().map_err(HandshakeError::from)?)?;

    let pkt = recv_step(&mut reader, &hs)?;
    if pkt.header.typ() != Some(PacketType::ServerHello) {
        return Err(HandshakeError::UnexpectedPacket {
            got: pkt.header.packet_type,
            state: hs.state_name(),
        }
        .into());
    }
    let server_hello = ServerHello::decode(&pkt.payload).map_err(HandshakeError::from)?;

    let mut known_hosts = KnownHosts::load(&config.known_hosts_file)?;
    let policy = if config.tofu_auto_add { TofuPolicy::AutoAdd } else { TofuPolicy::Reject };
    hs.on_server_hello(&server_hello, &mut known_hosts, policy)?;

    let keys = hs.take_keys().expect("keys derive with server hello");
    writer.enable_sealing(SealKey::new(&keys.c2s, Direction::ClientToServer));
    reader.enable_opening(OpenKey::new(&keys.s2c, Direction::ServerToClient));

    // Optional password round, then the session grant.
    loop {
        let pkt = recv_step(&mut reader, &hs)?;
        match pkt.header.typ() {
            Some(PacketType::AuthChallenge) => {
                let challenge = AuthChallenge::decode(&pkt.payload).map_err(HandshakeError::from)?;
                let response = hs.on_auth_challenge(&challenge)?;
                writer.send(PacketType::AuthResponse, PacketFlags::empty(), &response.encode())?;
            }
            Some(PacketType::SessionEstablished) => {
                let se = SessionEstablished::decode(&pkt.payload).map_err(HandshakeError::from)?;
                hs.on_established(&se)?;
                writer.set_client_id(se.slot_id);
                // Steady state wants short reads for liveness polling.
                sock.set_read_timeout(Some(std::time::Duration::from_secs(1)))?;
                info!(slot = se.slot_id, "session established");
                return Ok(Connection {
                    reader,
                    writer,
                    slot_id: se.slot_id,
                    caps: se.caps,
                });
            }
            _ => {
                return Err(HandshakeError::UnexpectedPacket {
                    got: pkt.header.packet_type,
                    state: hs.state_name(),
                }
                .into())
            }
        }
    }
}
