//! End-to-end behavior over loopback: three clients, one server,
//! pass-through broadcast.

use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use mosaic_core::channel::{PacketReader, PacketWriter};
use mosaic_core::config::Config;
use mosaic_core::handshake::ClientHandshake;
use mosaic_core::errors::CoreError;
use mosaic_crypto::identity::{EphemeralKey, Identity};
use mosaic_crypto::known_hosts::{KnownHosts, TofuPolicy};
use mosaic_crypto::session::{Direction, OpenKey, SealKey};
use mosaic_proto::messages::{
    Capabilities, ColorMode, PixelFormat, ServerHello, SessionEstablished, VideoFrameHeader,
};
use mosaic_proto::{Packet, PacketFlags, PacketType};
use mosaic_server::Server;

fn caps() -> Capabilities {
    Capabilities { color_mode: ColorMode::Mono, max_width: 320, max_height: 240, audio: false }
}

fn test_config() -> Config {
    Config {
        listen_addr: Some("127.0.0.1:0".into()),
        // Pass-through broadcast regardless of client count, no media
        // threads stealing time from the test.
        compose_on_server: Some(false),
        enable_audio: false,
        ..Config::default()
    }
}

struct TestClient {
    reader: PacketReader<TcpStream>,
    writer: PacketWriter<TcpStream>,
    slot_id: u32,
    _hosts_dir: tempfile::TempDir,
}

impl TestClient {
    fn connect(addr: std::net::SocketAddr, name: &str) -> TestClient {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut reader = PacketReader::new(stream.try_clone().unwrap(), 4 * 1024 * 1024);
        let mut writer = PacketWriter::new(stream);

        let identity = Identity::generate();
        let (mut hs, hello) = ClientHandshake::start(
            &identity,
            EphemeralKey::generate(),
            caps(),
            name.to_owned(),
            None,
        );
        writer
            .send(PacketType::Hello, PacketFlags::empty(), &hello.encode().unwrap())
            .unwrap();

        let pkt = reader.recv().unwrap();
        assert_eq!(pkt.header.typ(), Some(PacketType::ServerHello));
        let sh = ServerHello::decode(&pkt.payload).unwrap();

        let hosts_dir = tempfile::tempdir().unwrap();
        let mut hosts = KnownHosts::load(hosts_dir.path().join("known_hosts")).unwrap();
        hs.on_server_hello(&sh, &mut hosts, TofuPolicy::AutoAdd).unwrap();

        let keys = hs.take_keys().unwrap();
        writer.enable_sealing(SealKey::new(&keys.c2s, Direction::ClientToServer));
        reader.enable_opening(OpenKey::new(&keys.s2c, Direction::ServerToClient));

        let pkt = reader.recv().unwrap();
        assert_eq!(pkt.header.typ(), Some(PacketType::SessionEstablished));
        let se = SessionEstablished::decode(&pkt.payload).unwrap();
        hs.on_established(&se).unwrap();
        assert!(hs.is_established());

        writer.set_client_id(se.slot_id);
        TestClient { reader, writer, slot_id: se.slot_id, _hosts_dir: hosts_dir }
    }

    /// Receive until a packet of `want` arrives or the deadline passes,
    /// skipping control traffic (joins, pings, layout).
    fn recv_type(&mut self, want: PacketType, deadline: Duration) -> Option<Packet> {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            match self.reader.recv() {
                Ok(pkt) if pkt.header.typ() == Some(want) => return Some(pkt),
                Ok(_) => continue,
                Err(CoreError::Io(_)) => continue,
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        None
    }

    fn send_marker_frame(&mut self, marker: u8) {
        let header = VideoFrameHeader {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
            pts_ns: 1,
        };
        let mut body = Vec::new();
        header.encode_into(&mut body);
        body.extend_from_slice(&[marker; 12]);
        self.writer
            .send(PacketType::VideoFrame, PacketFlags::empty(), &body)
            .unwrap();
    }
}

#[test]
fn three_client_broadcast_reaches_everyone_but_the_sender() {
    let server = Server::bind(test_config(), Identity::generate()).unwrap();
    let addr = server.local_addr();
    let ctx = server.context();
    thread::spawn(move || server.run());

    let mut a = TestClient::connect(addr, "alice");
    let mut b = TestClient::connect(addr, "bob");
    let mut c = TestClient::connect(addr, "carol");
    assert_ne!(a.slot_id, b.slot_id);
    assert_ne!(b.slot_id, c.slot_id);

    // Let the server finish activating everyone before the frame flies.
    thread::sleep(Duration::from_millis(100));

    a.send_marker_frame(0xAB);

    for client in [&mut b, &mut c] {
        let pkt = client
            .recv_type(PacketType::VideoFrame, Duration::from_secs(3))
            .expect("frame should be forwarded");
        assert_eq!(pkt.header.client_id, a.slot_id, "origin slot must be preserved");
        assert!(pkt.payload.ends_with(&[0xAB; 12]), "marker must survive");
    }

    // The sender gets joins and heartbeats, but not its own frame back.
    // Use a short timeout so the read-timeout path exercises too.
    assert!(
        a.recv_type(PacketType::VideoFrame, Duration::from_millis(400)).is_none(),
        "sender must not hear its own frame"
    );

    ctx.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
}

#[test]
fn departing_client_is_announced_to_the_room() {
    let server = Server::bind(test_config(), Identity::generate()).unwrap();
    let addr = server.local_addr();
    let ctx = server.context();
    thread::spawn(move || server.run());

    let mut a = TestClient::connect(addr, "alice");
    let b = TestClient::connect(addr, "bob");
    let b_slot = b.slot_id;

    thread::sleep(Duration::from_millis(100));

    // Bob leaves abruptly (socket drop).
    drop(b);

    let leave = a
        .recv_type(PacketType::ClientLeave, Duration::from_secs(5))
        .expect("leave should be announced");
    let msg = mosaic_proto::messages::ClientLeave::decode(&leave.payload).unwrap();
    assert_eq!(msg.slot_id, b_slot);

    ctx.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
}

#[test]
fn server_is_full_at_max_clients() {
    let config = Config { max_clients: 2, ..test_config() };
    let server = Server::bind(config, Identity::generate()).unwrap();
    let addr = server.local_addr();
    let ctx = server.context();
    thread::spawn(move || server.run());

    let _a = TestClient::connect(addr, "alice");
    let _b = TestClient::connect(addr, "bob");
    thread::sleep(Duration::from_millis(50));

    // The third handshake gets through SERVER_HELLO but no session: the
    // server closes the connection instead of assigning a slot.
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let mut reader = PacketReader::new(stream.try_clone().unwrap(), 4 * 1024 * 1024);
    let mut writer = PacketWriter::new(stream);
    let identity = Identity::generate();
    let (mut hs, hello) = ClientHandshake::start(
        &identity,
        EphemeralKey::generate(),
        caps(),
        "late".into(),
        None,
    );
    writer.send(PacketType::Hello, PacketFlags::empty(), &hello.encode().unwrap()).unwrap();
    let pkt = reader.recv().unwrap();
    let sh = ServerHello::decode(&pkt.payload).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut hosts = KnownHosts::load(dir.path().join("kh")).unwrap();
    hs.on_server_hello(&sh, &mut hosts, TofuPolicy::AutoAdd).unwrap();
    let keys = hs.take_keys().unwrap();
    reader.enable_opening(OpenKey::new(&keys.s2c, Direction::ServerToClient));

    // Either an orderly error/EOF or a reset; never SESSION_ESTABLISHED.
    match reader.recv() {
        Ok(pkt) => assert_ne!(pkt.header.typ(), Some(PacketType::SessionEstablished)),
        Err(_) => {}
    }

    ctx.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
}
