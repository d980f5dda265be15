//! Server context and accept loop.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use mosaic_core::config::Config;
use mosaic_core::errors::CoreError;
use mosaic_core::handshake::ServerAuth;
use mosaic_core::queue::{Lane, OverflowPolicy};
use mosaic_core::registry::{QueueSettings, Registry};
use mosaic_crypto::identity::Identity;
use mosaic_crypto::password::DEFAULT_ROUNDS;
use mosaic_render::RgbImage;

use crate::{compose, connection, housekeeping, mixer_loop};

/// A participant's most recent decoded frame, for grid composition.
pub struct CachedFrame {
    pub image: RgbImage,
    pub received_at: Instant,
}

/// Shared state threaded through every server thread.
pub struct ServerContext {
    pub config: Config,
    pub identity: Identity,
    pub registry: Registry,
    pub auth: Option<Arc<ServerAuth>>,
    /// Decoded mono audio from clients, slot-tagged, feeding the mixer.
    pub mixer_in: Lane<(u32, Vec<f32>)>,
    /// Latest decoded frame per slot, feeding the compose thread.
    pub frame_cache: Mutex<HashMap<u32, CachedFrame>>,
    pub shutdown: AtomicBool,
}

impl ServerContext {
    pub fn new(config: Config, identity: Identity) -> Result<Self, CoreError> {
        let auth = if config.require_password {
            let password = config
                .resolve_password()?
                .expect("validate_server requires a source when require_password is set");
            info!("deriving password verifier ({} rounds)", DEFAULT_ROUNDS);
            Some(Arc::new(ServerAuth::from_password(&password, DEFAULT_ROUNDS)?))
        } else {
            None
        };
        let queues = QueueSettings {
            send_depth: config.send_queue_depth,
            control_timeout: config.queue_timeout(),
        };
        Ok(ServerContext {
            registry: Registry::new(config.max_clients, queues),
            mixer_in: Lane::new(config.audio_lane_depth * 16, OverflowPolicy::DropNewest),
            frame_cache: Mutex::new(HashMap::new()),
            auth,
            identity,
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Whether the server currently composes the grid for its clients.
    pub fn composing(&self) -> bool {
        self.config.compose_for(self.registry.active().len())
    }
}

/// A bound, not-yet-running server.
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the listen socket. Failure here is process-fatal.
    pub fn bind(config: Config, identity: Identity) -> Result<Self, CoreError> {
        config.validate_server()?;
        let addr = config.listen_addr.clone().expect("validated");
        let listener = TcpListener::bind(&addr)?;
        let local_addr = listener.local_addr()?;
        let ctx = Arc::new(ServerContext::new(config, identity)?);
        info!(%local_addr, host = %ctx.identity.host_id(), "mosaic server listening");
        Ok(Server { ctx, listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Run the accept loop. Blocks until shutdown is signalled; worker
    /// threads exit as their queues close and their sockets drop.
    pub fn run(self) -> Result<(), CoreError> {
        let ctx = Arc::clone(&self.ctx);

        {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("housekeeping".into())
                .spawn(move || housekeeping::run(&ctx))?;
        }
        if ctx.config.enable_audio {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("mixer".into())
                .spawn(move || mixer_loop::run(&ctx))?;
        }
        if ctx.config.enable_video {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("compose".into())
                .spawn(move || compose::run(&ctx))?;
        }

        // A short accept timeout keeps the loop responsive to shutdown.
        self.listener.set_nonblocking(false)?;
        for conn in self.listener.incoming() {
            if ctx.shutting_down() {
                break;
            }
            match conn {
                Ok(stream) => {
                    let peer = match stream.peer_addr() {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "peer vanished before accept completed");
                            continue;
                        }
                    };
                    info!(%peer, "connection accepted");
                    let ctx = Arc::clone(&ctx);
                    let name = format!("conn-{peer}");
                    thread::Builder::new().name(name).spawn(move || {
                        connection::serve(ctx, stream, peer);
                    })?;
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        info!("accept loop stopped");
        Ok(())
    }
}
