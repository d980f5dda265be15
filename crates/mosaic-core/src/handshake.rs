//! Handshake state machines.
//!
//! Pure state machines over decoded messages: the connection threads do
//! the socket work and feed packets in, so both sides are testable
//! in-process without I/O. Transcript handling is symmetric — every field
//! either peer contributes is appended in a fixed order, the server signs
//! the transcript hash, and the same hash salts session key derivation.
//!
//! ```text
//! client                                server
//!   | HELLO {id_pk, eph_pk, nonce, caps} |
//!   |----------------------------------->|
//!   | SERVER_HELLO {id_pk, eph_pk,       |
//!   |   nonce, pw?, sig(transcript)}     |
//!   |<-----------------------------------|
//!   |        (both derive k_c2s, k_s2c)  |
//!   | AUTH_CHALLENGE {salt, rounds}      |  only when a password
//!   |<-----------------------------------|  is required; sealed
//!   | AUTH_RESPONSE {mac(transcript)}    |
//!   |----------------------------------->|
//!   | SESSION_ESTABLISHED {slot, caps}   |
//!   |<-----------------------------------|
//! ```

use thiserror::Error;
use tracing::debug;

use mosaic_crypto::hash;
use mosaic_crypto::identity::{verify_signature, EphemeralKey, Identity};
use mosaic_crypto::known_hosts::{KnownHosts, KnownHostsError, TofuPolicy};
use mosaic_crypto::password::{self, PasswordError};
use mosaic_crypto::session::{derive_session, SessionKeys};
use mosaic_crypto::transcript::{tags, Transcript};
use mosaic_proto::messages::{
    AuthChallenge, AuthResponse, Capabilities, Hello, ServerHello, SessionEstablished,
};
use mosaic_proto::MessageError;

/// Domain separator for the handshake transcript.
pub const TRANSCRIPT_DOMAIN: &str = "mosaic handshake v1";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out waiting in {0}")]
    Timeout(&'static str),

    #[error("unexpected packet type {got} in {state}")]
    UnexpectedPacket { got: u16, state: &'static str },

    #[error("server signature did not verify")]
    BadServerSignature,

    #[error(transparent)]
    KnownHosts(#[from] KnownHostsError),

    #[error("malformed handshake message: {0}")]
    Message(#[from] MessageError),

    #[error("server requires a password but none is configured")]
    PasswordMissing,

    #[error(transparent)]
    Password(#[from] PasswordError),

    #[error("protocol violation: {0}")]
    Violation(&'static str),
}

impl HandshakeError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            HandshakeError::Timeout(_) => "E_CRYPTO_HANDSHAKE_TIMEOUT",
            HandshakeError::UnexpectedPacket { .. } => "E_PROTO_UNEXPECTED_PACKET",
            HandshakeError::BadServerSignature => "E_CRYPTO_BAD_SIGNATURE",
            HandshakeError::KnownHosts(e) => e.stable_code(),
            HandshakeError::Message(_) => "E_PROTO_BAD_MESSAGE",
            HandshakeError::PasswordMissing => "E_CONFIG_PASSWORD_MISSING",
            HandshakeError::Password(e) => e.stable_code(),
            HandshakeError::Violation(_) => "E_PROTO_VIOLATION",
        }
    }
}

fn append_client_fields(t: &mut Transcript, hello: &Hello) {
    let mut caps = Vec::with_capacity(Capabilities::WIRE_LEN + hello.display_name.len());
    hello.caps.encode_into(&mut caps);
    caps.extend_from_slice(hello.display_name.as_bytes());
    t.append_bytes(tags::CLIENT_IDENTITY, &hello.identity_pk);
    t.append_bytes(tags::CLIENT_EPHEMERAL, &hello.ephemeral_pk);
    t.append_bytes(tags::CLIENT_NONCE, &hello.nonce);
    t.append_bytes(tags::CLIENT_CAPS, &caps);
}

fn append_server_fields(t: &mut Transcript, identity_pk: &[u8; 32], eph_pk: &[u8; 32], nonce: &[u8; 32]) {
    t.append_bytes(tags::SERVER_IDENTITY, identity_pk);
    t.append_bytes(tags::SERVER_EPHEMERAL, eph_pk);
    t.append_bytes(tags::SERVER_NONCE, nonce);
}

fn append_auth_fields(t: &mut Transcript, salt: &[u8; 16], rounds: u32) {
    t.append_bytes(tags::AUTH_SALT, salt);
    t.append_u64(tags::AUTH_ROUNDS, rounds as u64);
}

fn random32() -> [u8; 32] {
    let mut out = [0u8; 32];
    getrandom::getrandom(&mut out).expect("os entropy");
    out
}

// ============================================================================
// Client side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    HelloSent,
    KeysReady,
    AuthSent,
    Established,
}

/// Result of feeding SERVER_HELLO to the client machine.
pub struct ClientHandshake {
    state: ClientState,
    transcript: Transcript,
    eph: Option<EphemeralKey>,
    password: Option<String>,
    server_wants_password: bool,
    keys: Option<SessionKeys>,
    server_pk: Option<[u8; 32]>,
    slot_id: Option<u32>,
    negotiated: Option<Capabilities>,
}

impl ClientHandshake {
    /// Start a handshake; returns the machine and the HELLO to send.
    pub fn start(
        identity: &Identity,
        eph: EphemeralKey,
        caps: Capabilities,
        display_name: String,
        password: Option<String>,
    ) -> (Self, Hello) {
        let hello = Hello {
            identity_pk: identity.public_key(),
            ephemeral_pk: eph.public_key(),
            nonce: random32(),
            caps,
            display_name,
        };
        let mut transcript = Transcript::new(TRANSCRIPT_DOMAIN);
        append_client_fields(&mut transcript, &hello);
        (
            ClientHandshake {
                state: ClientState::HelloSent,
                transcript,
                eph: Some(eph),
                password,
                server_wants_password: false,
                keys: None,
                server_pk: None,
                slot_id: None,
                negotiated: None,
            },
            hello,
        )
    }

    /// Verify the server and derive session keys.
    pub fn on_server_hello(
        &mut self,
        sh: &ServerHello,
        known_hosts: &mut KnownHosts,
        policy: TofuPolicy,
    ) -> Result<(), HandshakeError> {
        if self.state != ClientState::HelloSent {
            return Err(HandshakeError::Violation("SERVER_HELLO out of order"));
        }

        // Pin check before any use of the key.
        let host_id = hash::host_id(&sh.identity_pk);
        known_hosts.verify_or_pin(&host_id, &sh.identity_pk, policy)?;

        append_server_fields(&mut self.transcript, &sh.identity_pk, &sh.ephemeral_pk, &sh.nonce);
        let transcript_hash = self.transcript.hash();
        verify_signature(&sh.identity_pk, &transcript_hash, &sh.sig)
            .map_err(|_| HandshakeError::BadServerSignature)?;

        let eph = self
            .eph
            .take()
            .ok_or(HandshakeError::Violation("ephemeral already consumed"))?;
        let shared = eph.diffie_hellman(&sh.ephemeral_pk);
        self.keys = Some(derive_session(&shared, &transcript_hash));
        self.server_pk = Some(sh.identity_pk);
        self.server_wants_password = sh.password_required;
        self.state = ClientState::KeysReady;
        debug!(host = %host_id, "server verified, session keys derived");
        Ok(())
    }

    /// Answer the password challenge.
    pub fn on_auth_challenge(&mut self, ch: &AuthChallenge) -> Result<AuthResponse, HandshakeError> {
        if self.state != ClientState::KeysReady || !self.server_wants_password {
            return Err(HandshakeError::Violation("AUTH_CHALLENGE out of order"));
        }
        let pw = self.password.as_deref().ok_or(HandshakeError::PasswordMissing)?;
        append_auth_fields(&mut self.transcript, &ch.salt, ch.rounds);
        let key = password::derive_key(pw, &ch.salt, ch.rounds)?;
        let mac = password::prove(&key, &self.transcript.hash());
        self.state = ClientState::AuthSent;
        Ok(AuthResponse { mac })
    }

    /// Final server message: our slot and the negotiated capabilities.
    pub fn on_established(&mut self, se: &SessionEstablished) -> Result<(), HandshakeError> {
        let order_ok = match self.state {
            ClientState::AuthSent => true,
            ClientState::KeysReady => !self.server_wants_password,
            _ => false,
        };
        if !order_ok {
            return Err(HandshakeError::Violation("SESSION_ESTABLISHED out of order"));
        }
        self.slot_id = Some(se.slot_id);
        self.negotiated = Some(se.caps);
        self.state = ClientState::Established;
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        self.state == ClientState::Established
    }

    /// Keys become available after SERVER_HELLO (auth packets are already
    /// sealed with them).
    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn take_keys(&mut self) -> Option<SessionKeys> {
        self.keys.take()
    }

    pub fn slot_id(&self) -> Option<u32> {
        self.slot_id
    }

    pub fn negotiated_caps(&self) -> Option<Capabilities> {
        self.negotiated
    }

    pub fn server_identity_pk(&self) -> Option<[u8; 32]> {
        self.server_pk
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            ClientState::HelloSent => "HelloSent",
            ClientState::KeysReady => "ServerHelloReceived",
            ClientState::AuthSent => "AuthResponseSent",
            ClientState::Established => "Established",
        }
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Password verification material, derived once at startup so each
/// connection costs one HMAC rather than a full bcrypt-pbkdf run.
pub struct ServerAuth {
    pub salt: [u8; 16],
    pub rounds: u32,
    key: [u8; 32],
}

impl ServerAuth {
    pub fn from_password(pw: &str, rounds: u32) -> Result<Self, PasswordError> {
        let mut salt = [0u8; 16];
        getrandom::getrandom(&mut salt).map_err(|_| PasswordError::KdfFailed)?;
        let key = password::derive_key(pw, &salt, rounds)?;
        Ok(ServerAuth { salt, rounds, key: *key })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    AwaitHello,
    ChallengePending,
    ChallengeSent,
    Ready,
    Established,
}

pub struct ServerHandshake {
    state: ServerState,
    transcript: Transcript,
    eph: Option<EphemeralKey>,
    auth: Option<std::sync::Arc<ServerAuth>>,
    keys: Option<SessionKeys>,
    client_pk: Option<[u8; 32]>,
    client_caps: Option<Capabilities>,
    client_name: Option<String>,
}

impl ServerHandshake {
    pub fn new(eph: EphemeralKey, auth: Option<std::sync::Arc<ServerAuth>>) -> Self {
        ServerHandshake {
            state: ServerState::AwaitHello,
            transcript: Transcript::new(TRANSCRIPT_DOMAIN),
            eph: Some(eph),
            auth,
            keys: None,
            client_pk: None,
            client_caps: None,
            client_name: None,
        }
    }

    /// Process HELLO: bind both sides into the transcript, sign it, and
    /// derive keys. Returns the SERVER_HELLO to send (unsealed).
    pub fn on_hello(&mut self, identity: &Identity, hello: &Hello) -> Result<ServerHello, HandshakeError> {
        if self.state != ServerState::AwaitHello {
            return Err(HandshakeError::Violation("HELLO out of order"));
        }
        append_client_fields(&mut self.transcript, hello);

        let eph = self
            .eph
            .take()
            .ok_or(HandshakeError::Violation("ephemeral already consumed"))?;
        let nonce = random32();
        append_server_fields(
            &mut self.transcript,
            &identity.public_key(),
            &eph.public_key(),
            &nonce,
        );
        let transcript_hash = self.transcript.hash();
        let sig = identity.sign(&transcript_hash);

        let shared = eph.diffie_hellman(&hello.ephemeral_pk);
        self.keys = Some(derive_session(&shared, &transcript_hash));
        self.client_pk = Some(hello.identity_pk);
        self.client_caps = Some(hello.caps);
        self.client_name = Some(hello.display_name.clone());
        self.state = if self.auth.is_some() {
            ServerState::ChallengePending
        } else {
            ServerState::Ready
        };
        debug!(client = %hash::host_id(&hello.identity_pk), "hello accepted");

        Ok(ServerHello {
            identity_pk: identity.public_key(),
            ephemeral_pk: eph.public_key(),
            nonce,
            password_required: self.auth.is_some(),
            sig,
        })
    }

    /// The challenge to send (sealed), if a password is required.
    pub fn auth_challenge(&mut self) -> Option<AuthChallenge> {
        if self.state != ServerState::ChallengePending {
            return None;
        }
        let auth = self.auth.as_ref().expect("ChallengePending implies auth");
        append_auth_fields(&mut self.transcript, &auth.salt, auth.rounds);
        self.state = ServerState::ChallengeSent;
        Some(AuthChallenge { salt: auth.salt, rounds: auth.rounds })
    }

    /// Verify the client's password proof (constant time).
    pub fn on_auth_response(&mut self, resp: &AuthResponse) -> Result<(), HandshakeError> {
        if self.state != ServerState::ChallengeSent {
            return Err(HandshakeError::Violation("AUTH_RESPONSE out of order"));
        }
        let auth = self.auth.as_ref().expect("ChallengeSent implies auth");
        password::verify(&auth.key, &self.transcript.hash(), &resp.mac)?;
        self.state = ServerState::Ready;
        Ok(())
    }

    /// Mint the final message once the registry has assigned a slot.
    pub fn establish(
        &mut self,
        slot_id: u32,
        negotiated: Capabilities,
    ) -> Result<SessionEstablished, HandshakeError> {
        if self.state != ServerState::Ready {
            return Err(HandshakeError::Violation("establish before Ready"));
        }
        self.state = ServerState::Established;
        Ok(SessionEstablished { slot_id, caps: negotiated })
    }

    pub fn is_established(&self) -> bool {
        self.state == ServerState::Established
    }

    pub fn needs_auth(&self) -> bool {
        matches!(self.state, ServerState::ChallengePending | ServerState::ChallengeSent)
    }

    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn take_keys(&mut self) -> Option<SessionKeys> {
        self.keys.take()
    }

    pub fn client_identity_pk(&self) -> Option<[u8; 32]> {
        self.client_pk
    }

    pub fn client_caps(&self) -> Option<Capabilities> {
        self.client_caps
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            ServerState::AwaitHello => "AwaitHello",
            ServerState::ChallengePending => "ChallengePending",
            ServerState::ChallengeSent => "AuthChallengeSent",
            ServerState::Ready => "Ready",
            ServerState::Established => "Established",
        }
    }
}
