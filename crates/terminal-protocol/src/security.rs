//! Key exchange between terminals.
//!
//! Terminals agree on a per-peer symmetric key by running one Noise `NN`
//! round through the regular request path: the initiator's handshake message
//! rides in `req` against the peer's `HandShake/<terminal_id>` service, the
//! responder's message comes back in `res`. Both sides then derive the same
//! 32-byte key from the handshake hash and cache it in their keyring.
//!
//! `seal`/`open` wrap ChaCha20-Poly1305 for payload encryption under a cached
//! key. A peer that restarts loses its keyring, so an `open` failure means
//! the caller should re-run the handshake and retry.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use crate::client::TerminalClient;
use crate::error::{codes, ProtocolError, Result};
use crate::model::encode_path;

const NOISE_PARAMS: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";
const KEY_CONTEXT: &[u8] = b"terminal-protocol shared key v1";
const NONCE_LEN: usize = 12;

/// Method under which a terminal serves its side of the handshake.
pub fn handshake_method(terminal_id: &str) -> String {
    encode_path(&["HandShake", terminal_id])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Base64 initiator handshake message.
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Base64 responder handshake message.
    pub msg: String,
}

/// Per-peer shared keys of one terminal.
#[derive(Default)]
pub struct Keyring {
    keys: Mutex<HashMap<String, [u8; 32]>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key(&self, peer_id: &str) -> bool {
        self.keys.lock().contains_key(peer_id)
    }

    pub fn forget(&self, peer_id: &str) {
        self.keys.lock().remove(peer_id);
    }

    fn insert(&self, peer_id: &str, key: [u8; 32]) {
        self.keys.lock().insert(peer_id.to_string(), key);
    }

    fn key_for(&self, peer_id: &str) -> Result<[u8; 32]> {
        self.keys
            .lock()
            .get(peer_id)
            .copied()
            .ok_or_else(|| ProtocolError::Handshake(format!("no shared key with {peer_id}")))
    }

    /// Encrypt a payload for `peer_id`. Output is base64 of nonce followed by
    /// ciphertext.
    pub fn seal(&self, peer_id: &str, plaintext: &[u8]) -> Result<String> {
        let key = self.key_for(peer_id)?;
        let cipher = ChaCha20Poly1305::new((&key).into());
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::Handshake("seal failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a payload from `peer_id`. Fails when no key is cached or the
    /// key no longer matches; re-handshake and retry in that case.
    pub fn open(&self, peer_id: &str, sealed: &str) -> Result<Vec<u8>> {
        let key = self.key_for(peer_id)?;
        let raw = BASE64
            .decode(sealed)
            .map_err(|_| ProtocolError::Handshake("sealed payload is not base64".into()))?;
        if raw.len() < NONCE_LEN {
            return Err(ProtocolError::Handshake("sealed payload too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&key).into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtocolError::Handshake("open failed, key mismatch".into()))
    }
}

/// Run the initiator side against a peer and cache the derived key.
pub async fn initiate(client: &TerminalClient, keyring: &Keyring, peer_id: &str) -> Result<()> {
    let params = NOISE_PARAMS
        .parse()
        .map_err(|_| ProtocolError::Handshake("bad noise params".into()))?;
    let mut handshake = snow::Builder::new(params)
        .build_initiator()
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let mut buf = [0u8; 1024];
    let len = handshake
        .write_message(&[], &mut buf)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
    let request = HandshakeRequest {
        msg: BASE64.encode(&buf[..len]),
    };

    let res = client
        .request_to(
            peer_id,
            &handshake_method(peer_id),
            serde_json::to_value(&request).unwrap_or(json!({})),
        )
        .response()
        .await?;
    if res.code != codes::OK {
        return Err(ProtocolError::Handshake(format!(
            "peer refused handshake: {} {}",
            res.code, res.message
        )));
    }
    let response: HandshakeResponse = serde_json::from_value(res.data.unwrap_or_default())
        .map_err(|_| ProtocolError::Handshake("malformed handshake response".into()))?;
    let msg2 = BASE64
        .decode(&response.msg)
        .map_err(|_| ProtocolError::Handshake("handshake message is not base64".into()))?;

    let mut payload = [0u8; 1024];
    handshake
        .read_message(&msg2, &mut payload)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let key = derive_key(handshake.get_handshake_hash())?;
    keyring.insert(peer_id, key);
    debug!(peer_id, "shared key established");
    Ok(())
}

/// Run the responder side for one inbound handshake request. Returns the
/// response to put in `res.data` and caches the derived key.
pub fn respond(keyring: &Keyring, peer_id: &str, request: &HandshakeRequest) -> Result<HandshakeResponse> {
    let params = NOISE_PARAMS
        .parse()
        .map_err(|_| ProtocolError::Handshake("bad noise params".into()))?;
    let mut handshake = snow::Builder::new(params)
        .build_responder()
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let msg1 = BASE64
        .decode(&request.msg)
        .map_err(|_| ProtocolError::Handshake("handshake message is not base64".into()))?;
    let mut payload = [0u8; 1024];
    handshake
        .read_message(&msg1, &mut payload)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let mut buf = [0u8; 1024];
    let len = handshake
        .write_message(&[], &mut buf)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let key = derive_key(handshake.get_handshake_hash())?;
    keyring.insert(peer_id, key);
    debug!(peer_id, "shared key established");
    Ok(HandshakeResponse {
        msg: BASE64.encode(&buf[..len]),
    })
}

fn derive_key(handshake_hash: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, handshake_hash);
    let mut key = [0u8; 32];
    hk.expand(KEY_CONTEXT, &mut key)
        .map_err(|_| ProtocolError::Handshake("key derivation failed".into()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive both sides locally, without the request plumbing.
    fn handshake_pair() -> (Keyring, Keyring) {
        let initiator_ring = Keyring::new();
        let responder_ring = Keyring::new();

        let params: snow::params::NoiseParams = NOISE_PARAMS.parse().unwrap();
        let mut initiator = snow::Builder::new(params.clone()).build_initiator().unwrap();

        let mut buf = [0u8; 1024];
        let len = initiator.write_message(&[], &mut buf).unwrap();
        let request = HandshakeRequest {
            msg: BASE64.encode(&buf[..len]),
        };

        let response = respond(&responder_ring, "alice", &request).unwrap();
        let msg2 = BASE64.decode(&response.msg).unwrap();
        let mut payload = [0u8; 1024];
        initiator.read_message(&msg2, &mut payload).unwrap();
        initiator_ring.insert("bob", derive_key(initiator.get_handshake_hash()).unwrap());

        (initiator_ring, responder_ring)
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let (alice, bob) = handshake_pair();
        assert_eq!(alice.key_for("bob").unwrap(), bob.key_for("alice").unwrap());
    }

    #[test]
    fn seal_and_open_round_trip_across_rings() {
        let (alice, bob) = handshake_pair();
        let sealed = alice.seal("bob", b"order: buy 1 BTC").unwrap();
        let opened = bob.open("alice", &sealed).unwrap();
        assert_eq!(opened, b"order: buy 1 BTC");
    }

    #[test]
    fn open_with_a_stale_key_fails() {
        let (alice, _) = handshake_pair();
        let (_, fresh_bob) = handshake_pair();
        let sealed = alice.seal("bob", b"secret").unwrap();
        assert!(fresh_bob.open("alice", &sealed).is_err());
    }

    #[test]
    fn open_without_a_key_is_an_error() {
        let ring = Keyring::new();
        assert!(matches!(
            ring.open("stranger", "AAAA"),
            Err(ProtocolError::Handshake(_))
        ));
    }
}
