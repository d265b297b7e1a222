//! Per-connection end-to-end encryption.
//!
//! Each encrypted logical connection runs its own ephemeral X25519 exchange:
//! the dialing side sends its public key in the connect frame, the peer
//! answers with its own, and both derive mirrored `(rx, tx)` keys through
//! HKDF-SHA256 salted with the two public keys. Each direction is then an
//! XChaCha20-Poly1305 secret stream: a random 24-byte header travels as the
//! first payload and every subsequent frame advances the nonce internally.

use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce, aead::Aead};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::Error;

pub const KEY_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 24;
/// Poly1305 tag appended to every sealed frame.
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialing side of the exchange.
    Initiator,
    /// The bound/accepting side.
    Responder,
}

/// Directional session keys. `rx` opens what the peer seals with its `tx`.
pub struct SessionKeys {
    pub rx: [u8; KEY_SIZE],
    pub tx: [u8; KEY_SIZE],
}

/// One-shot ephemeral key exchange.
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        Self { secret, public }
    }

    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        self.public.as_bytes()
    }

    /// Derives the directional keys from the peer's public key.
    ///
    /// Both sides must agree on who the initiator is; the salt orders the
    /// public keys initiator-first so the derivation mirrors.
    pub fn derive(&self, peer: &[u8; KEY_SIZE], role: Role) -> Result<SessionKeys, Error> {
        let peer_pk = PublicKey::from(*peer);
        let shared = self.secret.diffie_hellman(&peer_pk);
        if !shared.was_contributory() {
            return Err(Error::Crypto);
        }

        let mut salt = [0u8; KEY_SIZE * 2];
        match role {
            Role::Initiator => {
                salt[..KEY_SIZE].copy_from_slice(self.public.as_bytes());
                salt[KEY_SIZE..].copy_from_slice(peer);
            }
            Role::Responder => {
                salt[..KEY_SIZE].copy_from_slice(peer);
                salt[KEY_SIZE..].copy_from_slice(self.public.as_bytes());
            }
        }

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = [0u8; KEY_SIZE * 2];
        hk.expand(b"veil-conn-keys", &mut okm)
            .map_err(|_| Error::Crypto)?;

        let mut a = [0u8; KEY_SIZE];
        let mut b = [0u8; KEY_SIZE];
        a.copy_from_slice(&okm[..KEY_SIZE]);
        b.copy_from_slice(&okm[KEY_SIZE..]);

        Ok(match role {
            Role::Initiator => SessionKeys { tx: a, rx: b },
            Role::Responder => SessionKeys { tx: b, rx: a },
        })
    }
}

fn nonce_at(header: &[u8; HEADER_SIZE], counter: u64) -> XNonce {
    let mut nonce = *header;
    for (dst, src) in nonce[HEADER_SIZE - 8..]
        .iter_mut()
        .zip(counter.to_le_bytes())
    {
        *dst ^= src;
    }

    XNonce::from(nonce)
}

/// Sealing half of a secret stream.
pub struct SecretStreamTx {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_SIZE],
    counter: u64,
}

impl SecretStreamTx {
    /// Creates the stream and the header the peer needs to open it.
    pub fn new(key: &[u8; KEY_SIZE]) -> (Self, [u8; HEADER_SIZE]) {
        let mut header = [0u8; HEADER_SIZE];
        OsRng.fill_bytes(&mut header);

        (
            Self {
                cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
                header,
                counter: 0,
            },
            header,
        )
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = nonce_at(&self.header, self.counter);
        self.counter += 1;

        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Crypto)
    }
}

/// Opening half of a secret stream.
pub struct SecretStreamRx {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_SIZE],
    counter: u64,
}

impl SecretStreamRx {
    pub fn new(key: &[u8; KEY_SIZE], header: &[u8]) -> Result<Self, Error> {
        let header: [u8; HEADER_SIZE] = header.try_into().map_err(|_| Error::Crypto)?;

        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            header,
            counter: 0,
        })
    }

    /// Opens the next frame. Any failure is fatal to the stream: the nonce
    /// has already advanced and the connection must close.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = nonce_at(&self.header, self.counter);
        self.counter += 1;

        self.cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::Crypto)
    }
}
