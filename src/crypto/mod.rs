//! Cryptographic utilities for the bridge
//!
//! This module provides:
//! - SHA-256 hashing
//! - ECDSA identity keys (secp256k1) used to authenticate handshakes

pub mod hash;
pub mod keys;

pub use hash::{sha256, sha256_hex};
pub use keys::{
    fingerprint, public_key_from_hex, sign_message, verify_signature, KeyError, KeyPair,
};
