//! Hashing primitives
//!
//! Blake3 fingerprints used for duplicate suppression.

pub mod hash;

pub use hash::{delivery_fingerprint, frame_fingerprint, Fingerprint};
