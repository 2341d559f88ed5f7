//! Translators between the canonical chat shape and native provider formats
//!
//! The REST family speaks the canonical shape directly and needs none.

pub mod gemini;
