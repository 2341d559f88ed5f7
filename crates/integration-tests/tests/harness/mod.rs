//! Shared fixtures; not every test binary uses every helper
#![allow(dead_code)]

pub mod config;
pub mod mock_llm;
pub mod server;
