//! Chat Backend Library
//!
//! Persistence, authentication, the streaming completion provider, the HTTP
//! API and the realtime gateway, plus a headless client adapter. The main
//! binary is in `src/main.rs`.

pub mod api;
pub mod auth;
pub mod client;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod ws;
