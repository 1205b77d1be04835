//! microsandbox-gateway library
//!
//! A session manager and gateway sitting between programmatic clients and a
//! remote microsandbox execution server: session identity and reuse, LRU
//! admission/eviction, idle and orphan reaping, and an MCP adapter exposing
//! it all as tools.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod remote;
pub mod resource;
pub mod session;
