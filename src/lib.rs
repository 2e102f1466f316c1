//! agent-harness — supervises long-running interactive coding-agent
//! processes (codex, claude-code, pi, opencode) inside tmux, exposed over an
//! HTTP + SSE control plane.
//!
//! Library surface shared by the binary in `main.rs` and integration tests.

#![allow(dead_code)]

pub mod callbacks_store;
pub mod config;
pub mod debug;
pub mod error;
pub mod eventbus;
pub mod ids;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod model;
pub mod poller;
pub mod providers;
pub mod rest;
pub mod tmux;
pub mod webhook;
