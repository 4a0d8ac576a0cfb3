//! Purpose: Library crate behind the `labctl` CLI, daemon and integration tests.
//! Exports: `core` (proxy engine), `api` (public surface + HTTP client), `config`, `notice`.
//! Role: Embeddable serial console multiplexer; the binary is a thin shell over it.
//! Invariants: Proxy state lives in an explicit `Supervisor`; there are no globals.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod config;
pub mod core;
pub mod notice;
