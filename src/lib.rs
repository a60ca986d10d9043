//! Admission control and tamper-evident auditing for privileged commands.
//!
//! [`core::SecurityCore`] ties together a persisted sliding-window
//! [`RateLimiter`](core::RateLimiter), an HMAC-signed [`AuditLog`](core::AuditLog)
//! and the security event reporter. The hardened helpers in
//! [`core::safety`] and [`core::safe_json`] are usable on their own.

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
