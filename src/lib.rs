//! Floodgate - Sliding Window Rate Limiting Middleware
//!
//! This crate gates HTTP requests behind per-identity call budgets. Each
//! identity gets a window of allowed calls tracked either in process memory
//! or in a shared Redis store, and an axum middleware layer that answers
//! every request with the window state or a refusal.

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
