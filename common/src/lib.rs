//! Shared types and constants for kprobe tracing
//!
//! This crate provides the record layouts and defaults shared between
//! kernel-side kprobe programs and the userspace tracer.

#![no_std]

pub mod types;
pub mod constants;

// Re-export commonly used types
pub use types::OpenEvent;
pub use constants::*;
