//! Shared types for the doorwatch service: configuration, the segment
//! filename format and locator, and the wire types of the webhook and the
//! signal ingress.

pub mod config;
pub mod protocol;
pub mod segment;
