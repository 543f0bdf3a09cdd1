//! Delivery worker service: wiring plus the HTTP relay transport.

pub mod relay;
pub mod settings;
