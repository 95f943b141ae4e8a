//! Command implementations, one module per command group

pub mod engine;
pub mod events;
pub mod mq;
