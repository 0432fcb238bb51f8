//! Priority message queue with pluggable delivery into agent input surfaces.

pub mod agents;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod models;
pub mod queue;
