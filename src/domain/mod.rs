//! Entities, state machines and the ports the engine talks through.

pub mod customer;
pub mod invoice;
pub mod money;
pub mod payment;
pub mod plan;
pub mod ports;
pub mod risk;
pub mod subscription;
