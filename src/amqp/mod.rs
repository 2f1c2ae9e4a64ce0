//! Connecting to a RabbitMq broker.

pub mod configuration;
mod factory;
pub use factory::ConnectionFactory;

pub use lapin::{types, BasicProperties};
