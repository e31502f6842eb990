pub mod consumer;
pub mod producer;

pub use consumer::{AmqpConsumer, BusConsumer};
pub use producer::{AmqpProducer, BusProducer};
