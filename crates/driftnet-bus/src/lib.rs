//! Durable at-least-once message bus over Redis Streams.
//!
//! Each stream is consumed through a consumer group; deliveries stay in the
//! group's pending list until acked, and deliveries abandoned by a dead
//! consumer are reclaimed after an idle threshold. Handler outcomes map to
//! ack (done), ack-and-drop (poison payload) or leave-pending (transient
//! failure, redelivered).

pub mod consumer;
pub mod error;
pub mod stream;

pub use consumer::{ConsumerConfig, ConsumerLoop, Disposition, StreamHandler};
pub use error::{BusError, Result};
pub use stream::{decode, Delivery, MessageBus};
