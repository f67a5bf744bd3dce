//! Sample buffers shared between the engine worker and the output.

pub mod ring;

pub use ring::{shared_ring_buffer, RingBuffer, SharedRingBuffer};
