//! Offline decoding of server recording logs.

pub mod decoder;
pub mod events;
#[cfg(test)]
pub mod testing;

pub use decoder::{FrameRecord, LogDecoder, write_csv};
pub use events::RecordingEvent;
