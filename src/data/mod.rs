//! Sample buffering and persistence.
pub mod csv_storage;
pub mod sample_buffer;

pub use csv_storage::LoadedData;
pub use sample_buffer::SampleBuffer;
