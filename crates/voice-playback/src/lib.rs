pub mod codec;
pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod pipeline;
pub mod playback;
pub mod queue;
pub mod render;
pub mod resample;
pub mod resync;
pub mod status;
pub mod thresholds;
