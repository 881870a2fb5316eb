// Karasu - signed on-the-fly image transformation proxy

pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod meta;
pub mod options;
pub mod pipeline;
pub mod server;
pub mod signature;
pub mod watermark;
