pub mod config;
pub mod errors;
pub mod pipeline;
pub mod services;
pub mod telemetry;
pub mod util;
