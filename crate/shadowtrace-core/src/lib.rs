pub mod config;
pub mod fs;
pub mod trace;
pub mod utils;
