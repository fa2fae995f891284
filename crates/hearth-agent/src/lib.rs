pub mod config_store;
pub mod log_buffer;
pub mod log_classifier;
pub mod log_file;
pub mod minecraft;
pub mod process_manager;
pub mod process_manager_support;
pub mod tunnel;
pub mod world_guard;
