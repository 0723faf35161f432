//! Persisted state
//!
//! The only state that survives a restart is the compact "active configs"
//! blob: per metric with activations, the remaining TTL of each
//! still-active activation at shutdown. Written as JSON at a caller-chosen
//! path; loaded once at startup before any event is delivered.

pub mod activations;

pub use activations::{
    load_active_configs, save_active_configs, ActiveActivationBlob, ActiveConfigBlob,
    ActiveConfigsBlob, ActiveMetricBlob, StorageError,
};
