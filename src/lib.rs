pub mod build_db;
pub mod classifier;
pub mod config;
pub mod debounce;
pub mod errors;
pub mod model;
pub mod notifier;
pub mod orchestrator;
pub mod properties;
pub mod revisions;
pub mod scanner;
pub mod template;
pub mod tree;
