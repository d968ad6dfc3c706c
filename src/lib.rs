pub mod arc_config;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod convergence;
pub mod errors;
pub mod gates;
pub mod init;
pub mod orchestrator;
pub mod phase;
pub mod resource;
pub mod ui;
