//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled    |
//! |-----------|---------------------|
//! | `project` | `Init`              |
//! | `run`     | `Run`, `Resume`     |
//! | `status`  | `Status`, `List`    |
//! | `cleanup` | `Cleanup`           |
//! | `config`  | `Config`            |

pub mod cleanup;
pub mod config;
pub mod project;
pub mod run;
pub mod status;

pub use cleanup::cmd_cleanup;
pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{cmd_resume, cmd_run};
pub use status::{cmd_list, cmd_status};
