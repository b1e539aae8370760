//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                  |
//! |----------|-----------------------------------|
//! | `run`    | `Run`                             |
//! | `runs`   | `Runs List`, `Runs Show`          |
//! | `config` | `Config Show`, `Validate`, `Init` |

pub mod config;
pub mod run;
pub mod runs;

pub use config::cmd_config;
pub use run::{RunOptions, cmd_run};
pub use runs::cmd_runs;
