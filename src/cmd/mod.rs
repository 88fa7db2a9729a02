//! CLI command implementations.
//!
//! | Module   | Commands handled      |
//! |----------|-----------------------|
//! | `serve`  | `Serve`, `InitDb`     |
//! | `jobs`   | `Jobs`                |
//! | `config` | `Config`              |

pub mod config;
pub mod jobs;
pub mod serve;

pub use config::cmd_config;
pub use jobs::cmd_jobs;
pub use serve::{cmd_init_db, cmd_serve};
