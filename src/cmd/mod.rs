//! CLI command implementations.
//!
//! | Module     | Commands handled      |
//! |------------|-----------------------|
//! | `validate` | `Validate`, `Waves`   |
//! | `run`      | `Run`                 |
//! | `archive`  | `Archive`             |
//! | `config`   | `Config`              |

pub mod archive;
pub mod config;
pub mod run;
pub mod validate;

pub use archive::cmd_archive;
pub use config::cmd_config;
pub use run::{RunOptions, cmd_run};
pub use validate::{cmd_validate, cmd_waves};
