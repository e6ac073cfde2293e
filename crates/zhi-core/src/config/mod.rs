//! Configuration: schema, loading, and `ZHI_*` env overrides.
//!
//! ```no_run
//! use zhi_core::config;
//!
//! let mut cfg = config::load_config(None);
//! for warning in cfg.validate() {
//!     eprintln!("config: {warning}");
//! }
//! println!("Model: {}", cfg.default_model);
//! ```

pub mod loader;
pub mod schema;

pub use loader::{get_config_path, load_config, save_config};
pub use schema::{Config, PermissionMode};
