//! Gateway configuration: schema, discovery and loading.
//!
//! Config files are TOML, YAML or JSON with a `[general]` section and
//! optional per-identity override sections. `${ENV_VAR}` placeholders are
//! substituted before parsing.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{GatewayConfig, ParamPrecedence},
};
