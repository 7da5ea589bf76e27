//! Configuration loading for the gateway client.
//!
//! Config files are discovered as `castle.{toml,yaml,yml,json}` in the
//! working directory, then in `~/.config/castle/`. `${VAR}` placeholders are
//! substituted before parsing.

pub mod env_subst;
pub mod external;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir,
    },
    schema::{CastleConfig, ChatConfig, GatewayConfig},
};
