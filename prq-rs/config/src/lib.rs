pub mod config;
pub mod defaults;
pub mod settings;

pub use config::{
    DEFAULT_CONFIG_FILENAME, ENV_CONFIG_KEY, load_toml_settings, resolve_config_source,
};
pub use defaults::*;
pub use settings::{PrqSettings, QueueSettings};
