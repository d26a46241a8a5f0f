pub mod loader;
pub mod schema;

pub use loader::{
    default_config_path, load_config, load_config_from_str, resolve_api_key, validate_config,
};
pub use schema::{
    ApiConfig, BatchConfig, Config, ConversionConfig, LoggingConfig, RetryConfig, WatcherConfig,
};
