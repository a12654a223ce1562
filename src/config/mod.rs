mod settings;

pub use settings::{DispatcherConfig, LoggingConfig, PolicyConfig, Settings, StoreConfig};
