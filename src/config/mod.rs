mod loader;

pub use loader::{
    AgentConfig, Config, DispatchConfig, InjectionConfig, LogConfig, QueueConfig,
    RemoteDebugConfig, StorageKind, UrgentConfig,
};
