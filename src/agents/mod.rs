mod registry;

pub use registry::{AgentRegistry, RegistryError};
