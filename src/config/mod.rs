mod agent;
mod server;

pub use agent::{AgentConfig, AgentConfigOverrides};
pub use server::{BrokerConfig, ServerConfig, ServerConfigOverrides};
