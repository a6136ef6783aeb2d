pub mod agent;
pub mod browser;
pub mod config;
pub mod gemini;
pub mod policy;
pub mod reasoner;
pub mod reduce;
pub mod retry;
pub mod server;
pub mod store;

pub use agent::{Agent, AgentConfig, AgentError, RunState, Termination};
pub use browser::{BrowserConfig, ChromiumLauncher, ChromiumSession};
pub use config::Config;
pub use gemini::{GeminiClient, GeminiConfig};
pub use policy::DenyListPolicy;
pub use reasoner::GeminiReasoner;
