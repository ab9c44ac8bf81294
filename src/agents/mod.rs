pub mod api;
pub mod artifacts;
pub mod cycle;
pub mod health;
pub mod invoker;
pub mod llm;
pub mod mailbox;
pub mod runner;
pub mod state_machine;
pub mod tools;

pub use api::{AgentApiServer, AgentApiState};
pub use artifacts::ArtifactManager;
pub use cycle::{CycleContext, StepOutcome, StepRecord};
pub use health::{HealthMonitor, Scheduler};
pub use invoker::{AgentInvoker, ChatProvider};
pub use llm::OllamaClient;
pub use mailbox::{MailboxMessage, MailboxStore, MessageKind};
pub use runner::{LearningLoopRunner, RunnerShared};
pub use state_machine::CycleState;
pub use tools::{Tool, ToolExecutor, ToolOutcome};
