mod escalation;
mod handle;
mod machine;
mod server;

pub use handle::{ProcessHandle, SupervisionConfig};
pub use server::{DEFAULT_SHUTDOWN_COMMAND, ServerProcessHandle};
