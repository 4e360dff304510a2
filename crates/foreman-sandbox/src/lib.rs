mod gates;
mod paths;
mod policy;
mod runner;

pub use gates::GateRunner;
pub use paths::resolve_path;
pub use policy::SandboxPolicy;
pub use runner::{CommandOutcome, CommandSpec, EventSink, Sandbox, MAX_CAPTURE_BYTES};
