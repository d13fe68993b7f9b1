// # -----------------------------
// # crates/worker/src/lib.rs
// # -----------------------------
pub mod extract;
pub mod interpreter;
pub mod invoker;
pub mod mutation;
pub mod staging;

pub use extract::ArtifactExtractor;
pub use interpreter::{select_interpreter, select_interpreter_with, Interpreter, INTERPRETER_ENV};
pub use invoker::{WorkerCommand, WorkerInvocation, WorkerInvoker};
pub use mutation::{DesignMutator, MutationOutcome, MutationSource};
pub use staging::Staging;
