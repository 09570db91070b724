//! Agent runtime: drives one tool-using agent run under an enforced policy.
//!
//! # Architecture
//!
//! Each `execute` call walks a bounded state machine:
//! 1. **Reason** (`llm`) - ask the chat capability for the next message
//! 2. **Decide** - either a tool request or the final answer
//! 3. **Invoke tool** (`tools`) - validate, gate through `interception`, execute
//!
//! Every step is recorded in the event log, which is the only input the
//! offline classification worker reads.

pub mod interception;
pub mod llm;
pub mod runtime;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use interception::{InterceptionHook, InterceptionPolicy, InterceptionResult};
pub use llm::{ChatMessage, ChatModel, Role, ToolCallRequest};
pub use runtime::{ExecutionResult, RuntimeEngine, RuntimeError, RuntimeNode};
pub use tools::{
    StubToolExecutor, ToolExecutor, ToolInvocation, ToolInvocationError, ToolInvoker, ToolOutcome,
};
