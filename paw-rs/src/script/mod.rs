//! The paw scripting engine.
//!
//! Leaves first:
//!
//! - [`value`], [`command`], [`parser`]: what scripts are made of;
//! - [`store`]: the refcounted object heap and its markers;
//! - [`state`], [`module`]: per-activation variables, claims and exports;
//! - [`token`]: suspension and out-of-band resumption;
//! - [`macros`], [`substitute`]: macro activations and argument binding;
//! - [`fiber`]: concurrent activations and orphaned bubbles;
//! - [`context`], [`executor`]: the handler API and the engine itself;
//! - [`stdlib`]: the core commands.
//!
//! # Quick start
//!
//! ```rust
//! use paw::script::{CmdResult, Executor, Value};
//!
//! let exec = Executor::new();
//! exec.register_command("add", |ctx| {
//!     let sum: i64 = ctx.args.iter().map(Value::as_int).sum();
//!     ctx.set_result(Value::Int(sum));
//!     CmdResult::Status(true)
//! });
//! let run = exec.execute("add", &[Value::Int(2), Value::Int(3)]);
//! assert_eq!(run.result, Some(Value::Int(5)));
//! ```

pub mod command;
pub mod context;
pub mod executor;
pub mod fiber;
pub mod macros;
pub mod module;
pub mod parser;
pub mod state;
pub mod stdlib;
pub mod store;
pub mod substitute;
pub mod token;
pub mod value;

// Re-exports for convenience.
pub use command::{Command, CommandSequence, Separator, SourcePosition};
pub use context::{CmdResult, Context, Handler};
pub use executor::{read_script, CommandCall, Execution, Executor, SpawnedFiber};
pub use fiber::{Bubble, FiberHandle, FiberId, ROOT_FIBER};
pub use macros::{Macro, MacroContext};
pub use parser::{CommandParser, Parse};
pub use state::ExecutionState;
pub use store::{ObjectId, ObjectKind, ObjectStore, ObjectValue};
pub use substitute::SubstitutionContext;
pub use token::{Cleanup, TokenId, TokenInfo, TokenStatus};
pub use value::Value;
