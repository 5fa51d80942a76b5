//! wasmelt: JIT WebAssembly engine frontend.
//!
//! This crate translates a validated WebAssembly function body into a typed
//! SSA intermediate representation with block parameters instead of phi
//! nodes. Construction is incremental: the control-flow graph, the SSA
//! def-use chains and the block-parameter plumbing are built in a single
//! pass over the bytecode, using Braun et al.'s algorithm for direct SSA
//! construction ("Simple and Efficient Construction of Static Single
//! Assignment Form", CC 2013).
//!
//! The pipeline around this crate (module loading, validation, the SSA
//! backend, the runtime) consists of external collaborators. The frontend
//! trusts its input (validation precedes lowering) and exposes the finished
//! SSA function through [`ssa::FunctionBuilder`].
//!
//! ```no_run
//! use wasmelt::frontend::Frontend;
//! use wasmelt::module::{FunctionType, ModuleEnv, ValueType};
//!
//! let mut env = ModuleEnv::default();
//! let ty = env.push_type(FunctionType::new([ValueType::I32], [ValueType::I32]));
//! env.push_function(ty);
//!
//! let mut frontend = Frontend::new(&env);
//! // (local.get 0) (end)
//! frontend.compile_function(0, &[], &[0x20, 0x00, 0x0b]).unwrap();
//! println!("{}", frontend.ssa().dump());
//! ```

pub mod abi;
pub mod error;
pub mod frontend;
pub mod module;
pub mod ssa;

pub use error::CompileError;

// Re-export key types for convenience
pub use anyhow::{Context, Result};
