//! Lyra runtime core.
//!
//! A register-free, stack-based bytecode virtual machine for a small
//! Lisp-like functional language: immutable persistent data structures
//! (bit-partitioned vectors, hash array mapped tries, lazy sequences),
//! a concurrent tri-colour incremental mark-and-sweep collector,
//! lightweight threads sharing a single heap, and software-transactional
//! global cells.
//!
//! Hosts embed the runtime through [`State`]: load a compiled image,
//! push arguments, and [`call`](State::call).
//!
//! ```no_run
//! use lyra_runtime::State;
//!
//! fn main() -> lyra_runtime::Result<()> {
//!     let mut s = State::new();
//!     s.load(std::fs::File::open("program.lyc").expect("image"))?;
//!     s.push_string("program.lyc")?;
//!     s.call(1, 1)?;
//!     println!("=> {}", s.stringify(-1));
//!     Ok(())
//! }
//! ```

#![warn(unsafe_op_in_unsafe_fn)]

mod api;
mod bytecode;
mod cell;
mod error;
mod gc;
mod intern;
mod map;
mod seq;
mod state;
mod thread;
mod value;
mod vector;
mod vm;

pub use bytecode::{ImageError, Instruction, Opcode, IMAGE_MAGIC, IMAGE_VERSION};
pub use cell::{GlobalCell, LocalCell};
pub use error::{Error, Result};
pub use gc::Gc;
pub use intern::Str;
pub use map::{Map, MapNode};
pub use seq::{Seq, TreeLink};
pub use state::{Interrupt, State, GLOBAL_INDEX, MAX_CALLS, MAX_THREADS, NIL_INDEX,
    REGISTRY_INDEX, STACK_SIZE};
pub use value::{DataClass, DebugFn, DebugInfo, NativeData, NativeFn, Value, ValueKind};
pub use vector::{VecNode, Vector};
pub use vm::{Closure, Proto};
