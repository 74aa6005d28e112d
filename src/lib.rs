//! kettle - an interpreter for class-file bytecode.
//!
//! The engine executes methods of classes supplied through the
//! [`ClassLoader`] seam, with JVM semantics for stack discipline, dispatch,
//! exceptions, monitors and class initialization. Program images
//! ([`image`]) are the on-disk form used by the `kettle` binary.
//!
//! ```no_run
//! use kettle::{ImageLoader, Vm};
//!
//! let loader = ImageLoader::load("hello.toml".as_ref())?;
//! let vm = Vm::builder().loader(loader).build()?;
//! let mut thread = vm.new_thread();
//! let outcome = thread.invoke_static("demo/Main", "main", "()V", &[])?;
//! assert!(!outcome.is_throw());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod image;
pub mod vm;

pub use config::RuntimeConfig;
pub use error::{ConfigError, ImageError, VmError};
pub use image::{ImageLoader, ProgramImage};
pub use vm::{ClassLoader, Outcome, Thread, Value, Vm, VmBuilder};
