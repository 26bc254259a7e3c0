//! memmod – in-process loader for Windows PE images.
//!
//! Maps a PE image supplied as an in-memory byte buffer into the current
//! process and performs the fix-ups the OS loader would apply to a module
//! loaded from disk: base relocation, import binding, section protections,
//! TLS callbacks, and entry-point dispatch. The image's exports are then
//! available as callable function pointers. Nothing touches the
//! filesystem and nothing is registered with the OS loader's module list.
//!
//! ```no_run
//! use memmod::MemoryModule;
//!
//! let image = std::fs::read("payload.dll").unwrap();
//!
//! let mut module = MemoryModule::new();
//! module.load(&image).unwrap();
//!
//! let answer = module.get_proc_address("answer");
//! assert!(answer.is_some());
//! ```

mod arch;
mod arena;
mod pe_executor;
mod pe_mapper;
mod pe_parser;

pub mod errors;
pub mod exports;
pub mod module;

pub use errors::{AppError, PeError};
pub use exports::ExportInfo;
pub use module::MemoryModule;
