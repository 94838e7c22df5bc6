//! solvertray: drive a training solver from a host process
//!
//! A host loads this library, calls `solvertray_init` once, creates sessions
//! and sends them short text commands paired with a raw memory buffer:
//!
//! ```text
//! solver_param set_string    <- buffer holds the solver text definition
//! solver create
//! solver layer data reset    <- buffer holds {data*, label*, n}
//! solver step                <- buffer holds the iteration count
//! solver blob ip data        -> buffer receives a pointer to the blob values
//! ```
//!
//! Every command answers with a single `bool`; failure detail goes to the
//! log callback registered at init.

pub mod buffer;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod param;
pub mod protocol;
pub mod runtime;
pub mod session;

pub use buffer::{Buffer, Record, INT_SENTINEL};
pub use error::{BufferError, CommandError};
pub use ffi::{solvertray_create, solvertray_destroy, solvertray_init, solvertray_send};
pub use param::{Message, SolverParameter, TextFormat};
pub use protocol::MemoryBatch;
pub use session::Session;
