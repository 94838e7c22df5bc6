//! Command protocol
//!
//! Commands are short whitespace-separated token strings sent by the host:
//!
//! ```text
//! command   := "solver_param" param_op
//!            | "solver" solver_op
//! param_op  := "set_array" | "set_string" | "get_bytesize" | "get"
//! solver_op := "auto_gpu" | "create" | "step"
//!            | "layer" <name> "reset"
//!            | "blob" <name> ("mutable_data" | "mutable_diff" | "data" | "diff")
//! ```
//!
//! A command string is tokenized by [`cursor`], turned into a typed
//! [`Command`] by [`parser`] and run against a session by [`executor`].

pub mod cursor;
pub mod executor;
pub mod parser;

pub use cursor::{tokenize, Cursor};
pub use executor::{execute, MemoryBatch};
pub use parser::{parse, BlobView, Command, LayerOp, ParamOp, SolverOp};

/// Literal tokens of the grammar
pub mod tokens {
    // Families
    pub const SOLVER_PARAM: &str = "solver_param";
    pub const SOLVER: &str = "solver";

    // solver_param
    pub const SET_ARRAY: &str = "set_array";
    pub const SET_STRING: &str = "set_string";
    pub const GET_BYTESIZE: &str = "get_bytesize";
    pub const GET: &str = "get";

    // solver
    pub const AUTO_GPU: &str = "auto_gpu";
    pub const CREATE: &str = "create";
    pub const STEP: &str = "step";
    pub const LAYER: &str = "layer";
    pub const BLOB: &str = "blob";

    // solver layer <name>
    pub const RESET: &str = "reset";

    // solver blob <name>
    pub const MUTABLE_DATA: &str = "mutable_data";
    pub const MUTABLE_DIFF: &str = "mutable_diff";
    pub const DATA: &str = "data";
    pub const DIFF: &str = "diff";

    /// Token separators
    pub const DELIMITERS: [char; 2] = [' ', '\t'];
}
