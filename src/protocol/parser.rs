//! Recursive-descent parser from tokens to a typed [`Command`]

use crate::error::CommandError;

use super::cursor::Cursor;
use super::tokens::*;

/// A fully parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SolverParam(ParamOp),
    Solver(SolverOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOp {
    /// Replace parameters from the buffer's bytes (binary format)
    SetArray,
    /// Replace parameters from the buffer's bytes (text format)
    SetString,
    /// Write the binary size into the buffer as an int
    GetByteSize,
    /// Write the binary form into the buffer
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverOp {
    AutoGpu,
    Create,
    Step,
    Layer { name: String, op: LayerOp },
    Blob { name: String, view: BlobView },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOp {
    Reset,
}

/// Which buffer of a blob to hand back, and whether it may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobView {
    MutableData,
    MutableDiff,
    Data,
    Diff,
}

impl BlobView {
    pub fn is_mutable(self) -> bool {
        matches!(self, BlobView::MutableData | BlobView::MutableDiff)
    }
}

/// Parse one command string.
///
/// Tokens left over after a complete command are ignored.
pub fn parse(command: &str) -> Result<Command, CommandError> {
    let mut cursor = Cursor::new(command);

    let parsed = if cursor.match_token(SOLVER_PARAM)? {
        Command::SolverParam(parse_param_op(&mut cursor)?)
    } else if cursor.match_token(SOLVER)? {
        Command::Solver(parse_solver_op(&mut cursor)?)
    } else {
        return Err(unknown(&cursor));
    };

    if !cursor.is_empty() {
        log::debug!("Ignoring trailing tokens {:?} in '{}'", cursor.remaining(), command);
    }
    Ok(parsed)
}

fn unknown(cursor: &Cursor<'_>) -> CommandError {
    match cursor.peek() {
        Ok(token) => CommandError::UnknownCommand(token.to_string()),
        Err(e) => e,
    }
}

fn parse_param_op(cursor: &mut Cursor<'_>) -> Result<ParamOp, CommandError> {
    if cursor.match_token(SET_ARRAY)? {
        Ok(ParamOp::SetArray)
    } else if cursor.match_token(SET_STRING)? {
        Ok(ParamOp::SetString)
    } else if cursor.match_token(GET_BYTESIZE)? {
        Ok(ParamOp::GetByteSize)
    } else if cursor.match_token(GET)? {
        Ok(ParamOp::Get)
    } else {
        Err(unknown(cursor))
    }
}

fn parse_solver_op(cursor: &mut Cursor<'_>) -> Result<SolverOp, CommandError> {
    if cursor.match_token(AUTO_GPU)? {
        Ok(SolverOp::AutoGpu)
    } else if cursor.match_token(CREATE)? {
        Ok(SolverOp::Create)
    } else if cursor.match_token(STEP)? {
        Ok(SolverOp::Step)
    } else if cursor.match_token(LAYER)? {
        let name = cursor.next_token()?.to_string();
        let op = parse_layer_op(cursor)?;
        Ok(SolverOp::Layer { name, op })
    } else if cursor.match_token(BLOB)? {
        let name = cursor.next_token()?.to_string();
        let view = parse_blob_view(cursor)?;
        Ok(SolverOp::Blob { name, view })
    } else {
        Err(unknown(cursor))
    }
}

fn parse_layer_op(cursor: &mut Cursor<'_>) -> Result<LayerOp, CommandError> {
    if cursor.match_token(RESET)? {
        Ok(LayerOp::Reset)
    } else {
        Err(unknown(cursor))
    }
}

fn parse_blob_view(cursor: &mut Cursor<'_>) -> Result<BlobView, CommandError> {
    if cursor.match_token(MUTABLE_DATA)? {
        Ok(BlobView::MutableData)
    } else if cursor.match_token(MUTABLE_DIFF)? {
        Ok(BlobView::MutableDiff)
    } else if cursor.match_token(DATA)? {
        Ok(BlobView::Data)
    } else if cursor.match_token(DIFF)? {
        Ok(BlobView::Diff)
    } else {
        Err(unknown(cursor))
    }
}
