//! Command executor
//!
//! Runs a parsed [`Command`] against a [`Session`], reading its input from
//! and writing its output to the call's [`Buffer`].

use std::os::raw::c_int;

use crate::buffer::{Buffer, Record};
use crate::engine::SolverRegistry;
use crate::error::{BufferError, CommandError};
use crate::param::{Message, ParamError, SolverParameter, TextFormat};
use crate::runtime;
use crate::session::Session;

use super::parser::{BlobView, Command, LayerOp, ParamOp, SolverOp};

/// Record read by `solver layer <name> reset`, in native struct layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBatch {
    pub data: *mut f32,
    pub label: *mut f32,
    pub n: c_int,
}

// SAFETY: two raw pointers and an int; every bit pattern is valid.
unsafe impl Record for MemoryBatch {}

/// Execute one command.
pub fn execute(session: &mut Session, command: &Command, buffer: &mut Buffer<'_>) -> Result<(), CommandError> {
    match command {
        Command::SolverParam(op) => execute_param_op(&mut session.parameters, *op, buffer),
        Command::Solver(op) => execute_solver_op(session, op, buffer),
    }
}

// =============================================================================
// solver_param
// =============================================================================

fn execute_param_op(
    parameters: &mut SolverParameter,
    op: ParamOp,
    buffer: &mut Buffer<'_>,
) -> Result<(), CommandError> {
    match op {
        ParamOp::SetArray => {
            *parameters = SolverParameter::decode(buffer.as_bytes()).map_err(ParamError::from)?;
            log::debug!("Solver parameters set from {} bytes", buffer.len());
        }
        ParamOp::SetString => {
            let text = std::str::from_utf8(buffer.as_bytes()).map_err(|_| ParamError::TextEncoding)?;
            *parameters = SolverParameter::from_text(text)?;
            log::debug!("Solver parameters set from text:\n{}", parameters);
        }
        ParamOp::GetByteSize => {
            let size = c_int::try_from(parameters.encoded_len())
                .map_err(|_| ParamError::Malformed("encoded size exceeds int range".to_string()))?;
            buffer.write_int(size)?;
        }
        ParamOp::Get => {
            let needed = parameters.encoded_len();
            let actual = buffer.len();
            // Writes nothing unless the whole message fits.
            let mut out = buffer.as_bytes_mut();
            parameters
                .encode(&mut out)
                .map_err(|_| BufferError::TooSmall { needed, actual })?;
        }
    }
    Ok(())
}

// =============================================================================
// solver
// =============================================================================

fn execute_solver_op(session: &mut Session, op: &SolverOp, buffer: &mut Buffer<'_>) -> Result<(), CommandError> {
    match op {
        SolverOp::AutoGpu => {
            auto_gpu(&mut session.parameters, runtime::devices());
            Ok(())
        }
        SolverOp::Create => {
            let solver = SolverRegistry::create(&session.parameters)?;
            if session.solver.replace(solver).is_some() {
                log::info!("Replaced existing solver");
            }
            Ok(())
        }
        SolverOp::Step => {
            let solver = session.solver_mut()?;
            let iters = buffer.try_read_int()?;
            if iters < 0 {
                return Err(CommandError::InvalidIterations(iters));
            }
            solver.step(iters)?;
            Ok(())
        }
        SolverOp::Layer { name, op } => execute_layer_op(session, name, *op, buffer),
        SolverOp::Blob { name, view } => execute_blob_view(session, name, *view, buffer),
    }
}

/// Point the parameters at the first selected device, if any.
fn auto_gpu(parameters: &mut SolverParameter, devices: &[i32]) {
    if let Some(&device) = devices.first() {
        parameters.device_id = Some(device);
        log::debug!("device_id set to {}", device);
    }
}

fn execute_layer_op(session: &mut Session, name: &str, op: LayerOp, buffer: &mut Buffer<'_>) -> Result<(), CommandError> {
    let net = session.solver_mut()?.net_mut();
    let layer = net
        .layer_by_name_mut(name)
        .ok_or_else(|| CommandError::UnknownLayer(name.to_string()))?;

    match op {
        LayerOp::Reset => {
            let kind = layer.type_name();
            let memory = layer.as_memory_data_mut().ok_or_else(|| CommandError::NotMemoryData {
                name: name.to_string(),
                kind,
            })?;
            let batch: MemoryBatch = buffer.read_record()?;
            // SAFETY: the host owns the arrays behind `batch` and keeps them
            // alive while the solver may forward through this layer.
            unsafe { memory.reset(batch.data, batch.label, batch.n)? };
        }
    }
    Ok(())
}

fn execute_blob_view(
    session: &mut Session,
    name: &str,
    view: BlobView,
    buffer: &mut Buffer<'_>,
) -> Result<(), CommandError> {
    let blob = session
        .solver_mut()?
        .net_mut()
        .blob_by_name_mut(name)
        .ok_or_else(|| CommandError::UnknownBlob(name.to_string()))?;

    match view {
        BlobView::MutableData => buffer.write_mut_ptr(blob.mutable_cpu_data())?,
        BlobView::MutableDiff => buffer.write_mut_ptr(blob.mutable_cpu_diff())?,
        BlobView::Data => buffer.write_ptr(blob.cpu_data())?,
        BlobView::Diff => buffer.write_ptr(blob.cpu_diff())?,
    }
    Ok(())
}
