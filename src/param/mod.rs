//! Solver parameter objects
//!
//! `SolverParameter` is the per-session configuration the interpreter
//! mutates with `solver_param ...` commands. It is exchanged with the host in
//! two forms: the protobuf binary encoding, derived with `prost`, and a
//! human-readable text format ([`text`]). Scalars are proto2 `optional`
//! fields, so a decoded message re-encodes to the same bytes and unset
//! fields report their schema default through the generated accessors.

pub mod text;

use std::fmt;

use thiserror::Error;

pub use prost::Message;
pub use text::TextFormat;

use text::{Entry, Printer};

/// Decode failures of either format
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParamError {
    #[error("invalid binary message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("line {line}: {message}")]
    Text { line: usize, message: String },

    #[error("text input is not valid UTF-8")]
    TextEncoding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SolverMode {
    Cpu = 0,
    Gpu = 1,
}

impl SolverMode {
    fn from_ident(value: &str) -> Option<Self> {
        match value {
            "CPU" | "0" => Some(SolverMode::Cpu),
            "GPU" | "1" => Some(SolverMode::Gpu),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SolverMode::Cpu => "CPU",
            SolverMode::Gpu => "GPU",
        }
    }
}

// =============================================================================
// SolverParameter
// =============================================================================

/// Solver configuration.
///
/// `solver_type` is deliberately left without a default: a session that never
/// received parameters cannot create a solver.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SolverParameter {
    #[prost(string, optional, tag = "1")]
    pub train_net: Option<String>,
    #[prost(string, repeated, tag = "2")]
    pub test_net: Vec<String>,
    #[prost(int32, repeated, packed = "false", tag = "3")]
    pub test_iter: Vec<i32>,
    #[prost(int32, optional, tag = "4", default = "0")]
    pub test_interval: Option<i32>,
    #[prost(float, optional, tag = "5")]
    pub base_lr: Option<f32>,
    #[prost(int32, optional, tag = "6")]
    pub display: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub max_iter: Option<i32>,
    #[prost(string, optional, tag = "8", default = "fixed")]
    pub lr_policy: Option<String>,
    #[prost(float, optional, tag = "9")]
    pub gamma: Option<f32>,
    #[prost(float, optional, tag = "10")]
    pub power: Option<f32>,
    #[prost(float, optional, tag = "11")]
    pub momentum: Option<f32>,
    #[prost(float, optional, tag = "12")]
    pub weight_decay: Option<f32>,
    #[prost(int32, optional, tag = "13")]
    pub stepsize: Option<i32>,
    #[prost(int32, optional, tag = "14", default = "0")]
    pub snapshot: Option<i32>,
    #[prost(string, optional, tag = "15")]
    pub snapshot_prefix: Option<String>,
    #[prost(enumeration = "SolverMode", optional, tag = "17", default = "Gpu")]
    pub solver_mode: Option<i32>,
    #[prost(int32, optional, tag = "18", default = "0")]
    pub device_id: Option<i32>,
    #[prost(int64, optional, tag = "20", default = "-1")]
    pub random_seed: Option<i64>,
    #[prost(string, optional, tag = "24")]
    pub net: Option<String>,
    #[prost(message, optional, tag = "25")]
    pub net_param: Option<NetParameter>,
    #[prost(string, optional, tag = "29", default = "L2")]
    pub regularization_type: Option<String>,
    #[prost(float, optional, tag = "31", default = "1e-8")]
    pub delta: Option<f32>,
    #[prost(int32, optional, tag = "33", default = "1")]
    pub average_loss: Option<i32>,
    #[prost(int32, repeated, packed = "false", tag = "34")]
    pub stepvalue: Vec<i32>,
    #[prost(float, optional, tag = "35", default = "-1")]
    pub clip_gradients: Option<f32>,
    #[prost(int32, optional, tag = "36", default = "1")]
    pub iter_size: Option<i32>,
    #[prost(float, optional, tag = "39", default = "0.999")]
    pub momentum2: Option<f32>,
    #[prost(string, optional, tag = "40")]
    pub solver_type: Option<String>,
}

impl TextFormat for SolverParameter {
    fn merge_entry(&mut self, entry: Entry) -> Result<(), ParamError> {
        match entry.name.as_str() {
            "train_net" => self.train_net = Some(entry.string()?),
            "test_net" => self.test_net.push(entry.string()?),
            "test_iter" => self.test_iter.push(entry.i32()?),
            "test_interval" => self.test_interval = Some(entry.i32()?),
            "base_lr" => self.base_lr = Some(entry.f32()?),
            "display" => self.display = Some(entry.i32()?),
            "max_iter" => self.max_iter = Some(entry.i32()?),
            "lr_policy" => self.lr_policy = Some(entry.string()?),
            "gamma" => self.gamma = Some(entry.f32()?),
            "power" => self.power = Some(entry.f32()?),
            "momentum" => self.momentum = Some(entry.f32()?),
            "weight_decay" => self.weight_decay = Some(entry.f32()?),
            "stepsize" => self.stepsize = Some(entry.i32()?),
            "snapshot" => self.snapshot = Some(entry.i32()?),
            "snapshot_prefix" => self.snapshot_prefix = Some(entry.string()?),
            "solver_mode" => {
                let ident = entry.ident()?;
                let mode = SolverMode::from_ident(ident).ok_or_else(|| ParamError::Text {
                    line: entry.line,
                    message: format!("solver_mode: unknown value '{}'", ident),
                })?;
                self.set_solver_mode(mode);
            }
            "device_id" => self.device_id = Some(entry.i32()?),
            "random_seed" => self.random_seed = Some(entry.i64()?),
            "net" => self.net = Some(entry.string()?),
            "net_param" => entry.merge_message(self.net_param.get_or_insert_with(NetParameter::default))?,
            "regularization_type" => self.regularization_type = Some(entry.string()?),
            "delta" => self.delta = Some(entry.f32()?),
            "average_loss" => self.average_loss = Some(entry.i32()?),
            "stepvalue" => self.stepvalue.push(entry.i32()?),
            "clip_gradients" => self.clip_gradients = Some(entry.f32()?),
            "iter_size" => self.iter_size = Some(entry.i32()?),
            "momentum2" => self.momentum2 = Some(entry.f32()?),
            "type" => self.solver_type = Some(entry.string()?),
            _ => return Err(entry.unknown("SolverParameter")),
        }
        Ok(())
    }

    fn print(&self, out: &mut Printer) {
        if let Some(v) = &self.train_net {
            out.string("train_net", v);
        }
        for v in &self.test_net {
            out.string("test_net", v);
        }
        for v in &self.test_iter {
            out.scalar("test_iter", v);
        }
        if let Some(v) = self.test_interval {
            out.scalar("test_interval", v);
        }
        if let Some(v) = self.base_lr {
            out.scalar("base_lr", v);
        }
        if let Some(v) = self.display {
            out.scalar("display", v);
        }
        if let Some(v) = self.max_iter {
            out.scalar("max_iter", v);
        }
        if let Some(v) = &self.lr_policy {
            out.string("lr_policy", v);
        }
        if let Some(v) = self.gamma {
            out.scalar("gamma", v);
        }
        if let Some(v) = self.power {
            out.scalar("power", v);
        }
        if let Some(v) = self.momentum {
            out.scalar("momentum", v);
        }
        if let Some(v) = self.weight_decay {
            out.scalar("weight_decay", v);
        }
        if let Some(v) = self.stepsize {
            out.scalar("stepsize", v);
        }
        if let Some(v) = self.snapshot {
            out.scalar("snapshot", v);
        }
        if let Some(v) = &self.snapshot_prefix {
            out.string("snapshot_prefix", v);
        }
        if let Some(v) = self.solver_mode {
            // Values outside the enum came from a binary payload; print the number.
            match SolverMode::from_i32(v) {
                Some(mode) => out.scalar("solver_mode", mode.name()),
                None => out.scalar("solver_mode", v),
            }
        }
        if let Some(v) = self.device_id {
            out.scalar("device_id", v);
        }
        if let Some(v) = self.random_seed {
            out.scalar("random_seed", v);
        }
        if let Some(v) = &self.net {
            out.string("net", v);
        }
        if let Some(v) = &self.net_param {
            out.message("net_param", v);
        }
        if let Some(v) = &self.regularization_type {
            out.string("regularization_type", v);
        }
        if let Some(v) = self.delta {
            out.scalar("delta", v);
        }
        if let Some(v) = self.average_loss {
            out.scalar("average_loss", v);
        }
        for v in &self.stepvalue {
            out.scalar("stepvalue", v);
        }
        if let Some(v) = self.clip_gradients {
            out.scalar("clip_gradients", v);
        }
        if let Some(v) = self.iter_size {
            out.scalar("iter_size", v);
        }
        if let Some(v) = self.momentum2 {
            out.scalar("momentum2", v);
        }
        if let Some(v) = &self.solver_type {
            out.string("type", v);
        }
    }
}

impl fmt::Display for SolverParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

// =============================================================================
// NetParameter / LayerParameter
// =============================================================================

/// Network topology: an ordered list of layers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NetParameter {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "100")]
    pub layer: Vec<LayerParameter>,
}

impl TextFormat for NetParameter {
    fn merge_entry(&mut self, entry: Entry) -> Result<(), ParamError> {
        match entry.name.as_str() {
            "name" => self.name = Some(entry.string()?),
            "layer" => self.layer.push(entry.message()?),
            _ => return Err(entry.unknown("NetParameter")),
        }
        Ok(())
    }

    fn print(&self, out: &mut Printer) {
        if let Some(v) = &self.name {
            out.string("name", v);
        }
        for layer in &self.layer {
            out.message("layer", layer);
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LayerParameter {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub layer_type: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub bottom: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub top: Vec<String>,
    #[prost(message, optional, tag = "117")]
    pub inner_product_param: Option<InnerProductParameter>,
    #[prost(message, optional, tag = "119")]
    pub memory_data_param: Option<MemoryDataParameter>,
}

impl TextFormat for LayerParameter {
    fn merge_entry(&mut self, entry: Entry) -> Result<(), ParamError> {
        match entry.name.as_str() {
            "name" => self.name = Some(entry.string()?),
            "type" => self.layer_type = Some(entry.string()?),
            "bottom" => self.bottom.push(entry.string()?),
            "top" => self.top.push(entry.string()?),
            "inner_product_param" => {
                entry.merge_message(self.inner_product_param.get_or_insert_with(Default::default))?
            }
            "memory_data_param" => {
                entry.merge_message(self.memory_data_param.get_or_insert_with(Default::default))?
            }
            _ => return Err(entry.unknown("LayerParameter")),
        }
        Ok(())
    }

    fn print(&self, out: &mut Printer) {
        if let Some(v) = &self.name {
            out.string("name", v);
        }
        if let Some(v) = &self.layer_type {
            out.string("type", v);
        }
        for v in &self.bottom {
            out.string("bottom", v);
        }
        for v in &self.top {
            out.string("top", v);
        }
        if let Some(v) = &self.inner_product_param {
            out.message("inner_product_param", v);
        }
        if let Some(v) = &self.memory_data_param {
            out.message("memory_data_param", v);
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InnerProductParameter {
    #[prost(uint32, optional, tag = "1")]
    pub num_output: Option<u32>,
    #[prost(bool, optional, tag = "2", default = "true")]
    pub bias_term: Option<bool>,
}

impl TextFormat for InnerProductParameter {
    fn merge_entry(&mut self, entry: Entry) -> Result<(), ParamError> {
        match entry.name.as_str() {
            "num_output" => self.num_output = Some(entry.u32()?),
            "bias_term" => self.bias_term = Some(entry.bool()?),
            _ => return Err(entry.unknown("InnerProductParameter")),
        }
        Ok(())
    }

    fn print(&self, out: &mut Printer) {
        if let Some(v) = self.num_output {
            out.scalar("num_output", v);
        }
        if let Some(v) = self.bias_term {
            out.scalar("bias_term", v);
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MemoryDataParameter {
    #[prost(uint32, optional, tag = "1")]
    pub batch_size: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channels: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub height: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub width: Option<u32>,
}

impl MemoryDataParameter {
    /// `[channels, height, width]`, unset dims count as 1.
    pub fn sample_dims(&self) -> [usize; 3] {
        [self.channels, self.height, self.width].map(|d| d.unwrap_or(1) as usize)
    }

    /// Values per sample, or `None` if `channels * height * width` overflows.
    pub fn sample_len(&self) -> Option<usize> {
        self.sample_dims().iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

impl TextFormat for MemoryDataParameter {
    fn merge_entry(&mut self, entry: Entry) -> Result<(), ParamError> {
        match entry.name.as_str() {
            "batch_size" => self.batch_size = Some(entry.u32()?),
            "channels" => self.channels = Some(entry.u32()?),
            "height" => self.height = Some(entry.u32()?),
            "width" => self.width = Some(entry.u32()?),
            _ => return Err(entry.unknown("MemoryDataParameter")),
        }
        Ok(())
    }

    fn print(&self, out: &mut Printer) {
        if let Some(v) = self.batch_size {
            out.scalar("batch_size", v);
        }
        if let Some(v) = self.channels {
            out.scalar("channels", v);
        }
        if let Some(v) = self.height {
            out.scalar("height", v);
        }
        if let Some(v) = self.width {
            out.scalar("width", v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOLVER_TEXT: &str = r#"
        base_lr: 0.01
        momentum: 0.9
        lr_policy: "step"
        stepsize: 100
        gamma: 0.5
        max_iter: 1000
        display: 10
        solver_mode: CPU
        device_id: 2
        random_seed: -7
        stepvalue: 10
        stepvalue: 20
        type: "SGD"
        net_param {
          name: "linear"
          layer {
            name: "data"
            type: "MemoryData"
            top: "data"
            top: "label"
            memory_data_param { batch_size: 4 channels: 2 }
          }
          layer {
            name: "ip"
            type: "InnerProduct"
            bottom: "data"
            top: "ip"
            inner_product_param { num_output: 1 }
          }
        }
    "#;

    #[test]
    fn test_parse_text() {
        let param = SolverParameter::from_text(SOLVER_TEXT).unwrap();
        assert_eq!(param.base_lr, Some(0.01));
        assert_eq!(param.lr_policy(), "step");
        assert_eq!(param.solver_mode(), SolverMode::Cpu);
        assert_eq!(param.random_seed(), -7);
        assert_eq!(param.stepvalue, vec![10, 20]);
        assert_eq!(param.solver_type(), "SGD");

        let net = param.net_param.as_ref().unwrap();
        assert_eq!(net.layer.len(), 2);
        assert_eq!(net.layer[0].top, vec!["data".to_string(), "label".to_string()]);
        let mem = net.layer[0].memory_data_param.as_ref().unwrap();
        assert_eq!(mem.batch_size(), 4);
        assert_eq!(mem.sample_len(), Some(2));
        assert_eq!(net.layer[1].inner_product_param.as_ref().unwrap().num_output(), 1);
    }

    #[test]
    fn test_binary_roundtrip_is_byte_identical() {
        let param = SolverParameter::from_text(SOLVER_TEXT).unwrap();
        let bytes = param.encode_to_vec();
        assert_eq!(bytes.len(), param.encoded_len());

        let decoded = SolverParameter::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, param);
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn test_wire_layout() {
        let param = SolverParameter::from_text("base_lr: 0.5 stepvalue: 1 stepvalue: 2 solver_mode: CPU").unwrap();
        let mut expected = vec![0x2D];
        expected.extend_from_slice(&0.5f32.to_le_bytes());
        // solver_mode (17) as varint, stepvalue (34) unpacked
        expected.extend_from_slice(&[0x88, 0x01, 0x00, 0x90, 0x02, 0x01, 0x90, 0x02, 0x02]);
        assert_eq!(param.encode_to_vec(), expected);
    }

    #[test]
    fn test_text_roundtrip() {
        let param = SolverParameter::from_text(SOLVER_TEXT).unwrap();
        let printed = param.to_text();
        let reparsed = SolverParameter::from_text(&printed).unwrap();
        assert_eq!(reparsed, param);
    }

    #[test]
    fn test_defaults() {
        let param = SolverParameter::default();
        assert_eq!(param.solver_type(), "");
        assert_eq!(param.iter_size(), 1);
        assert_eq!(param.average_loss(), 1);
        assert_eq!(param.regularization_type(), "L2");
        assert_eq!(param.clip_gradients(), -1.0);
        assert_eq!(param.lr_policy(), "fixed");
        assert_eq!(param.device_id(), 0);
        assert_eq!(param.solver_mode(), SolverMode::Gpu);
        assert!(param.encode_to_vec().is_empty());
    }

    #[test]
    fn test_unknown_binary_fields_skipped() {
        let mut bytes = SolverParameter {
            base_lr: Some(0.1),
            ..Default::default()
        }
        .encode_to_vec();
        // field 999, varint 3
        bytes.extend_from_slice(&[0xB8, 0x3E, 0x03]);

        let param = SolverParameter::decode(bytes.as_slice()).unwrap();
        assert_eq!(param.base_lr, Some(0.1));
        assert_eq!(param.encoded_len(), 5);
    }

    #[test]
    fn test_unknown_enum_value_kept() {
        // solver_mode (17) = 7
        let bytes = [0x88, 0x01, 0x07];
        let param = SolverParameter::decode(&bytes[..]).unwrap();
        assert_eq!(param.solver_mode, Some(7));
        assert_eq!(param.solver_mode(), SolverMode::Gpu);
        assert_eq!(param.encode_to_vec(), bytes.to_vec());
        assert_eq!(param.to_text(), "solver_mode: 7\n");
    }

    #[test]
    fn test_unknown_text_field_rejected() {
        let err = SolverParameter::from_text("base_lr: 0.1\nbogus: 3").unwrap_err();
        assert_eq!(
            err,
            ParamError::Text {
                line: 2,
                message: "message SolverParameter has no field named \"bogus\"".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_binary_rejected() {
        // base_lr (5) sent as varint
        let err = SolverParameter::decode(&[0x28u8, 0x01][..]).unwrap_err();
        assert!(matches!(ParamError::from(err), ParamError::Decode(_)));

        // length-delimited net_param running past the end
        assert!(SolverParameter::decode(&[0xCAu8, 0x01, 0x10, 0x0A][..]).is_err());
    }

    #[test]
    fn test_sample_len_overflow() {
        let mem = MemoryDataParameter {
            batch_size: Some(1),
            channels: Some(4_194_304),
            height: Some(4_194_304),
            width: Some(4_194_304),
        };
        assert_eq!(mem.sample_len(), None);
        assert_eq!(MemoryDataParameter::default().sample_len(), Some(1));
    }
}
