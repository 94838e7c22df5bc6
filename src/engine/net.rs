//! Layer graph built from a `NetParameter`

use std::collections::HashMap;

use crate::param::{NetParameter, SolverParameter, TextFormat};

use super::{Blob, EngineError, Layer};

/// A feed-forward network: layers in definition order over a shared blob pool.
#[derive(Debug)]
pub struct Net {
    name: String,
    layers: Vec<Layer>,
    blobs: Vec<Blob>,
    layer_names: HashMap<String, usize>,
    blob_names: HashMap<String, usize>,
}

impl Net {
    /// Resolve the training network named by solver parameters.
    ///
    /// Inline `net_param` wins over a `net` file, which wins over `train_net`.
    pub fn from_solver_param(param: &SolverParameter) -> Result<Self, EngineError> {
        if let Some(net_param) = &param.net_param {
            return Self::from_param(net_param);
        }
        let path = param
            .net
            .as_deref()
            .or(param.train_net.as_deref())
            .ok_or(EngineError::NoNetwork)?;

        log::info!("Creating training net from net file: {}", path);
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_param(&NetParameter::from_text(&text)?)
    }

    pub fn from_param(param: &NetParameter) -> Result<Self, EngineError> {
        let mut net = Self {
            name: param.name.clone().unwrap_or_default(),
            layers: Vec::with_capacity(param.layer.len()),
            blobs: Vec::new(),
            layer_names: HashMap::new(),
            blob_names: HashMap::new(),
        };

        for layer_param in &param.layer {
            let layer_name = layer_param.name();
            if net.layer_names.contains_key(layer_name) {
                return Err(EngineError::InvalidNet(format!("duplicate layer name '{}'", layer_name)));
            }

            let mut bottoms = Vec::with_capacity(layer_param.bottom.len());
            for bottom in &layer_param.bottom {
                let idx = net.blob_names.get(bottom).copied().ok_or_else(|| {
                    EngineError::InvalidNet(format!("layer '{}': unknown bottom blob '{}'", layer_name, bottom))
                })?;
                bottoms.push(idx);
            }
            let bottom_shapes: Vec<Vec<usize>> = bottoms.iter().map(|&i| net.blobs[i].shape().to_vec()).collect();

            // Tops either name a fresh blob or, for layers that compute in
            // place, one of this layer's bottoms.
            let in_place = layer_param.layer_type() == "ReLU";
            let mut tops = Vec::with_capacity(layer_param.top.len());
            let mut fresh: Vec<(String, usize)> = Vec::new();
            for (i, top) in layer_param.top.iter().enumerate() {
                if layer_param.top[..i].contains(top) {
                    return Err(EngineError::InvalidNet(format!(
                        "layer '{}': top blob '{}' listed more than once",
                        layer_name, top
                    )));
                }
                match net.blob_names.get(top) {
                    Some(&idx) if bottoms.contains(&idx) && in_place => tops.push(idx),
                    Some(&idx) if bottoms.contains(&idx) => {
                        return Err(EngineError::InvalidNet(format!(
                            "layer '{}': {} cannot compute in place on '{}'",
                            layer_name,
                            layer_param.layer_type(),
                            top
                        )))
                    }
                    Some(_) => {
                        return Err(EngineError::InvalidNet(format!(
                            "top blob '{}' produced by multiple sources",
                            top
                        )))
                    }
                    None => {
                        let idx = net.blobs.len() + fresh.len();
                        fresh.push((top.clone(), idx));
                        tops.push(idx);
                    }
                }
            }

            let (layer, top_shapes) = Layer::setup(layer_param, bottoms, tops, &bottom_shapes)?;
            for (name, idx) in fresh {
                let position = layer.tops().iter().position(|&t| t == idx).unwrap_or(0);
                net.blobs.push(Blob::new(name.clone(), top_shapes[position].clone())?);
                net.blob_names.insert(name, idx);
            }

            log::debug!(
                "Created layer {} ({}) -> {:?}",
                layer.name(),
                layer.type_name(),
                top_shapes
            );
            net.layer_names.insert(layer.name().to_string(), net.layers.len());
            net.layers.push(layer);
        }

        log::info!(
            "Network '{}' initialized: {} layers, {} blobs",
            net.name,
            net.layers.len(),
            net.blobs.len()
        );
        Ok(net)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&Layer> {
        self.layer_names.get(name).map(|&i| &self.layers[i])
    }

    pub fn layer_by_name_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layer_names.get(name).map(|&i| &mut self.layers[i])
    }

    pub fn blob_by_name(&self, name: &str) -> Option<&Blob> {
        self.blob_names.get(name).map(|&i| &self.blobs[i])
    }

    pub fn blob_by_name_mut(&mut self, name: &str) -> Option<&mut Blob> {
        self.blob_names.get(name).map(|&i| &mut self.blobs[i])
    }

    /// Run every layer forward; returns the summed loss.
    pub fn forward(&mut self) -> Result<f32, EngineError> {
        let mut loss = 0.0;
        for layer in &mut self.layers {
            loss += layer.forward(&mut self.blobs)?;
        }
        Ok(loss)
    }

    /// Run every layer backward, seeding loss tops with unit gradient.
    pub fn backward(&mut self) {
        for blob in &mut self.blobs {
            blob.zero_diff();
        }
        for layer in &self.layers {
            if layer.is_loss() {
                for &top in layer.tops() {
                    self.blobs[top].diff_mut().iter_mut().for_each(|d| *d = 1.0);
                }
            }
        }
        for layer in self.layers.iter_mut().rev() {
            layer.backward(&mut self.blobs);
        }
    }

    pub fn forward_backward(&mut self) -> Result<f32, EngineError> {
        let loss = self.forward()?;
        self.backward();
        Ok(loss)
    }

    pub fn clear_param_diffs(&mut self) {
        for blob in self.learnable_params_mut() {
            blob.zero_diff();
        }
    }

    pub fn learnable_params(&self) -> impl Iterator<Item = &Blob> {
        self.layers.iter().flat_map(|l| l.params().iter())
    }

    pub fn learnable_params_mut(&mut self) -> impl Iterator<Item = &mut Blob> {
        self.layers.iter_mut().flat_map(|l| l.params_mut().iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LINEAR_NET: &str = r#"
        name: "linear"
        layer {
          name: "data" type: "MemoryData" top: "data" top: "label"
          memory_data_param { batch_size: 2 channels: 2 }
        }
        layer {
          name: "ip" type: "InnerProduct" bottom: "data" top: "ip"
          inner_product_param { num_output: 1 }
        }
        layer { name: "relu" type: "ReLU" bottom: "ip" top: "ip" }
        layer { name: "loss" type: "EuclideanLoss" bottom: "ip" bottom: "label" top: "loss" }
    "#;

    #[test]
    fn test_build_and_lookup() {
        let net = Net::from_param(&NetParameter::from_text(LINEAR_NET).unwrap()).unwrap();
        assert_eq!(net.name(), "linear");
        assert_eq!(net.layers().len(), 4);

        let names: Vec<&str> = net.blobs().iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["data", "label", "ip", "loss"]);
        assert_eq!(net.blob_by_name("data").unwrap().shape(), &[2, 2, 1, 1]);
        assert_eq!(net.blob_by_name("ip").unwrap().shape(), &[2, 1]);
        assert!(net.blob_by_name("nonexistent_blob").is_none());
        assert_eq!(net.layer_by_name("relu").unwrap().type_name(), "ReLU");
        assert!(net.layer_by_name("missing").is_none());
        assert_eq!(net.learnable_params().count(), 2);
    }

    #[test]
    fn test_forward_requires_reset() {
        let mut net = Net::from_param(&NetParameter::from_text(LINEAR_NET).unwrap()).unwrap();
        assert!(matches!(net.forward(), Err(EngineError::MemoryDataNotReset(name)) if name == "data"));
    }

    #[test]
    fn test_forward_backward_with_data() {
        let mut net = Net::from_param(&NetParameter::from_text(LINEAR_NET).unwrap()).unwrap();
        let data = [1.0f32, 2.0, 3.0, 4.0];
        let labels = [1.0f32, 2.0];
        unsafe {
            net.layer_by_name_mut("data")
                .unwrap()
                .as_memory_data_mut()
                .unwrap()
                .reset(data.as_ptr(), labels.as_ptr(), 2)
                .unwrap();
        }

        // Zero weights: prediction 0, loss = (1 + 4) / 2 / 2
        let loss = net.forward_backward().unwrap();
        assert_eq!(loss, 1.25);
        // ReLU at zero blocks the gradient.
        assert!(net.learnable_params().all(|p| p.diff().iter().all(|&d| d == 0.0)));
    }

    #[test]
    fn test_invalid_graphs() {
        let unknown_bottom = r#"layer { name: "relu" type: "ReLU" bottom: "x" top: "y" }"#;
        let err = Net::from_param(&NetParameter::from_text(unknown_bottom).unwrap()).unwrap_err();
        assert!(err.to_string().contains("unknown bottom blob 'x'"), "{}", err);

        let duplicate = r#"
            layer { name: "d" type: "MemoryData" top: "a" top: "b" memory_data_param { batch_size: 1 } }
            layer { name: "d" type: "ReLU" bottom: "a" top: "c" }
        "#;
        let err = Net::from_param(&NetParameter::from_text(duplicate).unwrap()).unwrap_err();
        assert!(err.to_string().contains("duplicate layer name"), "{}", err);
    }

    #[test]
    fn test_in_place_only_for_relu() {
        let in_place_ip = r#"
            layer { name: "data" type: "MemoryData" top: "data" top: "label" memory_data_param { batch_size: 1 channels: 2 } }
            layer { name: "ip" type: "InnerProduct" bottom: "data" top: "data" inner_product_param { num_output: 1 } }
        "#;
        let err = Net::from_param(&NetParameter::from_text(in_place_ip).unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidNet(_)));
        assert!(err.to_string().contains("InnerProduct cannot compute in place on 'data'"), "{}", err);

        let in_place_loss = r#"
            layer { name: "data" type: "MemoryData" top: "data" top: "label" memory_data_param { batch_size: 1 } }
            layer { name: "loss" type: "EuclideanLoss" bottom: "data" bottom: "label" top: "label" }
        "#;
        assert!(Net::from_param(&NetParameter::from_text(in_place_loss).unwrap()).is_err());
    }

    #[test]
    fn test_repeated_top_rejected() {
        let repeated = r#"
            layer { name: "data" type: "MemoryData" top: "x" top: "x" memory_data_param { batch_size: 1 } }
        "#;
        let err = Net::from_param(&NetParameter::from_text(repeated).unwrap()).unwrap_err();
        assert!(err.to_string().contains("top blob 'x' listed more than once"), "{}", err);
    }

    #[test]
    fn test_oversized_input_rejected() {
        let huge = r#"
            layer {
              name: "data" type: "MemoryData" top: "data" top: "label"
              memory_data_param { batch_size: 1 channels: 4194304 height: 4194304 width: 4194304 }
            }
        "#;
        let err = Net::from_param(&NetParameter::from_text(huge).unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidNet(_)), "{}", err);
    }

    #[test]
    fn test_no_network_source() {
        let err = Net::from_solver_param(&SolverParameter::default()).unwrap_err();
        assert!(matches!(err, EngineError::NoNetwork));

        let param = SolverParameter {
            net: Some("/nonexistent/solvertray/net.prototxt".to_string()),
            ..Default::default()
        };
        assert!(matches!(Net::from_solver_param(&param), Err(EngineError::Io { .. })));
    }
}
