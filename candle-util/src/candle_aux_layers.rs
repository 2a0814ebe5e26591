#![allow(dead_code)]

use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// build a stack of alternating `M` and `A` layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_prefix(input, self.len())
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    /// Evaluate only the first `num_layers` layers (with their activations)
    pub fn forward_prefix(&self, input: &Tensor, num_layers: usize) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self
            .module_layers
            .iter()
            .zip(self.activation_layers.iter())
            .take(num_layers)
        {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }

    /// Evaluate the `j`-th layer alone
    pub fn forward_layer(&self, input: &Tensor, j: usize) -> Result<Tensor> {
        match (self.module_layers.get(j), self.activation_layers.get(j)) {
            (Some(module), Some(Some(activation))) => activation.forward(&module.forward(input)?),
            (Some(module), Some(None)) => module.forward(input),
            _ => candle_core::bail!("layer {} out of {}", j, self.len()),
        }
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Fully connected stack `in_dim -> layers[0] -> ... -> layers[last]`
/// with the same activation after every layer
///
/// * `in_dim` - input dimension
/// * `layers` - hidden dimensions
/// * `activation` - activation after each layer
/// * `vs` - variables are named `{prefix}.fc.{j}.{weight,bias}`
///
/// Returns the stack and its output dimension
pub fn fc_stack(
    in_dim: usize,
    layers: &[usize],
    activation: Activation,
    vs: VarBuilder,
) -> Result<(StackLayers<Linear>, usize)> {
    let mut fc = StackLayers::<Linear>::new();
    let mut prev_dim = in_dim;
    for (j, &next_dim) in layers.iter().enumerate() {
        let _name = format!("fc.{}", j);
        fc.push_with_act(candle_nn::linear(prev_dim, next_dim, vs.pp(_name))?, activation);
        prev_dim = next_dim;
    }
    Ok((fc, prev_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn prefix_evaluation_composes() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vs = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let (fc, out_dim) = fc_stack(5, &[4, 3, 2], Activation::Relu, vs.pp("nn"))?;
        assert_eq!(out_dim, 2);
        assert_eq!(fc.len(), 3);

        let x = Tensor::randn(0f32, 1f32, (6, 5), &dev)?;
        let h1 = fc.forward_prefix(&x, 1)?;
        let h2 = fc.forward_layer(&h1, 1)?;
        let h3 = fc.forward_layer(&h2, 2)?;

        let full = fc.forward(&x)?;
        let diff = (full - &h3)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        assert!(fc.forward_layer(&h3, 3).is_err());
        Ok(())
    }
}
