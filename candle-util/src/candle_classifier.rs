use crate::candle_aux_layers::*;
use crate::candle_data_loader::DataLoader;
use crate::candle_model_traits::*;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// Feed-forward classifier: fc layers with ReLU, then a linear layer
/// to class logits
pub struct MlpClassifier {
    n_features: usize,
    n_classes: usize,
    fc: StackLayers<Linear>,
    out: Linear,
}

impl Module for MlpClassifier {
    fn forward(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.out.forward(&self.fc.forward(x_nd)?)
    }
}

impl ClassifierModuleT for MlpClassifier {
    fn logits(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.forward(x_nd)
    }

    fn num_classes(&self) -> usize {
        self.n_classes
    }
}

impl MlpClassifier {
    /// Variables: `nn.cls.fc.{}.weight`, `nn.cls.out.weight`
    pub fn new(n_features: usize, layers: &[usize], n_classes: usize, vs: VarBuilder) -> Result<Self> {
        let (fc, prev_dim) = fc_stack(n_features, layers, Activation::Relu, vs.pp("nn.cls"))?;
        let out = candle_nn::linear(prev_dim, n_classes, vs.pp("nn.cls.out"))?;
        Ok(Self {
            n_features,
            n_classes,
            fc,
            out,
        })
    }

    pub fn dim_obs(&self) -> usize {
        self.n_features
    }

    /// The hidden stack, shared by runners that pretrain it
    pub fn hidden_layers(&self) -> &StackLayers<Linear> {
        &self.fc
    }
}

/// Number of rows whose arg-max logit equals the label
pub fn count_correct(logits_nk: &Tensor, labels_n: &Tensor) -> Result<usize> {
    let hits = logits_nk
        .argmax(1)?
        .eq(&labels_n.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits.round() as usize)
}

/// Fraction of correctly classified samples over every minibatch of
/// `data`; `logits_fn` maps inputs to class logits
pub fn accuracy<DataL, LogitFn>(
    data: &DataL,
    logits_fn: &LogitFn,
    device: &Device,
) -> anyhow::Result<f32>
where
    DataL: DataLoader,
    LogitFn: Fn(&Tensor) -> Result<Tensor>,
{
    let full = data.full_data(device)?;
    let labels = full
        .labels
        .as_ref()
        .ok_or(anyhow::anyhow!("accuracy needs labelled data"))?;
    let logits = logits_fn(&full.input)?;
    let correct = count_correct(&logits, labels)?;
    Ok(correct as f32 / data.num_samples().max(1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn posterior_rows_sum_to_one() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vs = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let cls = MlpClassifier::new(7, &[5], 4, vs)?;
        let x = Tensor::randn(0f32, 3f32, (9, 7), &dev)?;
        let q = cls.predict_proba(&x)?;
        assert_eq!(q.dims(), &[9, 4]);
        for row in q.sum(1)?.to_vec1::<f32>()? {
            approx::assert_abs_diff_eq!(row, 1., epsilon = 1e-5);
        }
        assert!(q.min_all()?.to_scalar::<f32>()? >= 0.);
        Ok(())
    }

    #[test]
    fn count_correct_matches_argmax() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 1.], [0., 3.], [5., -1.]], &dev)?;
        let labels = Tensor::new(&[0u32, 1, 1], &dev)?;
        assert_eq!(count_correct(&logits, &labels)?, 2);
        Ok(())
    }
}
