use crate::lentil_common::*;

use candle_core::{DType, Module, Shape, Tensor};
use candle_nn::{Activation, AdamW, Linear, Optimizer, VarBuilder, VarMap};
use candle_util::candle_aux_layers::*;
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_decoder_mlp::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::binary_cross_entropy_const;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::*;
use candle_util::candle_noise::*;

pub const SSGAN_LAYERS: [usize; 2] = [256, 128];
pub const SSGAN_LATENT_DIM: usize = 50;

/// The validity head estimates the probability that a sample is
/// generated, so real samples are scored against 0
const REAL: f64 = 0.;
const FAKE: f64 = 1.;

/// Shared trunk with a class head and a validity head
pub struct Discriminator {
    n_classes: usize,
    fc: StackLayers<Linear>,
    class_head: Linear,
    validity_head: Linear,
}

impl Discriminator {
    /// Variables: `nn.dis.fc.*`, `nn.dis.class.*`, `nn.dis.valid.*`
    pub fn new(n_features: usize, layers: &[usize], n_classes: usize, vs: VarBuilder) -> candle_core::Result<Self> {
        let (fc, prev_dim) = fc_stack(
            n_features,
            layers,
            Activation::LeakyRelu(0.2),
            vs.pp("nn.dis"),
        )?;
        let class_head = candle_nn::linear(prev_dim, n_classes, vs.pp("nn.dis.class"))?;
        let validity_head = candle_nn::linear(prev_dim, 1, vs.pp("nn.dis.valid"))?;
        Ok(Self {
            n_classes,
            fc,
            class_head,
            validity_head,
        })
    }

    /// Class logits and the probability of being generated
    pub fn forward_both(&self, x_nd: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let h = self.fc.forward(x_nd)?;
        let logits = self.class_head.forward(&h)?;
        let fake_prob = candle_nn::ops::sigmoid(&self.validity_head.forward(&h)?)?.squeeze(1)?;
        Ok((logits, fake_prob))
    }
}

impl ClassifierModuleT for Discriminator {
    fn logits(&self, x_nd: &Tensor) -> candle_core::Result<Tensor> {
        self.class_head.forward(&self.fc.forward(x_nd)?)
    }

    fn num_classes(&self) -> usize {
        self.n_classes
    }
}

///
/// Semi-supervised GAN. The discriminator classifies labelled data
/// and tells real (unlabelled) samples from generated ones; the
/// generator tries to pass as real. Each network has its own
/// optimizer. Only the discriminator is checkpointed.
///
pub struct SsganRunner {
    generator_variables: VarMap,
    generator: MlpDecoder,
    generator_optimizer: AdamW,
    discriminator_variables: VarMap,
    discriminator: Discriminator,
    discriminator_optimizer: AdamW,
    noise: SeededNoise,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GanLosses {
    pub discriminator: f32,
    pub generator: f32,
}

impl SsganRunner {
    pub fn new(shape: &ModelShape, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let dev = &train_config.device;
        let lr: f64 = train_config.learning_rate.into();
        let layers = shape.layers_or(&SSGAN_LAYERS);

        let generator_variables = VarMap::new();
        let vs = VarBuilder::from_varmap(&generator_variables, DType::F32, dev);
        let gen_layers: Vec<usize> = layers.iter().rev().copied().collect();
        let generator = MlpDecoder::new(
            shape.latent_or(SSGAN_LATENT_DIM),
            shape.n_features,
            &gen_layers,
            OutputActivation::Sigmoid,
            vs.pp("ssgan.gen"),
        )?;
        let generator_optimizer = AdamW::new_lr(generator_variables.all_vars(), lr)?;

        let discriminator_variables = VarMap::new();
        let vs = VarBuilder::from_varmap(&discriminator_variables, DType::F32, dev);
        let discriminator =
            Discriminator::new(shape.n_features, &layers, shape.n_classes, vs.pp("ssgan"))?;
        let discriminator_optimizer = AdamW::new_lr(discriminator_variables.all_vars(), lr)?;

        Ok(Self {
            generator_variables,
            generator,
            generator_optimizer,
            discriminator_variables,
            discriminator,
            discriminator_optimizer,
            noise: SeededNoise::new(train_config.seed),
        })
    }

    fn generate(&mut self, n: usize, device: &candle_core::Device) -> candle_core::Result<Tensor> {
        let shape = Shape::from((n, self.generator.dim_latent()));
        let z = self.noise.standard_normal(&shape, device)?;
        self.generator.forward(&z)
    }

    /// One discriminator update followed by one generator update
    ///
    /// * `x_l`, `y_l` - labelled minibatch
    /// * `x_u` - unlabelled minibatch, the real samples
    pub fn train_step(&mut self, x_l: &Tensor, y_l: &Tensor, x_u: &Tensor) -> anyhow::Result<GanLosses> {
        let nl = x_l.dims2()?.0;
        let fake = self.generate(x_u.dims2()?.0, x_u.device())?;

        let logits_l = self.discriminator.logits(x_l)?;
        let supervised = (candle_nn::loss::cross_entropy(&logits_l, &y_l.to_dtype(DType::U32)?)?
            * nl as f64)?;

        let (_, real_prob) = self.discriminator.forward_both(x_u)?;
        let (_, fake_prob) = self.discriminator.forward_both(&fake.detach())?;

        let d_loss = ((supervised + binary_cross_entropy_const(&real_prob, REAL)?)?
            + binary_cross_entropy_const(&fake_prob, FAKE)?)?;
        self.discriminator_optimizer.backward_step(&d_loss)?;

        let (_, fake_prob) = self.discriminator.forward_both(&fake)?;
        let g_loss = binary_cross_entropy_const(&fake_prob, REAL)?;
        self.generator_optimizer.backward_step(&g_loss)?;

        Ok(GanLosses {
            discriminator: d_loss.to_scalar::<f32>()?,
            generator: g_loss.to_scalar::<f32>()?,
        })
    }
}

impl ModelRunnerT for SsganRunner {
    fn checkpoint_identity(&self) -> String {
        "ssgan".to_string()
    }

    fn parameters(&self) -> &VarMap {
        &self.discriminator_variables
    }

    /// # Returns the mean discriminator loss
    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let device = &train_config.device;
        let pairs = cyclic_minibatch_pairs(
            data.unlabelled.num_minibatch(),
            data.labelled.num_minibatch(),
        );
        if pairs.is_empty() {
            return Err(anyhow::anyhow!("no labelled or unlabelled minibatch"));
        }

        let mut d_tot = 0f32;
        let mut g_tot = 0f32;
        for &(ub, lb) in pairs.iter() {
            let x_u = data.unlabelled.minibatch_data(ub, device)?.input;
            let lab = data.labelled.minibatch_data(lb, device)?;
            let y_l = lab
                .labels
                .ok_or(anyhow::anyhow!("labelled minibatch without labels"))?;

            let losses = self.train_step(&lab.input, &y_l, &x_u)?;
            d_tot += losses.discriminator;
            g_tot += losses.generator;
        }

        let n = pairs.len() as f32;
        if train_config.verbose {
            info!(
                "discriminator loss: {}, generator loss: {}",
                d_tot / n,
                g_tot / n
            );
        }
        Ok(d_tot / n)
    }

    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32> {
        accuracy(
            data,
            &|x: &Tensor| self.discriminator.logits(x),
            &train_config.device,
        )
    }

    /// Mean cross entropy of the class head on the validation set
    fn validation_score(
        &mut self,
        data: &SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let full = data.validation.full_data(&train_config.device)?;
        let y = full
            .labels
            .ok_or(anyhow::anyhow!("validation data without labels"))?
            .to_dtype(DType::U32)?;
        let logits = self.discriminator.logits(&full.input)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &y)?.to_scalar::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_util::candle_checkpoint::*;

    #[test]
    fn ssgan_epoch_keeps_networks_apart() -> anyhow::Result<()> {
        let mut data = toy_semisup_data(4, 8)?;
        let config = TrainConfig {
            learning_rate: 1e-2,
            batch_size: 4,
            show_progress: false,
            ..TrainConfig::default()
        };
        let shape = ModelShape {
            n_features: 8,
            n_classes: 2,
            hidden_layers: Some(vec![16]),
            latent_dim: Some(3),
        };
        let mut runner = SsganRunner::new(&shape, &config)?;

        data.shuffle_minibatch(config.batch_size)?;
        let loss = runner.train_epoch(&mut data, &config)?;
        assert!(loss.is_finite());

        let score = runner.validation_score(&data, &config)?;
        assert!(score.is_finite() && score >= 0.);

        let snapshot = runner.parameters().state_dict()?;
        assert!(snapshot.keys().all(|k| k.starts_with("ssgan.nn.dis.")));
        assert!(runner
            .generator_variables
            .state_dict()?
            .keys()
            .all(|k| k.starts_with("ssgan.gen.")));

        let acc = runner.evaluate(&data.validation, &config)?;
        assert!((0. ..=1.).contains(&acc));
        Ok(())
    }
}
