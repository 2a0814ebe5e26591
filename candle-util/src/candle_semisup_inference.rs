use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_model_traits::*;
use crate::candle_noise::NoiseSource;
use crate::candle_semisup_objective::*;

use candle_core::{Result, Tensor};
use candle_nn::{AdamW, Optimizer, VarMap};
use log::info;

/// Weight of the supervised cross entropy against the two ELBO terms
///
/// alpha = scale * |unlabelled| / |labelled|
pub fn classification_weight(alpha_scale: f64, num_unlabelled: usize, num_labelled: usize) -> f64 {
    alpha_scale * num_unlabelled as f64 / num_labelled.max(1) as f64
}

/// Scalar pieces of one optimizer step
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossTerms {
    pub total: f32,
    /// mean labelled ELBO
    pub labelled: f32,
    /// mean unlabelled ELBO
    pub unlabelled: f32,
    /// mean cross entropy on the labelled batch
    pub classification: f32,
}

///
/// Joint training of a label-conditioned generative model and a
/// classifier that share one optimizer over one `VarMap`:
///
/// loss = -mean(elbo(x_l, y_l)) - mean(elbo(x_u)) + alpha * CE(x_l, y_l)
///
pub struct SemiSupervisedTrainer<Gen, Cls>
where
    Gen: ConditionalGenerativeT,
    Cls: ClassifierModuleT,
{
    pub model: Gen,
    pub classifier: Cls,
    pub variable_map: VarMap,
    objective: VariationalObjective,
    alpha: f64,
    optimizer: AdamW,
}

impl<Gen, Cls> SemiSupervisedTrainer<Gen, Cls>
where
    Gen: ConditionalGenerativeT,
    Cls: ClassifierModuleT,
{
    /// * `model` - generative model, variables in `variable_map`
    /// * `classifier` - classifier, variables in `variable_map`
    /// * `alpha` - weight of the classification loss
    /// * `learning_rate` - AdamW learning rate
    pub fn new(
        model: Gen,
        classifier: Cls,
        variable_map: VarMap,
        alpha: f64,
        learning_rate: f64,
    ) -> anyhow::Result<Self> {
        if model.num_classes() != classifier.num_classes() {
            return Err(anyhow::anyhow!(
                "generative model has {} classes, classifier {}",
                model.num_classes(),
                classifier.num_classes()
            ));
        }

        let optimizer = AdamW::new_lr(variable_map.all_vars(), learning_rate)?;
        let objective = VariationalObjective::new(model.num_classes());

        Ok(Self {
            model,
            classifier,
            variable_map,
            objective,
            alpha,
            optimizer,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn objective(&self) -> &VariationalObjective {
        &self.objective
    }

    /// The combined loss and its parts
    ///
    /// * `x_l` - labelled data
    /// * `y_l` - labels (class indexes)
    /// * `x_u` - unlabelled data
    pub fn total_loss(
        &self,
        x_l: &Tensor,
        y_l: &Tensor,
        x_u: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<(Tensor, LossTerms)> {
        let y_l_nk = one_hot(y_l, self.objective.num_classes())?.to_dtype(x_l.dtype())?;

        let elbo_l = self
            .objective
            .labelled_term(&self.model, x_l, &y_l_nk, noise, train)?
            .mean_all()?;

        let classify = |x_nd: &Tensor| self.classifier.logits(x_nd);
        let elbo_u = self
            .objective
            .unlabelled_term(&self.model, x_u, &classify, noise, train)?
            .mean_all()?;

        let logits_l = self.classifier.logits(x_l)?;
        let class_loss =
            candle_nn::loss::cross_entropy(&logits_l, &y_l.to_dtype(candle_core::DType::U32)?)?;

        let total = ((class_loss.affine(self.alpha, 0.)? - &elbo_l)? - &elbo_u)?;

        let terms = LossTerms {
            total: total.to_scalar::<f32>()?,
            labelled: elbo_l.to_scalar::<f32>()?,
            unlabelled: elbo_u.to_scalar::<f32>()?,
            classification: class_loss.to_scalar::<f32>()?,
        };
        Ok((total, terms))
    }

    /// One backward pass and one AdamW update of every parameter
    pub fn train_step(
        &mut self,
        x_l: &Tensor,
        y_l: &Tensor,
        x_u: &Tensor,
        noise: &mut dyn NoiseSource,
    ) -> anyhow::Result<LossTerms> {
        let (loss, terms) = self.total_loss(x_l, y_l, x_u, noise, true)?;
        self.optimizer.backward_step(&loss)?;
        Ok(terms)
    }

    /// One pass over the unlabelled minibatches; the labelled ones
    /// cycle. Minibatches must already be shuffled.
    ///
    /// # Returns the mean total loss
    pub fn train_epoch(
        &mut self,
        data: &SemiSupervisedData,
        noise: &mut dyn NoiseSource,
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

        let mut loss_tot = 0f32;
        for &(ub, lb) in pairs.iter() {
            let x_u = data.unlabelled.minibatch_data(ub, device)?.input;
            let lab = data.labelled.minibatch_data(lb, device)?;
            let y_l = lab
                .labels
                .ok_or(anyhow::anyhow!("labelled minibatch without labels"))?;

            let terms = self.train_step(&lab.input, &y_l, &x_u, noise)?;
            loss_tot += terms.total;
        }

        let loss = loss_tot / pairs.len() as f32;
        if train_config.verbose {
            info!("semi-supervised loss: {}", loss);
        }
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_grows_with_unlabelled_share() {
        approx::assert_abs_diff_eq!(classification_weight(0.1, 20, 4), 0.5, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(classification_weight(0.1, 50000, 100), 50., epsilon = 1e-9);
    }
}
