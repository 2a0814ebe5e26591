//! Evidence lower bound of a label-conditioned generative model.
//!
//! For a labelled pair `(x, y)`:
//!
//!   elbo(x, y) = log p(x | z, y) - KL(q(z | x, y) || N(0, I))
//!
//! For an unlabelled `x` every class is enumerated and weighted by the
//! classifier's posterior `q(y | x)`:
//!
//!   elbo(x) = H(q) + sum_k q(k | x) * elbo(x, e_k)
//!
//! Larger is better. Both terms are per example; the trainer negates
//! and averages them.

use crate::candle_loss_functions::*;
use crate::candle_model_traits::*;
use crate::candle_noise::NoiseSource;
use candle_core::{DType, Result, Tensor};

/// One-hot encoding of class indexes
///
/// * `labels_n` - class indexes (any integer dtype)
/// * `num_classes` - `K`
///
/// # Returns `n x K` f32 tensor
pub fn one_hot(labels_n: &Tensor, num_classes: usize) -> Result<Tensor> {
    candle_nn::encoding::one_hot(labels_n.to_dtype(DType::U32)?, num_classes, 1f32, 0f32)
}

/// Bernoulli log-likelihood minus the KL divergence to the standard
/// normal prior, per example. `x_nd` must be in `[0, 1]`.
pub fn elbo_from_recon(x_nd: &Tensor, recon_nd: &Tensor, latent: &LatentSample) -> Result<Tensor> {
    let llik_n = bernoulli_likelihood(x_nd, recon_nd)?;
    let kl_n = gaussian_kl_loss(&latent.mu, &latent.lnvar)?;
    llik_n - kl_n
}

#[derive(Clone, Copy, Debug)]
pub struct VariationalObjective {
    num_classes: usize,
}

impl VariationalObjective {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// ELBO of observed `(x, y)` pairs
    ///
    /// * `model` - generative model conditioned on the one-hot label
    /// * `x_nd` - data in `[0, 1]`
    /// * `y_nk` - one-hot labels
    /// * `noise` - source of the reparameterization noise
    /// * `train` - sample `z` or use the posterior mean
    ///
    /// # Returns per-example ELBO (n)
    pub fn labelled_term<Gen>(
        &self,
        model: &Gen,
        x_nd: &Tensor,
        y_nk: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<Tensor>
    where
        Gen: ConditionalGenerativeT + ?Sized,
    {
        let (n, k) = y_nk.dims2()?;
        if n != x_nd.dim(0)? || k != self.num_classes {
            candle_core::bail!(
                "labels {:?} do not match {} rows of {} classes",
                y_nk.dims(),
                x_nd.dim(0)?,
                self.num_classes
            );
        }
        let (recon_nd, latent) = model.forward_t(x_nd, y_nk, noise, train)?;
        elbo_from_recon(x_nd, &recon_nd, &latent)
    }

    ///
    /// Stack `K` copies of the batch, one per class, in class-major
    /// order: rows `k*B .. (k+1)*B` carry the label `e_k`.
    ///
    /// # Returns `(x_rep, y_rep)` of shapes `(K*B) x d` and `(K*B) x K`
    ///
    pub fn replicate_by_class(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let nn = x_nd.dim(0)?;
        let kk = self.num_classes;

        let x_rep = x_nd.repeat((kk, 1))?;

        let classes: Vec<u32> = (0..kk as u32)
            .flat_map(|k| std::iter::repeat(k).take(nn))
            .collect();
        let classes = Tensor::from_vec(classes, nn * kk, x_nd.device())?;
        let y_rep = one_hot(&classes, kk)?.to_dtype(x_nd.dtype())?;

        Ok((x_rep, y_rep))
    }

    ///
    /// ELBO of unlabelled data with the label marginalized out
    ///
    /// * `model` - generative model
    /// * `x_nd` - data in `[0, 1]`
    /// * `classify_fn` - `x -> logits` (n x K)
    /// * `noise` - source of the reparameterization noise
    /// * `train` - sample `z` or use the posterior mean
    ///
    /// # Returns per-example `H(q) + sum_k q(k) elbo(x, e_k)` (n)
    ///
    pub fn unlabelled_term<Gen, ClassifyFn>(
        &self,
        model: &Gen,
        x_nd: &Tensor,
        classify_fn: &ClassifyFn,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<Tensor>
    where
        Gen: ConditionalGenerativeT + ?Sized,
        ClassifyFn: Fn(&Tensor) -> Result<Tensor>,
    {
        let logits_nk = classify_fn(x_nd)?;
        self.unlabelled_term_from_logits(model, x_nd, &logits_nk, noise, train)
    }

    /// Same as `unlabelled_term` with the classifier output given
    pub fn unlabelled_term_from_logits<Gen>(
        &self,
        model: &Gen,
        x_nd: &Tensor,
        logits_nk: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<Tensor>
    where
        Gen: ConditionalGenerativeT + ?Sized,
    {
        let nn = x_nd.dim(0)?;
        let kk = self.num_classes;

        if logits_nk.dims2()? != (nn, kk) {
            candle_core::bail!(
                "classifier output {:?} vs. expected [{}, {}]",
                logits_nk.dims(),
                nn,
                kk
            );
        }

        let q_nk = candle_nn::ops::softmax(logits_nk, 1)?;

        // every class at once
        let (x_rep, y_rep) = self.replicate_by_class(x_nd)?;
        let elbo_rep = self.labelled_term(model, &x_rep, &y_rep, noise, train)?;

        // (K*B) -> K x B -> B x K
        let elbo_nk = elbo_rep.reshape((kk, nn))?.t()?;

        let expected_elbo_n = q_nk.mul(&elbo_nk)?.sum(1)?;
        let entropy_n = categorical_entropy(&q_nk)?;

        entropy_n + expected_elbo_n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_noise::SeededNoise;
    use crate::candle_semisup_vae::ConditionalVae;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn toy_model(vm: &VarMap, dd: usize, kk: usize) -> Result<ConditionalVae> {
        let vs = VarBuilder::from_varmap(vm, DType::F32, &Device::Cpu);
        ConditionalVae::new(dd, kk, 2, &[6], vs)
    }

    #[test]
    fn elbo_is_likelihood_at_the_prior() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 0., 1.], [0., 0., 1.]], &dev)?;
        let recon = Tensor::new(&[[0.8f32, 0.3, 0.6], [0.2, 0.1, 0.9]], &dev)?;
        let latent = LatentSample {
            z: Tensor::zeros((2, 4), DType::F32, &dev)?,
            mu: Tensor::zeros((2, 4), DType::F32, &dev)?,
            lnvar: Tensor::zeros((2, 4), DType::F32, &dev)?,
        };
        let elbo = elbo_from_recon(&x, &recon, &latent)?.to_vec1::<f32>()?;
        let llik = bernoulli_likelihood(&x, &recon)?.to_vec1::<f32>()?;
        for (a, b) in elbo.iter().zip(llik.iter()) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn elbo_decreases_with_reconstruction_error() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::ones((1, 5), DType::F32, &dev)?;
        let latent = LatentSample {
            z: Tensor::new(&[[0.3f32, -0.2]], &dev)?,
            mu: Tensor::new(&[[0.3f32, -0.2]], &dev)?,
            lnvar: Tensor::new(&[[-0.5f32, 0.1]], &dev)?,
        };

        let mut prev = f32::INFINITY;
        for p in [0.99f32, 0.9, 0.7, 0.5, 0.2] {
            let recon = Tensor::full(p, (1, 5), &dev)?;
            let elbo = elbo_from_recon(&x, &recon, &latent)?.to_vec1::<f32>()?[0];
            assert!(elbo < prev);
            prev = elbo;
        }
        Ok(())
    }

    #[test]
    fn data_outside_unit_interval_is_rejected() -> Result<()> {
        let vm = VarMap::new();
        let model = toy_model(&vm, 3, 2)?;
        let objective = VariationalObjective::new(2);
        let x = Tensor::new(&[[1.5f32, 0., 0.2]], &Device::Cpu)?;
        let y = one_hot(&Tensor::new(&[1u32], &Device::Cpu)?, 2)?;
        let mut noise = SeededNoise::new(0);
        assert!(objective
            .labelled_term(&model, &x, &y, &mut noise, true)
            .is_err());
        Ok(())
    }

    #[test]
    fn replication_is_class_major() -> Result<()> {
        let dev = Device::Cpu;
        let objective = VariationalObjective::new(3);
        let x = Tensor::new(&[[0.1f32, 0.2], [0.3, 0.4]], &dev)?;
        let (x_rep, y_rep) = objective.replicate_by_class(&x)?;

        assert_eq!(x_rep.dims(), &[6, 2]);
        assert_eq!(y_rep.argmax(1)?.to_vec1::<u32>()?, vec![0, 0, 1, 1, 2, 2]);

        let rows = x_rep.to_vec2::<f32>()?;
        assert_eq!(rows[0], rows[2]);
        assert_eq!(rows[1], rows[5]);
        Ok(())
    }

    #[test]
    fn certain_classifier_collapses_to_labelled_term() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let model = toy_model(&vm, 4, 3)?;
        let objective = VariationalObjective::new(3);

        let x = Tensor::rand(0f32, 1f32, (5, 4), &dev)?;
        let certain = |x_nd: &Tensor| -> Result<Tensor> {
            let n = x_nd.dim(0)?;
            let y = one_hot(&Tensor::from_vec(vec![2u32; n], n, &dev)?, 3)?;
            y.affine(200., -100.)
        };

        let mut noise = SeededNoise::new(1);
        let unlabelled = objective
            .unlabelled_term(&model, &x, &certain, &mut noise, false)?
            .to_vec1::<f32>()?;

        let y = one_hot(&Tensor::from_vec(vec![2u32; 5], 5, &dev)?, 3)?;
        let labelled = objective
            .labelled_term(&model, &x, &y, &mut noise, false)?
            .to_vec1::<f32>()?;

        for (u, l) in unlabelled.iter().zip(labelled.iter()) {
            approx::assert_abs_diff_eq!(*u, *l, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn uniform_classifier_adds_log_k_entropy() -> Result<()> {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let model = toy_model(&vm, 4, 2)?;
        let objective = VariationalObjective::new(2);

        let x = Tensor::rand(0f32, 1f32, (3, 4), &dev)?;
        let flat = |x_nd: &Tensor| Tensor::zeros((x_nd.dim(0)?, 2), DType::F32, x_nd.device());

        let mut noise = SeededNoise::new(1);
        let unlabelled = objective
            .unlabelled_term(&model, &x, &flat, &mut noise, false)?
            .to_vec1::<f32>()?;

        let mut mean_elbo = vec![0f32; 3];
        for k in 0..2u32 {
            let y = one_hot(&Tensor::from_vec(vec![k; 3], 3, &dev)?, 2)?;
            let elbo = objective
                .labelled_term(&model, &x, &y, &mut noise, false)?
                .to_vec1::<f32>()?;
            for (m, e) in mean_elbo.iter_mut().zip(elbo) {
                *m += 0.5 * e;
            }
        }

        for (u, m) in unlabelled.iter().zip(mean_elbo.iter()) {
            approx::assert_abs_diff_eq!(*u, m + 2f32.ln(), epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn mismatched_classifier_output_is_an_error() -> Result<()> {
        let vm = VarMap::new();
        let model = toy_model(&vm, 4, 2)?;
        let objective = VariationalObjective::new(2);
        let x = Tensor::rand(0f32, 1f32, (3, 4), &Device::Cpu)?;
        let logits = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        let mut noise = SeededNoise::new(0);
        assert!(objective
            .unlabelled_term_from_logits(&model, &x, &logits, &mut noise, true)
            .is_err());
        Ok(())
    }
}
