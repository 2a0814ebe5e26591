#![allow(dead_code)]

use candle_core::{DType, Result, Tensor};

/// Floor added inside `log(q + eps)` of the categorical entropy
pub const ENTROPY_EPS: f64 = 1e-8;

/// Lower bound on `log(p)` inside the binary cross entropy, the same
/// clamp `torch.nn.functional.binary_cross_entropy` applies
const MIN_LOG_PROB: f64 = -100.;

/// KL divergence loss between two Gaussian distributions
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Fail unless every element of `x_nd` lies in `[0, 1]`.
///
/// The Bernoulli likelihood is only defined on this interval, so we
/// never clamp the data silently.
pub fn check_unit_interval(x_nd: &Tensor) -> Result<()> {
    // NaN fails both comparisons
    let inside = x_nd.ge(0f32)?.mul(&x_nd.le(1f32)?)?;
    let num_inside = inside.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    let num_outside = x_nd.elem_count() - num_inside as usize;
    if num_outside > 0 {
        candle_core::bail!(
            "bernoulli likelihood needs data in [0, 1], found {} element(s) outside",
            num_outside
        );
    }
    Ok(())
}

/// Bernoulli log-likelihood of [0, 1]-valued data (negative BCE)
///
/// llik(i) = sum_j x(i,j) * log p(i,j) + (1 - x(i,j)) * log(1 - p(i,j))
///
/// * `x_nd` - data tensor (observed data in [0, 1])
/// * `prob_nd` - probability tensor (logistic reconstruction)
///
pub fn bernoulli_likelihood(x_nd: &Tensor, prob_nd: &Tensor) -> Result<Tensor> {
    check_unit_interval(x_nd)?;

    let log_p = prob_nd.log()?.clamp(MIN_LOG_PROB, 0.)?;
    let log_q = prob_nd.affine(-1., 1.)?.log()?.clamp(MIN_LOG_PROB, 0.)?;
    let one_minus_x = x_nd.affine(-1., 1.)?;

    (x_nd.mul(&log_p)? + one_minus_x.mul(&log_q)?)?.sum(x_nd.rank() - 1)
}

/// Gaussian log-likelihood up to a constant
///
/// llik(i) = -0.5 * sum_w [ x(i,w) - xhat(i,w) ]^2
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - reconstruction
///
pub fn gaussian_likelihood(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.powf(2.)?.sum(x_nd.rank() - 1)? * (-0.5)
}

/// Mean squared error over every element
pub fn mse_loss(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.sqr()?.mean_all()
}

/// Entropy of each row of a probability matrix
///
/// H(i) = - sum_k q(i,k) * log(q(i,k) + eps)
///
pub fn categorical_entropy(q_nk: &Tensor) -> Result<Tensor> {
    let log_q = (q_nk + ENTROPY_EPS)?.log()?;
    q_nk.mul(&log_q)?.sum(q_nk.rank() - 1)?.neg()
}

/// Binary cross entropy of probabilities against a constant target,
/// summed over the batch
pub fn binary_cross_entropy_const(prob_n: &Tensor, target: f64) -> Result<Tensor> {
    let log_p = prob_n.log()?.clamp(MIN_LOG_PROB, 0.)?;
    let log_q = prob_n.affine(-1., 1.)?.log()?.clamp(MIN_LOG_PROB, 0.)?;
    ((log_p * target)? + (log_q * (1. - target))?)?
        .sum_all()?
        .neg()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn kl_vanishes_at_prior() -> Result<()> {
        let dev = Device::Cpu;
        for k in [1usize, 3, 16] {
            let mu = Tensor::zeros((4, k), candle_core::DType::F32, &dev)?;
            let lnvar = Tensor::zeros((4, k), candle_core::DType::F32, &dev)?;
            let kl = gaussian_kl_loss(&mu, &lnvar)?.to_vec1::<f32>()?;
            assert!(kl.iter().all(|&v| v.abs() < 1e-7));
        }
        Ok(())
    }

    #[test]
    fn kl_is_positive_away_from_prior() -> Result<()> {
        let dev = Device::Cpu;
        let mu = Tensor::new(&[[1f32, -0.5]], &dev)?;
        let lnvar = Tensor::new(&[[0.3f32, -1.0]], &dev)?;
        let kl = gaussian_kl_loss(&mu, &lnvar)?.to_vec1::<f32>()?;
        assert!(kl[0] > 0.);
        Ok(())
    }

    #[test]
    fn bernoulli_rejects_out_of_range_data() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0.2f32, 1.5]], &dev)?;
        let p = Tensor::new(&[[0.5f32, 0.5]], &dev)?;
        assert!(bernoulli_likelihood(&x, &p).is_err());

        let x = Tensor::new(&[[-0.1f32, 0.5]], &dev)?;
        assert!(bernoulli_likelihood(&x, &p).is_err());

        let x = Tensor::new(&[[f32::NAN, 0.5]], &dev)?;
        assert!(bernoulli_likelihood(&x, &p).is_err());
        assert!(check_unit_interval(&Tensor::new(&[[0f32, 1.]], &dev)?).is_ok());
        Ok(())
    }

    #[test]
    fn bernoulli_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 0.]], &dev)?;
        let p = Tensor::new(&[[0.8f32, 0.3]], &dev)?;
        let llik = bernoulli_likelihood(&x, &p)?.to_vec1::<f32>()?;
        let expected = 0.8f32.ln() + 0.7f32.ln();
        approx::assert_abs_diff_eq!(llik[0], expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn entropy_of_uniform_and_certain_rows() -> Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::new(&[[0.5f32, 0.5], [1., 0.]], &dev)?;
        let h = categorical_entropy(&q)?.to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(h[0], 2f32.ln(), epsilon = 1e-5);
        approx::assert_abs_diff_eq!(h[1], 0., epsilon = 1e-6);
        Ok(())
    }
}
