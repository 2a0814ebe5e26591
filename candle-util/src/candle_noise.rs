use candle_core::{Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// A source of standard Gaussian noise for reparameterization and
/// input corruption.
pub trait NoiseSource {
    /// Draw `eps ~ N(0, I)` with the given shape
    fn standard_normal(&mut self, shape: &Shape, device: &Device) -> Result<Tensor>;

    fn standard_normal_like(&mut self, x: &Tensor) -> Result<Tensor> {
        self.standard_normal(x.shape(), x.device())?
            .to_dtype(x.dtype())
    }
}

/// Noise drawn on the host from a seeded `StdRng`, so that every draw
/// can be replayed
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn standard_normal(&mut self, shape: &Shape, device: &Device) -> Result<Tensor> {
        let eps: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_vec(eps, shape.clone(), device)
    }
}

/// Noise drawn by the device's own generator (faster on GPU, not
/// reproducible across runs)
pub struct DeviceNoise;

impl NoiseSource for DeviceNoise {
    fn standard_normal(&mut self, shape: &Shape, device: &Device) -> Result<Tensor> {
        Tensor::randn(0f32, 1f32, shape.clone(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_noise_replays() -> Result<()> {
        let shape = Shape::from((3, 4));
        let a = SeededNoise::new(42).standard_normal(&shape, &Device::Cpu)?;
        let b = SeededNoise::new(42).standard_normal(&shape, &Device::Cpu)?;
        let c = SeededNoise::new(7).standard_normal(&shape, &Device::Cpu)?;

        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        assert_ne!(a.to_vec2::<f32>()?, c.to_vec2::<f32>()?);
        Ok(())
    }
}
