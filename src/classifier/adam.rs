use crate::classifier::network::{Gradient, Network};
use ndarray::{Array, Array1, Array2, Dimension, Zip};

pub(crate) const DEFAULT_LEARNING_RATE: f32 = 0.001;

#[derive(Debug, Clone)]
struct Moments {
    kernel_m: Array2<f32>,
    kernel_v: Array2<f32>,
    bias_m: Array1<f32>,
    bias_v: Array1<f32>,
}

/// Adam with bias-corrected step size.
#[derive(Debug, Clone)]
pub(crate) struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    moments: Vec<Moments>,
}

fn update<D>(
    param: &mut Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    (step_size, beta1, beta2, epsilon): (f32, f32, f32, f32),
) where
    D: Dimension,
{
    Zip::from(param)
        .and(m)
        .and(v)
        .and(grad)
        .for_each(|p, m, v, &g| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= step_size * *m / (v.sqrt() + epsilon);
        });
}

impl Adam {
    pub(crate) fn new(learning_rate: f32, network: &Network) -> Self {
        let moments = network
            .layers()
            .iter()
            .map(|layer| Moments {
                kernel_m: Array2::zeros(layer.kernel.raw_dim()),
                kernel_v: Array2::zeros(layer.kernel.raw_dim()),
                bias_m: Array1::zeros(layer.bias.raw_dim()),
                bias_v: Array1::zeros(layer.bias.raw_dim()),
            })
            .collect();
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            moments,
        }
    }

    pub(crate) fn step(&mut self, network: &mut Network, gradients: &[Gradient]) {
        self.step = self.step.saturating_add(1);
        let correction1 = 1.0 - self.beta1.powi(self.step);
        let correction2 = 1.0 - self.beta2.powi(self.step);
        let step_size = self.learning_rate * correction2.sqrt() / correction1;
        let hyper = (step_size, self.beta1, self.beta2, self.epsilon);

        for ((layer, moments), gradient) in network
            .layers_mut()
            .iter_mut()
            .zip(self.moments.iter_mut())
            .zip(gradients)
        {
            update(
                &mut layer.kernel,
                &mut moments.kernel_m,
                &mut moments.kernel_v,
                &gradient.kernel,
                hyper,
            );
            update(
                &mut layer.bias,
                &mut moments.bias_m,
                &mut moments.bias_v,
                &gradient.bias,
                hyper,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::network::cross_entropy;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn first_step_moves_each_weight_by_learning_rate() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut network = Network::new(2, &[], 2, &mut rng).unwrap();
        let before = network.layers()[0].kernel.clone();
        let x = array![[1.0, 2.0]];
        let y = array![[1.0, 0.0]];
        let gradients = network
            .backward(&network.forward_trace(x.view()), y.view())
            .unwrap();

        let mut adam = Adam::new(0.01, &network);
        adam.step(&mut network, &gradients);

        Zip::from(&network.layers()[0].kernel)
            .and(&before)
            .and(&gradients[0].kernel)
            .for_each(|&after, &before, &g| {
                if g.abs() > 1e-3 {
                    assert!((before - after - 0.01 * g.signum()).abs() < 1e-4);
                }
            });
    }

    #[test]
    fn repeated_steps_reduce_loss() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut network = Network::new(2, &[4], 2, &mut rng).unwrap();
        let x = array![[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.2, 0.8]];
        let y = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let initial = cross_entropy(network.forward(x.view()).view(), y.view()).unwrap();

        let mut adam = Adam::new(0.05, &network);
        for _ in 0..100 {
            let gradients = network
                .backward(&network.forward_trace(x.view()), y.view())
                .unwrap();
            adam.step(&mut network, &gradients);
        }

        let trained = cross_entropy(network.forward(x.view()).view(), y.view()).unwrap();
        assert!(trained < initial / 2.0);
    }
}
