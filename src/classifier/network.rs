use crate::error::Error;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use num_traits::ToPrimitive;
use ordered_float::OrderedFloat;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logs.
const EPSILON: f32 = 1e-7;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Activation {
    Relu,
    Softmax,
}

impl Activation {
    fn apply(self, mut z: Array2<f32>) -> Array2<f32> {
        match self {
            Self::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Self::Softmax => {
                for mut row in z.axis_iter_mut(Axis(0)) {
                    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
        z
    }
}

/// A fully connected layer computing `activation(x · kernel + bias)`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dense {
    pub(crate) kernel: Array2<f32>,
    pub(crate) bias: Array1<f32>,
    pub(crate) activation: Activation,
}

impl Dense {
    /// Glorot-uniform kernel, zero bias.
    fn glorot<R>(inputs: usize, units: usize, activation: Activation, rng: &mut R) -> Result<Self, Error>
    where
        R: Rng,
    {
        let fan = (inputs + units).to_f32().ok_or(Error::ConvertToF32)?;
        let limit = (6.0 / fan).sqrt();
        Ok(Self {
            kernel: Array2::from_shape_fn((inputs, units), |_| rng.gen_range(-limit..limit)),
            bias: Array1::zeros(units),
            activation,
        })
    }

    pub(crate) fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    pub(crate) fn units(&self) -> usize {
        self.kernel.ncols()
    }

    fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        self.activation.apply(x.dot(&self.kernel) + &self.bias)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Gradient {
    pub(crate) kernel: Array2<f32>,
    pub(crate) bias: Array1<f32>,
}

/// Feed-forward classifier: ReLU hidden layers and a softmax output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Network {
    layers: Vec<Dense>,
}

impl Network {
    pub(crate) fn new<R>(
        input_width: usize,
        hidden_units: &[usize],
        classes: usize,
        rng: &mut R,
    ) -> Result<Self, Error>
    where
        R: Rng,
    {
        let mut layers = Vec::with_capacity(hidden_units.len() + 1);
        let mut inputs = input_width;
        for &units in hidden_units {
            layers.push(Dense::glorot(inputs, units, Activation::Relu, rng)?);
            inputs = units;
        }
        layers.push(Dense::glorot(inputs, classes, Activation::Softmax, rng)?);
        Self::from_layers(layers)
    }

    pub(crate) fn from_layers(layers: Vec<Dense>) -> Result<Self, Error> {
        let (last, hidden) = layers
            .split_last()
            .ok_or_else(|| Error::InvalidTopology("network has no layers".to_owned()))?;
        if last.activation != Activation::Softmax {
            return Err(Error::InvalidTopology(
                "output layer must use softmax".to_owned(),
            ));
        }
        if hidden.iter().any(|layer| layer.activation != Activation::Relu) {
            return Err(Error::InvalidTopology(
                "hidden layers must use relu".to_owned(),
            ));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].units() != pair[1].inputs() {
                return Err(Error::InvalidTopology(format!(
                    "layer {} produces {} values but layer {} expects {}",
                    i,
                    pair[0].units(),
                    i + 1,
                    pair[1].inputs()
                )));
            }
        }
        for (i, layer) in layers.iter().enumerate() {
            if layer.bias.len() != layer.units() {
                return Err(Error::InvalidTopology(format!(
                    "layer {} has {} biases for {} units",
                    i,
                    layer.bias.len(),
                    layer.units()
                )));
            }
        }
        Ok(Self { layers })
    }

    pub(crate) fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Dense] {
        &mut self.layers
    }

    pub(crate) fn input_width(&self) -> usize {
        self.layers[0].inputs()
    }

    pub(crate) fn output_width(&self) -> usize {
        self.layers[self.layers.len() - 1].units()
    }

    pub(crate) fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut layers = self.layers.iter();
        let first = match layers.next() {
            Some(layer) => layer.forward(x),
            None => return x.to_owned(),
        };
        layers.fold(first, |a, layer| layer.forward(a.view()))
    }

    /// Every layer's output, preceded by the input itself.
    pub(crate) fn forward_trace(&self, x: ArrayView2<f32>) -> Vec<Array2<f32>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.to_owned());
        for layer in &self.layers {
            let next = layer.forward(activations[activations.len() - 1].view());
            activations.push(next);
        }
        activations
    }

    /// Gradients of the mean categorical cross-entropy for one batch.
    pub(crate) fn backward(
        &self,
        activations: &[Array2<f32>],
        targets: ArrayView2<f32>,
    ) -> Result<Vec<Gradient>, Error> {
        let batch = targets.nrows().to_f32().ok_or(Error::ConvertToF32)?;
        let probabilities = &activations[activations.len() - 1];

        // softmax followed by cross-entropy differentiates to (p - y)
        let mut delta = (probabilities - &targets) / batch;
        let mut gradients = Vec::with_capacity(self.layers.len());

        for (i, layer) in self.layers.iter().enumerate().rev() {
            let input = &activations[i];
            gradients.push(Gradient {
                kernel: input.t().dot(&delta),
                bias: delta.sum_axis(Axis(0)),
            });
            if i > 0 {
                let mut upstream = delta.dot(&layer.kernel.t());
                upstream.zip_mut_with(input, |d, &a| {
                    if a <= 0.0 {
                        *d = 0.0;
                    }
                });
                delta = upstream;
            }
        }

        gradients.reverse();
        Ok(gradients)
    }
}

pub(crate) fn cross_entropy(
    probabilities: ArrayView2<f32>,
    targets: ArrayView2<f32>,
) -> Result<f32, Error> {
    let rows = probabilities.nrows().to_f32().ok_or(Error::ConvertToF32)?;
    let total = Zip::from(&probabilities)
        .and(&targets)
        .fold(0.0_f32, |acc, &p, &t| {
            acc - t * p.clamp(EPSILON, 1.0 - EPSILON).ln()
        });
    Ok(total / rows)
}

/// Index and value of the largest entry; the last one wins ties.
pub(crate) fn argmax(row: ArrayView1<f32>) -> Option<(usize, f32)> {
    row.iter()
        .copied()
        .enumerate()
        .max_by_key(|&(_, p)| OrderedFloat(p))
}

/// Number of rows whose most probable class is the target class.
pub(crate) fn count_correct(probabilities: ArrayView2<f32>, targets: ArrayView2<f32>) -> usize {
    probabilities
        .axis_iter(Axis(0))
        .zip(targets.axis_iter(Axis(0)))
        .filter(|(p, t)| {
            matches!((argmax(p.view()), argmax(t.view())), (Some((a, _)), Some((b, _))) if a == b)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    mod forward_tests {
        use super::*;

        #[test]
        fn softmax_rows_sum_to_one() {
            let mut rng = StdRng::seed_from_u64(7);
            let network = Network::new(4, &[8, 6], 3, &mut rng).unwrap();
            let x = array![[0.1, 0.2, 0.3, 0.4], [10.0, -4.0, 2.0, 0.0]];
            let probabilities = network.forward(x.view());
            assert_eq!(probabilities.dim(), (2, 3));
            for row in probabilities.axis_iter(Axis(0)) {
                assert_approx_eq!(row.sum(), 1.0, 1e-5);
                assert!(row.iter().all(|&p| p > 0.0));
            }
        }

        #[test]
        fn trace_matches_forward() {
            let mut rng = StdRng::seed_from_u64(11);
            let network = Network::new(3, &[5], 2, &mut rng).unwrap();
            let x = array![[1.0, -1.0, 0.5]];
            let trace = network.forward_trace(x.view());
            assert_eq!(trace.len(), 3);
            assert_eq!(trace[2], network.forward(x.view()));
        }

        #[test]
        fn hidden_softmax_is_rejected() {
            let layer = |inputs, units, activation| Dense {
                kernel: Array2::zeros((inputs, units)),
                bias: Array1::zeros(units),
                activation,
            };
            assert!(Network::from_layers(vec![
                layer(2, 2, Activation::Softmax),
                layer(2, 2, Activation::Softmax),
            ])
            .is_err());
            assert!(Network::from_layers(vec![
                layer(2, 3, Activation::Relu),
                layer(2, 2, Activation::Softmax),
            ])
            .is_err());
        }
    }

    mod backward_tests {
        use super::*;

        #[test]
        fn kernel_gradient_matches_finite_difference() {
            let mut rng = StdRng::seed_from_u64(3);
            let mut network = Network::new(3, &[4], 2, &mut rng).unwrap();
            let x = array![[0.5, -0.2, 0.8], [0.1, 0.4, -0.6]];
            let y = array![[1.0, 0.0], [0.0, 1.0]];

            let trace = network.forward_trace(x.view());
            let gradients = network.backward(&trace, y.view()).unwrap();

            let h = 1e-2;
            let original = network.layers()[1].kernel[(0, 1)];
            network.layers_mut()[1].kernel[(0, 1)] = original + h;
            let plus = cross_entropy(network.forward(x.view()).view(), y.view()).unwrap();
            network.layers_mut()[1].kernel[(0, 1)] = original - h;
            let minus = cross_entropy(network.forward(x.view()).view(), y.view()).unwrap();

            let numeric = (plus - minus) / (2.0 * h);
            assert_approx_eq!(gradients[1].kernel[(0, 1)], numeric, 1e-3);
        }

        #[test]
        fn gradient_shapes_follow_layers() {
            let mut rng = StdRng::seed_from_u64(5);
            let network = Network::new(6, &[4, 3], 2, &mut rng).unwrap();
            let x = Array2::from_elem((5, 6), 0.3);
            let y = Array2::from_shape_fn((5, 2), |(r, c)| if r % 2 == c { 1.0 } else { 0.0 });
            let gradients = network
                .backward(&network.forward_trace(x.view()), y.view())
                .unwrap();
            let shapes: Vec<_> = gradients.iter().map(|g| (g.kernel.dim(), g.bias.len())).collect();
            assert_eq!(shapes, vec![((6, 4), 4), ((4, 3), 3), ((3, 2), 2)]);
        }
    }

    mod metric_tests {
        use super::*;

        #[test]
        fn cross_entropy_of_confident_hit_is_small() {
            let p = array![[0.99, 0.01]];
            let y = array![[1.0, 0.0]];
            assert_approx_eq!(cross_entropy(p.view(), y.view()).unwrap(), 0.01005, 1e-4);
        }

        #[test]
        fn argmax_prefers_last_on_ties() {
            let row = array![0.5, 0.2, 0.5];
            assert_eq!(argmax(row.view()), Some((2, 0.5)));
        }

        #[test]
        fn correct_rows_are_counted() {
            let p = array![[0.9, 0.1], [0.3, 0.7], [0.6, 0.4]];
            let y = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0]];
            assert_eq!(count_correct(p.view(), y.view()), 2);
        }
    }
}
