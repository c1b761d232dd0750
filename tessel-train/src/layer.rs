use std::marker::PhantomData;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessel_error::{TesselResult, tessel_bail, tessel_panic};

use crate::params::{Params, StageParams};

/// Hyper-parameters shared by every weighted stage.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOptions {
    /// Base learning rate.
    pub rate: f32,
    /// The rate decays as `rate / (1 + rate_annealing * samples)`.
    pub rate_annealing: f32,
    pub momentum_start: f32,
    /// Samples over which momentum ramps linearly from start to stable; 0 disables the ramp.
    pub momentum_ramp: u64,
    pub momentum_stable: f32,
    pub l2: f32,
    /// Seed for weight initialisation.
    pub seed: u64,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            rate: 0.005,
            rate_annealing: 1e-6,
            momentum_start: 0.0,
            momentum_ramp: 0,
            momentum_stable: 0.0,
            l2: 0.0,
            seed: 0x7e55e1,
        }
    }
}

impl LayerOptions {
    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_rate_annealing(mut self, rate_annealing: f32) -> Self {
        self.rate_annealing = rate_annealing;
        self
    }

    pub fn with_momentum(mut self, start: f32, ramp: u64, stable: f32) -> Self {
        self.momentum_start = start;
        self.momentum_ramp = ramp;
        self.momentum_stable = stable;
        self
    }

    pub fn with_l2(mut self, l2: f32) -> Self {
        self.l2 = l2;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A weighted stage of a pipeline, after the input.
///
/// A stage owns its activation and error buffers. Its [`StageParams`] may be shared with other
/// pipelines; see [`Layer::set_params`].
pub trait Layer: Send {
    fn name(&self) -> &'static str;

    fn units(&self) -> usize;

    /// Attach the stage at position `index` behind a stage of `inputs` units.
    ///
    /// Allocates buffers, initialises parameters unless already set, and adjusts the
    /// hyper-parameters for `samples` rows already processed.
    fn bind(&mut self, index: usize, inputs: usize, samples: u64) -> TesselResult<()>;

    fn activations(&self) -> &[f32];

    /// The activations and the error buffer, borrowed together.
    fn buffers_mut(&mut self) -> (&[f32], &mut [f32]);

    fn clear_errors(&mut self);

    fn forward(&mut self, input: &[f32], training: bool);

    /// Compute this stage's gradient and update its parameters.
    ///
    /// Output stages derive their error from `target`, hidden stages from the errors accumulated
    /// by the stage after them. If `input_errors` is given, errors are propagated into it.
    fn backward(&mut self, input: &[f32], input_errors: Option<&mut [f32]>, target: f32) -> TesselResult<()>;

    /// Decay the learning rate for `samples` processed rows.
    fn anneal(&mut self, samples: u64);

    /// Ramp momentum for `samples` processed rows.
    fn momentum(&mut self, samples: u64);

    fn params(&self) -> &StageParams;

    /// Use `params` from now on, aliasing whoever else holds them.
    fn set_params(&mut self, params: StageParams) -> TesselResult<()>;

    /// An independent copy, parameters included.
    fn boxed_clone(&self) -> Box<dyn Layer>;
}

/// How a [`Dense`] stage turns weighted sums into activations and errors into gradients.
pub trait Activation: Clone + Send + 'static {
    const NAME: &'static str;

    fn activate(z: &mut [f32]);

    /// Write the gradient of every unit into `gradient`.
    fn gradient(activations: &[f32], errors: &[f32], target: f32, gradient: &mut [f32]) -> TesselResult<()>;
}

#[derive(Debug, Clone)]
pub struct TanhActivation;

impl Activation for TanhActivation {
    const NAME: &'static str = "tanh";

    fn activate(z: &mut [f32]) {
        z.iter_mut().for_each(|v| *v = v.tanh());
    }

    fn gradient(activations: &[f32], errors: &[f32], _target: f32, gradient: &mut [f32]) -> TesselResult<()> {
        for ((g, a), e) in gradient.iter_mut().zip(activations).zip(errors) {
            *g = e * (1.0 - a * a);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SoftmaxActivation;

impl Activation for SoftmaxActivation {
    const NAME: &'static str = "softmax";

    fn activate(z: &mut [f32]) {
        let max = z.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in z.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        z.iter_mut().for_each(|v| *v /= sum);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn gradient(activations: &[f32], _errors: &[f32], target: f32, gradient: &mut [f32]) -> TesselResult<()> {
        if target < 0.0 || target.fract() != 0.0 || target >= activations.len() as f32 {
            tessel_bail!(InvalidArgument: "label {target} is not one of {} classes", activations.len());
        }
        let label = target as usize;
        for (unit, (g, a)) in gradient.iter_mut().zip(activations).enumerate() {
            *g = if unit == label { 1.0 - a } else { -a };
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LinearActivation;

impl Activation for LinearActivation {
    const NAME: &'static str = "linear";

    fn activate(_z: &mut [f32]) {}

    fn gradient(activations: &[f32], _errors: &[f32], target: f32, gradient: &mut [f32]) -> TesselResult<()> {
        for (g, a) in gradient.iter_mut().zip(activations) {
            *g = target - a;
        }
        Ok(())
    }
}

/// A fully connected stage.
#[derive(Debug, Clone)]
pub struct Dense<A> {
    units: usize,
    inputs: usize,
    options: LayerOptions,
    params: Option<StageParams>,
    activations: Vec<f32>,
    errors: Vec<f32>,
    gradient: Vec<f32>,
    /// Momentum velocity of every weight, then every bias. Never shared.
    velocity: Vec<f32>,
    rate: f32,
    momentum: f32,
    _activation: PhantomData<A>,
}

/// Hidden stage with `tanh` activation.
pub type Tanh = Dense<TanhActivation>;
/// Classification output stage; the target is the class index.
pub type Softmax = Dense<SoftmaxActivation>;
/// Regression output stage; the target is the response value.
pub type Linear = Dense<LinearActivation>;

impl<A: Activation> Dense<A> {
    pub fn new(units: usize, options: LayerOptions) -> Self {
        Self {
            units,
            inputs: 0,
            rate: options.rate,
            momentum: options.momentum_start,
            options,
            params: None,
            activations: vec![0.0; units],
            errors: vec![0.0; units],
            gradient: vec![0.0; units],
            velocity: Vec::new(),
            _activation: PhantomData,
        }
    }

    pub fn options(&self) -> &LayerOptions {
        &self.options
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn current_momentum(&self) -> f32 {
        self.momentum
    }

    #[allow(clippy::cast_precision_loss)]
    fn initial_params(&self, index: usize) -> StageParams {
        let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(index as u64));
        let range = (6.0 / (self.inputs + self.units) as f32).sqrt();
        let weights = (0..self.inputs * self.units)
            .map(|_| rng.random_range(-range..=range))
            .collect::<Vec<_>>();
        StageParams {
            weights: Params::from_slice(&weights),
            biases: Params::zeros(self.units),
        }
    }

    fn check_params(&self, params: &StageParams) -> TesselResult<()> {
        if params.biases.len() != self.units || params.weights.len() != self.units * self.inputs {
            tessel_bail!(
                InvalidArgument: "{} stage of {}x{} given {} weights and {} biases",
                A::NAME,
                self.units,
                self.inputs,
                params.weights.len(),
                params.biases.len()
            );
        }
        Ok(())
    }

    fn update(&mut self, idx: usize, params: &Params, slot: usize, gradient: f32) {
        let w = params.get(idx);
        let v = &mut self.velocity[slot];
        *v = self.momentum * *v + self.rate * (gradient - self.options.l2 * w);
        params.set(idx, w + *v);
    }
}

impl<A: Activation> Layer for Dense<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn units(&self) -> usize {
        self.units
    }

    fn bind(&mut self, index: usize, inputs: usize, samples: u64) -> TesselResult<()> {
        if self.units == 0 || inputs == 0 {
            tessel_bail!(InvalidArgument: "{} stage {index} needs units and inputs", A::NAME);
        }
        if let Some(params) = &self.params {
            if self.inputs != inputs {
                self.inputs = inputs;
                self.check_params(params)?;
            }
        } else {
            self.inputs = inputs;
            self.params = Some(self.initial_params(index));
        }
        self.velocity = vec![0.0; self.units * (inputs + 1)];
        self.anneal(samples);
        self.momentum(samples);
        Ok(())
    }

    fn activations(&self) -> &[f32] {
        &self.activations
    }

    fn buffers_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.activations, &mut self.errors)
    }

    fn clear_errors(&mut self) {
        self.errors.fill(0.0);
    }

    fn forward(&mut self, input: &[f32], _training: bool) {
        let Some(params) = &self.params else {
            return;
        };
        for (unit, a) in self.activations.iter_mut().enumerate() {
            let row = unit * self.inputs;
            *a = params.biases.get(unit)
                + input
                    .iter()
                    .enumerate()
                    .map(|(j, x)| params.weights.get(row + j) * x)
                    .sum::<f32>();
        }
        A::activate(&mut self.activations);
    }

    fn backward(&mut self, input: &[f32], mut input_errors: Option<&mut [f32]>, target: f32) -> TesselResult<()> {
        let Some(params) = self.params.clone() else {
            tessel_bail!(InvalidArgument: "{} stage used before bind", A::NAME);
        };
        A::gradient(&self.activations, &self.errors, target, &mut self.gradient)?;

        for unit in 0..self.units {
            let g = self.gradient[unit];
            let row = unit * self.inputs;
            for (j, x) in input.iter().enumerate() {
                if let Some(errors) = input_errors.as_deref_mut() {
                    errors[j] += g * params.weights.get(row + j);
                }
                self.update(row + j, &params.weights, row + j, g * x);
            }
            self.update(unit, &params.biases, self.units * self.inputs + unit, g);
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn anneal(&mut self, samples: u64) {
        self.rate = self.options.rate / (1.0 + self.options.rate_annealing * samples as f32);
    }

    #[allow(clippy::cast_precision_loss)]
    fn momentum(&mut self, samples: u64) {
        let o = &self.options;
        self.momentum = if o.momentum_ramp == 0 || samples >= o.momentum_ramp {
            o.momentum_stable
        } else {
            let progress = samples as f32 / o.momentum_ramp as f32;
            o.momentum_start + (o.momentum_stable - o.momentum_start) * progress
        };
    }

    fn params(&self) -> &StageParams {
        self.params
            .as_ref()
            .unwrap_or_else(|| tessel_panic!("{} stage has no parameters before bind", A::NAME))
    }

    fn set_params(&mut self, params: StageParams) -> TesselResult<()> {
        self.check_params(&params)?;
        self.params = Some(params);
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn Layer> {
        let mut clone = self.clone();
        clone.params = self.params.as_ref().map(StageParams::deep_clone);
        Box::new(clone)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn bound<A: Activation>(units: usize, inputs: usize) -> Dense<A> {
        let mut layer = Dense::<A>::new(units, LayerOptions::default().with_rate(0.1));
        layer.bind(1, inputs, 0).unwrap();
        layer
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut layer = bound::<SoftmaxActivation>(3, 2);
        layer.forward(&[0.5, -1.0], true);
        let sum: f32 = layer.activations().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[rstest]
    #[case(-1.0)]
    #[case(1.5)]
    #[case(3.0)]
    fn softmax_rejects_bad_labels(#[case] label: f32) {
        let mut layer = bound::<SoftmaxActivation>(3, 2);
        layer.forward(&[1.0, 1.0], true);
        assert!(layer.backward(&[1.0, 1.0], None, label).is_err());
    }

    #[test]
    fn linear_moves_toward_target() {
        let mut layer = bound::<LinearActivation>(1, 1);
        let before = {
            layer.forward(&[1.0], true);
            (layer.activations()[0] - 2.0).abs()
        };
        for _ in 0..20 {
            layer.forward(&[1.0], true);
            layer.backward(&[1.0], None, 2.0).unwrap();
        }
        layer.forward(&[1.0], false);
        assert!((layer.activations()[0] - 2.0).abs() < before);
    }

    #[test]
    fn hidden_stage_propagates_errors() {
        let mut layer = bound::<TanhActivation>(2, 2);
        layer.forward(&[1.0, 0.5], true);
        layer.buffers_mut().1.copy_from_slice(&[1.0, -1.0]);
        let mut input_errors = vec![0.0; 2];
        layer
            .backward(&[1.0, 0.5], Some(&mut input_errors), f32::NAN)
            .unwrap();
        assert!(input_errors.iter().any(|e| *e != 0.0));
    }

    #[test]
    fn boxed_clone_is_deep_and_set_params_aliases() {
        let layer = bound::<TanhActivation>(2, 3);
        let clone = layer.boxed_clone();
        assert!(!clone.params().weights.aliases(&layer.params().weights));

        let mut other = Dense::<TanhActivation>::new(2, LayerOptions::default());
        other.bind(1, 3, 0).unwrap();
        other.set_params(layer.params().clone()).unwrap();
        assert!(other.params().weights.aliases(&layer.params().weights));
        assert!(
            other
                .set_params(StageParams {
                    weights: Params::zeros(5),
                    biases: Params::zeros(2),
                })
                .is_err()
        );
    }

    #[test]
    fn annealing_and_momentum_ramp() {
        let mut layer = Dense::<TanhActivation>::new(
            1,
            LayerOptions::default()
                .with_rate(1.0)
                .with_rate_annealing(1.0)
                .with_momentum(0.0, 100, 0.5),
        );
        layer.bind(1, 1, 0).unwrap();
        assert_eq!(layer.rate(), 1.0);
        layer.anneal(1);
        assert_eq!(layer.rate(), 0.5);
        layer.momentum(50);
        assert_eq!(layer.current_momentum(), 0.25);
        layer.momentum(1_000);
        assert_eq!(layer.current_momentum(), 0.5);
    }
}
