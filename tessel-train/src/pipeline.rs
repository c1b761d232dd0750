use tessel_error::{TesselResult, tessel_bail};

use crate::input::Input;
use crate::layer::Layer;
use crate::params::ModelParams;

/// An input stage followed by weighted stages, the last of which is the output.
pub struct Pipeline {
    input: Box<dyn Input>,
    layers: Vec<Box<dyn Layer>>,
}

impl Pipeline {
    /// Bind every stage in order. `samples` rows are assumed processed already.
    pub fn try_new(input: Box<dyn Input>, layers: Vec<Box<dyn Layer>>, samples: u64) -> TesselResult<Self> {
        if layers.is_empty() {
            tessel_bail!(InvalidArgument: "a pipeline needs an output stage");
        }
        let mut pipeline = Self { input, layers };
        pipeline.bind(samples)?;
        Ok(pipeline)
    }

    fn bind(&mut self, samples: u64) -> TesselResult<()> {
        let mut inputs = self.input.width();
        for (index, layer) in self.layers.iter_mut().enumerate() {
            layer.bind(index + 1, inputs, samples)?;
            inputs = layer.units();
        }
        Ok(())
    }

    pub fn input(&self) -> &dyn Input {
        self.input.as_ref()
    }

    pub fn input_mut(&mut self) -> &mut dyn Input {
        self.input.as_mut()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn output(&self) -> &dyn Layer {
        // Non-empty by construction.
        self.layers[self.layers.len() - 1].as_ref()
    }

    /// Handles to every stage's parameters; these alias the pipeline's own.
    pub fn params(&self) -> ModelParams {
        ModelParams::new(self.layers.iter().map(|l| l.params().clone()).collect())
    }

    /// Point every stage at `params`, aliasing them.
    pub fn alias_params(&mut self, params: &ModelParams) -> TesselResult<()> {
        if params.len() != self.layers.len() {
            tessel_bail!(
                InvalidArgument: "{} parameter stages for a pipeline of {} stages",
                params.len(),
                self.layers.len()
            );
        }
        for (layer, stage) in self.layers.iter_mut().zip(params.stages()) {
            layer.set_params(stage.clone())?;
        }
        Ok(())
    }

    fn forward(&mut self, training: bool) -> TesselResult<()> {
        self.input.forward()?;
        for y in 0..self.layers.len() {
            let (before, rest) = self.layers.split_at_mut(y);
            let prev = match before.last() {
                Some(layer) => layer.activations(),
                None => self.input.activations(),
            };
            rest[0].forward(prev, training);
        }
        Ok(())
    }

    fn backward(&mut self, target: f32) -> TesselResult<()> {
        for y in (0..self.layers.len()).rev() {
            let (before, rest) = self.layers.split_at_mut(y);
            match before.last_mut() {
                Some(prev) => {
                    let (activations, errors) = prev.buffers_mut();
                    rest[0].backward(activations, Some(errors), target)?;
                }
                None => rest[0].backward(self.input.activations(), None, target)?,
            }
        }
        Ok(())
    }

    /// One training step on the current row: forward through every stage, clear the hidden
    /// stages' errors, then backward from the output. Rows with a missing target are skipped
    /// after the forward pass.
    pub fn step(&mut self) -> TesselResult<()> {
        self.forward(true)?;
        let target = self.input.target();
        if target.is_nan() {
            return Ok(());
        }
        let hidden = self.layers.len() - 1;
        self.layers[..hidden].iter_mut().for_each(|l| l.clear_errors());
        self.backward(target)
    }

    /// Forward the current row without training and return the output activations.
    pub fn predict(&mut self) -> TesselResult<&[f32]> {
        self.forward(false)?;
        Ok(self.output().activations())
    }

    /// Anneal the learning rate and ramp momentum of every stage for `samples` processed rows.
    pub fn adjust(&mut self, samples: u64) {
        for layer in self.layers.iter_mut() {
            layer.anneal(samples);
            layer.momentum(samples);
        }
    }

    /// A copy with private buffers whose parameters alias this pipeline's.
    pub fn replicate(&self) -> TesselResult<Pipeline> {
        self.replicate_with_input(self.input.boxed_clone(), 0)
    }

    /// Like [`Pipeline::replicate`], reading from `input` instead.
    pub fn replicate_with_input(&self, input: Box<dyn Input>, samples: u64) -> TesselResult<Pipeline> {
        if input.width() != self.input.width() {
            tessel_bail!(
                InvalidArgument: "input of width {} for a pipeline of width {}",
                input.width(),
                self.input.width()
            );
        }
        let mut pipeline = Self {
            input,
            layers: self.layers.iter().map(|l| l.boxed_clone()).collect(),
        };
        pipeline.alias_params(&self.params())?;
        pipeline.bind(samples)?;
        Ok(pipeline)
    }

    /// An independent copy, parameters included.
    pub fn deep_clone(&self) -> Pipeline {
        Self {
            input: self.input.boxed_clone(),
            layers: self.layers.iter().map(|l| l.boxed_clone()).collect(),
        }
    }
}
