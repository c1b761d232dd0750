use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use itertools::izip;
use tessel_error::{TesselResult, tessel_bail};

/// A shared array of `f32` parameters.
///
/// Clones alias the same storage. Reads and writes are individually atomic but a
/// read-modify-write is not: concurrent updates to the same element may be lost. Trainers rely
/// on that trade-off to update weights from many threads without locking.
#[derive(Clone)]
pub struct Params(Arc<[AtomicU32]>);

impl Params {
    pub fn zeros(len: usize) -> Self {
        Self((0..len).map(|_| AtomicU32::new(0)).collect())
    }

    pub fn from_slice(values: &[f32]) -> Self {
        Self(values.iter().map(|v| AtomicU32::new(v.to_bits())).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> f32 {
        f32::from_bits(self.0[idx].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, idx: usize, value: f32) {
        self.0[idx].store(value.to_bits(), Ordering::Relaxed)
    }

    /// Racy `self[idx] += delta`.
    #[inline]
    pub fn add(&self, idx: usize, delta: f32) {
        self.set(idx, self.get(idx) + delta)
    }

    pub fn to_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|idx| self.get(idx)).collect()
    }

    /// An independent copy of the current values.
    pub fn deep_clone(&self) -> Self {
        Self::from_slice(&self.to_vec())
    }

    /// True if both handles refer to the same storage.
    pub fn aliases(&self, other: &Params) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Params {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries((0..self.len()).map(|i| self.get(i))).finish()
    }
}

/// Plain weight and bias values of one stage, as exchanged between nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageValues {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

/// The weights and biases of one pipeline stage.
#[derive(Debug, Clone)]
pub struct StageParams {
    pub weights: Params,
    pub biases: Params,
}

impl StageParams {
    pub fn zeros(weights: usize, biases: usize) -> Self {
        Self {
            weights: Params::zeros(weights),
            biases: Params::zeros(biases),
        }
    }

    pub fn deep_clone(&self) -> Self {
        Self {
            weights: self.weights.deep_clone(),
            biases: self.biases.deep_clone(),
        }
    }

    pub fn values(&self) -> StageValues {
        StageValues {
            weights: self.weights.to_vec(),
            biases: self.biases.to_vec(),
        }
    }

    fn same_shape(&self, other: &StageValues) -> bool {
        self.weights.len() == other.weights.len() && self.biases.len() == other.biases.len()
    }
}

/// The parameters of every weighted stage of a pipeline, in pipeline order.
#[derive(Debug, Clone, Default)]
pub struct ModelParams(Vec<StageParams>);

impl ModelParams {
    pub fn new(stages: Vec<StageParams>) -> Self {
        Self(stages)
    }

    pub fn stages(&self) -> &[StageParams] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn deep_clone(&self) -> Self {
        Self(self.0.iter().map(StageParams::deep_clone).collect())
    }

    pub fn values(&self) -> Vec<StageValues> {
        self.0.iter().map(StageParams::values).collect()
    }

    pub fn aliases(&self, other: &ModelParams) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.weights.aliases(&b.weights) && a.biases.aliases(&b.biases))
    }

    /// Fail unless `values` has the same stage layout as these parameters.
    pub fn check_shape(&self, values: &[StageValues]) -> TesselResult<()> {
        if self.0.len() != values.len() || !self.0.iter().zip(values).all(|(s, v)| s.same_shape(v)) {
            tessel_bail!(
                InvalidArgument: "parameter layout mismatch: {} stages against {}",
                values.len(),
                self.0.len()
            );
        }
        Ok(())
    }

    /// Element-wise `self += deltas`.
    pub fn add(&self, deltas: &[StageValues]) -> TesselResult<()> {
        self.check_shape(deltas)?;
        for (stage, delta) in self.0.iter().zip(deltas) {
            delta.weights.iter().enumerate().for_each(|(i, d)| stage.weights.add(i, *d));
            delta.biases.iter().enumerate().for_each(|(i, d)| stage.biases.add(i, *d));
        }
        Ok(())
    }

    /// Return `self - snapshot` and move `snapshot` up to the current values.
    pub fn take_delta(&self, snapshot: &ModelParams) -> Vec<StageValues> {
        self.0
            .iter()
            .zip(&snapshot.0)
            .map(|(local, snap)| StageValues {
                weights: take_delta(&local.weights, &snap.weights),
                biases: take_delta(&local.biases, &snap.biases),
            })
            .collect()
    }

    /// Adopt `merged` while keeping local progress made since `snapshot` was taken.
    ///
    /// Every element becomes `merged + (local - snapshot)` and the snapshot becomes `merged`.
    pub fn rebase(&self, snapshot: &ModelParams, merged: &[StageValues]) -> TesselResult<()> {
        self.check_shape(merged)?;
        for (local, snap, merged) in izip!(&self.0, &snapshot.0, merged) {
            rebase(&local.weights, &snap.weights, &merged.weights);
            rebase(&local.biases, &snap.biases, &merged.biases);
        }
        Ok(())
    }
}

fn take_delta(local: &Params, snapshot: &Params) -> Vec<f32> {
    (0..local.len())
        .map(|i| {
            let current = local.get(i);
            let delta = current - snapshot.get(i);
            snapshot.set(i, current);
            delta
        })
        .collect()
}

fn rebase(local: &Params, snapshot: &Params, merged: &[f32]) {
    for (i, m) in merged.iter().enumerate() {
        let progress = local.get(i) - snapshot.get(i);
        snapshot.set(i, *m);
        local.set(i, m + progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(weights: &[f32], biases: &[f32]) -> ModelParams {
        ModelParams::new(vec![StageParams {
            weights: Params::from_slice(weights),
            biases: Params::from_slice(biases),
        }])
    }

    #[test]
    fn clones_alias_deep_clones_do_not() {
        let params = Params::from_slice(&[1.0, 2.0]);
        let alias = params.clone();
        let copy = params.deep_clone();
        alias.add(0, 0.5);
        assert_eq!(params.get(0), 1.5);
        assert_eq!(copy.get(0), 1.0);
        assert!(params.aliases(&alias));
        assert!(!params.aliases(&copy));
    }

    #[test]
    fn delta_then_rebase_keeps_in_flight_progress() {
        let local = model(&[1.0, 1.0], &[0.0]);
        let snapshot = local.deep_clone();
        local.add(&[StageValues {
            weights: vec![0.5, 0.0],
            biases: vec![1.0],
        }])
        .unwrap();

        let delta = local.take_delta(&snapshot);
        assert_eq!(delta[0].weights, vec![0.5, 0.0]);
        assert_eq!(snapshot.values(), local.values());

        // Progress made while the delta was in flight.
        local.stages()[0].weights.add(1, 0.25);

        let merged = vec![StageValues {
            weights: vec![10.0, 20.0],
            biases: vec![30.0],
        }];
        local.rebase(&snapshot, &merged).unwrap();
        assert_eq!(snapshot.values(), merged);
        assert_eq!(local.values()[0].weights, vec![10.0, 20.25]);
        assert_eq!(local.values()[0].biases, vec![30.0]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let params = model(&[1.0], &[1.0]);
        assert!(params.add(&[]).is_err());
        assert!(
            params
                .add(&[StageValues {
                    weights: vec![1.0, 2.0],
                    biases: vec![1.0],
                }])
                .is_err()
        );
        assert_eq!(params.values()[0].weights, vec![1.0]);
    }
}
