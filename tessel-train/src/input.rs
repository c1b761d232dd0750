use std::sync::Arc;

use tessel_chunk::Chunk;
use tessel_error::{TesselResult, tessel_bail};

/// The first stage of a pipeline: a cursor over training rows.
pub trait Input: Send {
    /// Number of features loaded per row.
    fn width(&self) -> usize;

    /// Number of rows.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(&self) -> u64;

    fn seek(&mut self, position: u64);

    /// Move to the next row, wrapping around at the end.
    fn advance(&mut self) {
        let next = self.position() + 1;
        self.seek(if next >= self.len() { 0 } else { next });
    }

    /// Load the features of the current row.
    fn forward(&mut self) -> TesselResult<()>;

    fn activations(&self) -> &[f32];

    /// The label or response of the current row, `NaN` if missing.
    fn target(&self) -> f32;

    fn boxed_clone(&self) -> Box<dyn Input>;
}

/// Row-major, in-memory training data.
#[derive(Debug, Clone)]
pub struct RowsInput {
    features: Arc<[f32]>,
    targets: Arc<[f32]>,
    width: usize,
    position: u64,
    activations: Vec<f32>,
}

impl RowsInput {
    pub fn try_new(features: Vec<f32>, targets: Vec<f32>, width: usize) -> TesselResult<Self> {
        if width == 0 || features.len() != targets.len() * width {
            tessel_bail!(
                InvalidArgument: "{} features do not form {} rows of width {width}",
                features.len(),
                targets.len()
            );
        }
        Ok(Self {
            features: features.into(),
            targets: targets.into(),
            width,
            position: 0,
            activations: vec![0.0; width],
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn row(&self) -> usize {
        self.position as usize
    }
}

impl Input for RowsInput {
    fn width(&self) -> usize {
        self.width
    }

    fn len(&self) -> u64 {
        self.targets.len() as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) {
        self.position = position;
    }

    fn forward(&mut self) -> TesselResult<()> {
        if self.position >= self.len() {
            tessel_bail!(OutOfBounds: self.position, 0, self.len());
        }
        let start = self.row() * self.width;
        self.activations
            .copy_from_slice(&self.features[start..start + self.width]);
        Ok(())
    }

    fn activations(&self) -> &[f32] {
        &self.activations
    }

    fn target(&self) -> f32 {
        self.targets.get(self.row()).copied().unwrap_or(f32::NAN)
    }

    fn boxed_clone(&self) -> Box<dyn Input> {
        Box::new(self.clone())
    }
}

/// The chunks of one chunk index across the feature and response columns.
#[derive(Debug)]
pub struct Batch {
    pub cidx: usize,
    pub features: Vec<Chunk>,
    pub response: Chunk,
}

impl Batch {
    pub fn try_new(features: Vec<Chunk>, response: Chunk) -> TesselResult<Self> {
        let cidx = response.cidx();
        if features
            .iter()
            .any(|c| c.cidx() != cidx || c.len() != response.len())
        {
            tessel_bail!(InvalidArgument: "batch chunks do not line up with response chunk {cidx}");
        }
        Ok(Self {
            cidx,
            features,
            response,
        })
    }

    pub fn len(&self) -> usize {
        self.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.response.is_empty()
    }
}

/// Training rows read from one [`Batch`] of column chunks. Missing features load as zero.
#[derive(Debug, Clone)]
pub struct ChunksInput {
    batch: Arc<Batch>,
    position: u64,
    activations: Vec<f32>,
}

impl ChunksInput {
    pub fn new(batch: Arc<Batch>) -> Self {
        Self {
            activations: vec![0.0; batch.features.len()],
            batch,
            position: 0,
        }
    }

    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    #[allow(clippy::cast_possible_truncation)]
    fn row(&self) -> usize {
        self.position as usize
    }
}

impl Input for ChunksInput {
    fn width(&self) -> usize {
        self.batch.features.len()
    }

    fn len(&self) -> u64 {
        self.batch.len() as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) {
        self.position = position;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn forward(&mut self) -> TesselResult<()> {
        let row = self.row();
        if row >= self.batch.len() {
            tessel_bail!(OutOfBounds: self.position, 0, self.len());
        }
        for (a, chunk) in self.activations.iter_mut().zip(&self.batch.features) {
            let value = chunk.at_local(row);
            *a = if value.is_nan() { 0.0 } else { value as f32 };
        }
        Ok(())
    }

    fn activations(&self) -> &[f32] {
        &self.activations
    }

    #[allow(clippy::cast_possible_truncation)]
    fn target(&self) -> f32 {
        if self.row() >= self.batch.len() {
            return f32::NAN;
        }
        self.batch.response.at_local(self.row()) as f32
    }

    fn boxed_clone(&self) -> Box<dyn Input> {
        Box::new(self.clone())
    }
}
