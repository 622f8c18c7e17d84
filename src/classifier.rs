use crate::preprocess::{CHANNELS, IMAGE_SIDE, INPUT_SHAPE, NormalizedImageTensor};
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};
use tract_onnx::prelude::*;

/// Number of categories the classifier distinguishes.
pub const NUM_CLASSES: usize = 4;

/// Allowed distance between the sum of a prediction and 1.0.
pub const SUM_TOLERANCE: f32 = 1e-3;

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Trait for classifiers that can be served by the `CerebrumPipeline`.
///
/// Implementations are shared read-only between requests, so inference takes
/// `&self`.
pub trait Classifier {
    /// The error type that can be returned during inference.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs one forward pass over a normalized scan.
    fn predict(&self, input: &NormalizedImageTensor) -> Result<PredictionVector, Self::Error>;
}

/// Errors raised while loading or running the classifier.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("failed to load model {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
    #[error("model output shape {found:?} is not a 4-way classification")]
    IncompatibleArtifact { found: Vec<usize> },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid prediction: {0}")]
    InvalidOutput(String),
}

/// The fixed label set, in model output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TumorCategory {
    Glioma,
    Meningioma,
    Normal,
    Pituitary,
}

impl TumorCategory {
    pub const ALL: [TumorCategory; NUM_CLASSES] = [
        TumorCategory::Glioma,
        TumorCategory::Meningioma,
        TumorCategory::Normal,
        TumorCategory::Pituitary,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(&self) -> usize {
        match self {
            TumorCategory::Glioma => 0,
            TumorCategory::Meningioma => 1,
            TumorCategory::Normal => 2,
            TumorCategory::Pituitary => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TumorCategory::Glioma => "Glioma",
            TumorCategory::Meningioma => "Meningioma",
            TumorCategory::Normal => "Normal",
            TumorCategory::Pituitary => "Pituitary",
        }
    }

    pub fn is_tumor(&self) -> bool {
        *self != TumorCategory::Normal
    }
}

impl fmt::Display for TumorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A probability distribution over the four categories.
///
/// Every value lies in `[0, 1]` and the values sum to 1 within
/// `SUM_TOLERANCE`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PredictionVector {
    probabilities: [f32; NUM_CLASSES],
}

impl PredictionVector {
    pub fn new(probabilities: [f32; NUM_CLASSES]) -> Result<Self, ClassifierError> {
        if let Some(bad) = probabilities
            .iter()
            .find(|p| !p.is_finite() || !(0.0..=1.0).contains(*p))
        {
            return Err(ClassifierError::InvalidOutput(format!(
                "probability {bad} is outside [0, 1]"
            )));
        }

        let sum: f32 = probabilities.iter().sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(ClassifierError::InvalidOutput(format!(
                "probabilities sum to {sum}"
            )));
        }

        Ok(Self { probabilities })
    }

    pub fn from_slice(values: &[f32]) -> Result<Self, ClassifierError> {
        let probabilities: [f32; NUM_CLASSES] = values.try_into().map_err(|_| {
            ClassifierError::InvalidOutput(format!(
                "expected {NUM_CLASSES} values, got {}",
                values.len()
            ))
        })?;
        Self::new(probabilities)
    }

    pub fn probabilities(&self) -> &[f32; NUM_CLASSES] {
        &self.probabilities
    }

    pub fn score(&self, category: TumorCategory) -> f32 {
        self.probabilities[category.index()]
    }

    /// The argmax category; the lowest index wins a tie.
    pub fn predicted(&self) -> TumorCategory {
        let mut best = 0;
        for (index, value) in self.probabilities.iter().enumerate().skip(1) {
            if *value > self.probabilities[best] {
                best = index;
            }
        }
        TumorCategory::ALL[best]
    }

    pub fn confidence(&self) -> f32 {
        self.score(self.predicted())
    }

    pub fn iter(&self) -> impl Iterator<Item = (TumorCategory, f32)> + '_ {
        TumorCategory::ALL
            .iter()
            .copied()
            .zip(self.probabilities.iter().copied())
    }
}

/// A classifier backed by an ONNX export of the trained network.
pub struct OnnxClassifier {
    plan: OnnxPlan,
}

impl OnnxClassifier {
    /// Loads and optimizes the model at `path`.
    ///
    /// Fails with `ModelNotFound` when the file does not exist, and with
    /// `IncompatibleArtifact` when its output is known not to be 4-way.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ClassifierError::ModelNotFound(path.to_path_buf()));
        }

        let load_error = |e: TractError| ClassifierError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, IMAGE_SIDE, IMAGE_SIDE, CHANNELS),
                    ),
                )
            })
            .and_then(|model| model.into_optimized())
            .map_err(load_error)?;

        let output_shape = model
            .output_fact(0)
            .map_err(load_error)?
            .shape
            .as_concrete()
            .map(|dims| dims.to_vec());
        if let Some(dims) = output_shape {
            if dims.last() != Some(&NUM_CLASSES) {
                return Err(ClassifierError::IncompatibleArtifact { found: dims });
            }
        }

        let plan = model.into_runnable().map_err(load_error)?;
        log::info!("Loaded classifier from {}", path.display());

        Ok(Self { plan })
    }
}

impl Classifier for OnnxClassifier {
    type Error = ClassifierError;

    fn predict(&self, input: &NormalizedImageTensor) -> Result<PredictionVector, Self::Error> {
        let tensor = Tensor::from_shape(&INPUT_SHAPE, input.as_slice())
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;
        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let output = outputs
            .first()
            .ok_or_else(|| ClassifierError::Inference("model returned no outputs".to_string()))?;
        let values: Vec<f32> = output
            .to_array_view::<f32>()
            .map_err(|e| ClassifierError::Inference(e.to_string()))?
            .iter()
            .copied()
            .collect();

        PredictionVector::from_slice(&values)
    }
}

/// Whether the classifier slot has been filled, and how.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelStatus {
    NotLoaded,
    Ready,
    Unavailable,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::NotLoaded => "not_loaded",
            ModelStatus::Ready => "ready",
            ModelStatus::Unavailable => "unavailable",
        }
    }
}

type Loader<C> = Box<dyn Fn() -> Result<C, ClassifierError> + Send + Sync>;

/// Process-wide slot holding the classifier.
///
/// The loader runs at most once, on the first `get`. Its outcome, including a
/// failure, is kept for the lifetime of the cell.
pub struct ClassifierCell<C> {
    loader: Loader<C>,
    slot: OnceLock<Result<Arc<C>, ClassifierError>>,
}

impl<C> ClassifierCell<C> {
    pub fn new(loader: impl Fn() -> Result<C, ClassifierError> + Send + Sync + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slot: OnceLock::new(),
        }
    }

    /// Wraps an already constructed classifier.
    pub fn ready(classifier: C) -> Self {
        let slot = OnceLock::new();
        let _ = slot.set(Ok(Arc::new(classifier)));
        Self {
            loader: Box::new(|| Err(ClassifierError::Load {
                path: PathBuf::new(),
                reason: "classifier was provided pre-built".to_string(),
            })),
            slot,
        }
    }

    pub fn get(&self) -> Result<Arc<C>, ClassifierError> {
        self.slot
            .get_or_init(|| {
                log::debug!("Constructing the classifier");
                let loaded = (self.loader)().map(Arc::new);
                if let Err(e) = &loaded {
                    log::error!("Classifier unavailable: {}", e);
                }
                loaded
            })
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.slot.get(), Some(Ok(_)))
    }

    pub fn status(&self) -> ModelStatus {
        match self.slot.get() {
            None => ModelStatus::NotLoaded,
            Some(Ok(_)) => ModelStatus::Ready,
            Some(Err(_)) => ModelStatus::Unavailable,
        }
    }
}

impl ClassifierCell<OnnxClassifier> {
    pub fn onnx(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(move || OnnxClassifier::load(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(PredictionVector);

    impl Classifier for Fixed {
        type Error = ClassifierError;

        fn predict(&self, _: &NormalizedImageTensor) -> Result<PredictionVector, Self::Error> {
            Ok(self.0)
        }
    }

    #[test]
    fn labels_follow_model_output_order() {
        for (index, category) in TumorCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), index);
            assert_eq!(TumorCategory::from_index(index), Some(*category));
        }
        assert_eq!(TumorCategory::from_index(4), None);
        assert_eq!(TumorCategory::Glioma.to_string(), "Glioma");
        assert!(!TumorCategory::Normal.is_tumor());
        assert!(TumorCategory::Pituitary.is_tumor());
    }

    #[test]
    fn argmax_and_confidence() {
        let p = PredictionVector::new([0.1, 0.2, 0.6, 0.1]).unwrap();
        assert_eq!(p.predicted(), TumorCategory::Normal);
        assert!((p.confidence() - 0.6).abs() < 1e-6);
        assert!((p.iter().map(|(_, v)| v).sum::<f32>() - 1.0).abs() < SUM_TOLERANCE);
    }

    #[test]
    fn ties_go_to_the_lowest_index() {
        let p = PredictionVector::new([0.1, 0.4, 0.1, 0.4]).unwrap();
        assert_eq!(p.predicted(), TumorCategory::Meningioma);
    }

    #[test]
    fn invalid_distributions_are_rejected() {
        assert!(PredictionVector::new([0.5, 0.5, 0.5, 0.5]).is_err());
        assert!(PredictionVector::new([1.2, -0.2, 0.0, 0.0]).is_err());
        assert!(PredictionVector::new([f32::NAN, 0.0, 0.0, 1.0]).is_err());
        assert!(PredictionVector::from_slice(&[0.5, 0.5]).is_err());
        assert!(PredictionVector::from_slice(&[0.25, 0.25, 0.25, 0.2505]).is_ok());
    }

    #[test]
    fn cell_constructs_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cell = ClassifierCell::new({
            let loads = loads.clone();
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Fixed(PredictionVector::new([1.0, 0.0, 0.0, 0.0])?))
            }
        });

        assert_eq!(cell.status(), ModelStatus::NotLoaded);
        let first = cell.get().unwrap();
        let second = cell.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cell.is_ready());
    }

    #[test]
    fn failed_load_is_not_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cell: ClassifierCell<Fixed> = ClassifierCell::new({
            let loads = loads.clone();
            move || {
                loads.fetch_add(1, Ordering::SeqCst);
                Err(ClassifierError::ModelNotFound(PathBuf::from("missing.onnx")))
            }
        });

        assert!(matches!(cell.get(), Err(ClassifierError::ModelNotFound(_))));
        assert!(matches!(cell.get(), Err(ClassifierError::ModelNotFound(_))));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!cell.is_ready());
        assert_eq!(cell.status(), ModelStatus::Unavailable);
    }

    #[test]
    fn missing_artifact_is_reported() {
        let result = OnnxClassifier::load("definitely/not/here/brain_model.onnx");
        match result {
            Err(ClassifierError::ModelNotFound(path)) => {
                assert!(path.ends_with("brain_model.onnx"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loading a missing model succeeded"),
        }
    }

    #[test]
    fn ready_cell_skips_the_loader() {
        let cell = ClassifierCell::ready(Fixed(PredictionVector::new([0.0, 0.0, 0.0, 1.0]).unwrap()));
        assert!(cell.is_ready());
        let tensor = NormalizedImageTensor::blank();
        let prediction = cell.get().unwrap().predict(&tensor).unwrap();
        assert_eq!(prediction.predicted(), TumorCategory::Pituitary);
    }
}
