pub mod classifier;
pub mod explanation;
pub mod presentation;
pub mod preprocess;
pub mod server;
pub mod session;

pub use classifier::{
    Classifier, ClassifierCell, ClassifierError, ModelStatus, OnnxClassifier, PredictionVector,
    TumorCategory,
};
pub use explanation::{Explainer, Explanation, ExplanationClient, ExplanationConfig};
pub use preprocess::{DecodeError, ImageMime, NormalizedImageTensor, UploadMetadata, UploadedImage};

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Errors that can stop a scan before a prediction is produced.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("inference failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Response returned by the pipeline containing both the prediction and telemetry data.
#[derive(Clone, Debug)]
pub struct CerebrumResponse {
    /// Unique identifier of the scan within this process.
    pub id: u64,
    /// Timestamp when the scan started.
    pub start_time: Instant,
    /// Total time taken to decode and classify the scan.
    pub duration: Duration,
    /// Lightweight metadata extracted from the upload.
    pub request_metadata: UploadMetadata,
    /// The classifier output.
    pub prediction: PredictionVector,
}

/// Preprocessing and classification of uploaded scans.
///
/// The classifier is built lazily on the first scan and then shared, read-only,
/// by every later one. `run` blocks the calling thread for the duration of the
/// forward pass; async callers should move it onto a blocking thread.
pub struct CerebrumPipeline<C: Classifier> {
    classifier: ClassifierCell<C>,
    id_counter: AtomicU64,
}

impl<C: Classifier> CerebrumPipeline<C> {
    /// Creates a new pipeline around a classifier slot.
    ///
    /// # Arguments
    /// * `classifier` - The slot that builds the classifier on first use
    pub fn new(classifier: ClassifierCell<C>) -> Self {
        Self {
            classifier,
            id_counter: AtomicU64::new(0),
        }
    }

    /// Whether the classifier has been constructed successfully.
    pub fn is_ready(&self) -> bool {
        self.classifier.is_ready()
    }

    pub fn model_status(&self) -> ModelStatus {
        self.classifier.status()
    }

    /// Builds the classifier now instead of on the first scan.
    pub fn warm_up(&self) -> Result<(), ClassifierError> {
        self.classifier.get().map(|_| ())
    }

    /// Decodes and classifies one upload.
    ///
    /// # Returns
    /// * `Ok` - The prediction with its telemetry data
    /// * `Err(Decode)` - The upload is not a usable image
    /// * `Err(Classifier)` - The model is missing or produced an invalid output
    /// * `Err(Model)` - The classifier implementation failed
    pub fn run(&self, upload: UploadedImage) -> Result<CerebrumResponse, PipelineError> {
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let request_metadata = upload.metadata();
        let start_time = Instant::now();

        log::debug!("Scan {} received ({} bytes)", id, request_metadata.byte_len);

        let tensor = preprocess::preprocess(&upload)?;
        drop(upload);

        let classifier = self.classifier.get()?;
        let prediction = classifier
            .predict(&tensor)
            .map_err(|e| PipelineError::Model(Box::new(e)))?;

        log::debug!(
            "Scan {} classified as {} ({:.4})",
            id,
            prediction.predicted(),
            prediction.confidence()
        );

        Ok(CerebrumResponse {
            id,
            start_time,
            duration: start_time.elapsed(),
            request_metadata,
            prediction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::{io::Cursor, path::PathBuf};

    /// Deterministic stand-in for the trained network, mirrored by the
    /// integration tests: the brightest channel wins, and the fourth category
    /// absorbs the rest.
    struct BrightestChannel;

    impl Classifier for BrightestChannel {
        type Error = ClassifierError;

        fn predict(&self, input: &NormalizedImageTensor) -> Result<PredictionVector, Self::Error> {
            let mut sums = [0.0f32; 3];
            for pixel in input.as_slice().chunks(3) {
                for (sum, value) in sums.iter_mut().zip(pixel) {
                    *sum += value;
                }
            }
            let scores = [sums[0], sums[1], sums[2], 1.0];
            let total: f32 = scores.iter().sum();
            PredictionVector::new(scores.map(|s| s / total))
        }
    }

    fn png(color: [u8; 3]) -> UploadedImage {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, _| {
            if x % 2 == 0 { Rgb(color) } else { Rgb([0, 0, 0]) }
        }));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        UploadedImage::new(buf.into_inner(), ImageMime::Png)
    }

    #[test]
    fn same_image_gives_the_same_prediction() {
        let pipeline = CerebrumPipeline::new(ClassifierCell::ready(BrightestChannel));
        let first = pipeline.run(png([200, 10, 10])).unwrap();
        let second = pipeline.run(png([200, 10, 10])).unwrap();

        assert_eq!(first.prediction, second.prediction);
        assert_eq!(first.prediction.predicted(), TumorCategory::Glioma);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn dominant_channel_drives_the_label() {
        let pipeline = CerebrumPipeline::new(ClassifierCell::ready(BrightestChannel));
        let prediction = pipeline.run(png([10, 10, 250])).unwrap().prediction;
        assert_eq!(prediction.predicted(), TumorCategory::Normal);
    }

    #[test]
    fn telemetry_describes_the_upload() {
        let pipeline = CerebrumPipeline::new(ClassifierCell::ready(BrightestChannel));
        let upload = png([1, 2, 3]);
        let len = upload.bytes().len();
        let response = pipeline.run(upload).unwrap();
        assert_eq!(response.request_metadata.byte_len, len);
        assert_eq!(response.request_metadata.mime, ImageMime::Png);
    }

    #[test]
    fn decode_errors_do_not_touch_the_model() {
        let pipeline: CerebrumPipeline<BrightestChannel> =
            CerebrumPipeline::new(ClassifierCell::new(|| Ok(BrightestChannel)));
        let result = pipeline.run(UploadedImage::new(b"nope".to_vec(), ImageMime::Jpeg));
        assert!(matches!(result, Err(PipelineError::Decode(_))));
        assert!(!pipeline.is_ready());
    }

    #[test]
    fn missing_model_is_reported_per_scan() {
        let pipeline: CerebrumPipeline<OnnxClassifier> =
            CerebrumPipeline::new(ClassifierCell::onnx(PathBuf::from("missing/brain_model.onnx")));
        assert!(matches!(
            pipeline.warm_up(),
            Err(ClassifierError::ModelNotFound(_))
        ));
        assert!(matches!(
            pipeline.run(png([5, 5, 5])),
            Err(PipelineError::Classifier(ClassifierError::ModelNotFound(_)))
        ));
    }
}
