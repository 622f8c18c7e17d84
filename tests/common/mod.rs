#![allow(dead_code)]

use axum::Router;
use cerebrum::{
    Classifier, ClassifierError, Explainer, Explanation, NormalizedImageTensor, PredictionVector,
    explanation::ExplanationError,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, net::SocketAddr, path::PathBuf, time::Duration};

/// Deterministic stand-in for the trained network, mirrored by the unit tests
/// in `src/lib.rs`: the brightest channel wins, and the fourth category
/// absorbs the rest.
pub struct BrightestChannel;

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

/// Answers every question by echoing it.
pub struct EchoExplainer;

impl Explainer for EchoExplainer {
    async fn explain(&self, prompt: &str) -> Explanation {
        Explanation::Answer(format!("Disclaimer: echo. {prompt}"))
    }
}

/// Fails every request as an unreachable service would.
pub struct DownExplainer;

impl Explainer for DownExplainer {
    async fn explain(&self, _prompt: &str) -> Explanation {
        Explanation::Unavailable(ExplanationError::Network("connection refused".to_string()))
    }
}

/// Echoes like `EchoExplainer` after waiting for the given delay.
pub struct SlowExplainer(pub Duration);

impl Explainer for SlowExplainer {
    async fn explain(&self, prompt: &str) -> Explanation {
        tokio::time::sleep(self.0).await;
        Explanation::Answer(format!("Disclaimer: echo. {prompt}"))
    }
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn encode(color: [u8; 3], width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

/// Serves `app` on an ephemeral local port.
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
