use anyhow::Result;

/// Caption probabilities for one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub whale: f32,
    pub no_whale: f32,
}

impl Verdict {
    /// Strictly greater: an exact tie is not a whale.
    pub fn is_whale(&self) -> bool {
        self.whale > self.no_whale
    }
}

/// Pluggable whale detector
pub trait WhaleDetector {
    /// Scores encoded image bytes (PNG, JPEG, ...) against the whale captions
    fn score(&self, image: &[u8]) -> Result<Verdict>;

    fn is_whale(&self, image: &[u8]) -> Result<bool> {
        Ok(self.score(image)?.is_whale())
    }
}

mod clip;

pub use clip::ClipDetector;
