#![warn(missing_docs)]
//! # capwatch-capture
//!
//! ## Purpose
//! Provides screen acquisition and the one-time capture permission gate.
//!
//! ## Responsibilities
//! - Define a backend-agnostic capture trait returning PNG bytes.
//! - Expose real primary-display capture on supported desktop targets.
//! - Expose deterministic synthetic capture for CI and unit tests.
//! - Ask for capture permission at most once per process.
//!
//! ## Data flow
//! [`ConsentGate`] decides whether scheduling may start at all. Each pipeline
//! run calls [`CaptureBackend::capture_png`] and persists the returned bytes.
//!
//! ## Ownership and lifetimes
//! Captured images own their encoded buffers; no OS frame memory escapes the
//! backend.
//!
//! ## Error model
//! Backend, encoding and prompt failures are reported as [`CaptureError`]. A
//! prompt failure counts as a denial.

use std::sync::{Mutex, OnceLock};

use image::ExtendedColorType;
use image::ImageEncoder;
use image::codecs::png::PngEncoder;
use thiserror::Error;
use tracing::{info, warn};

/// One encoded screen capture.
#[derive(Clone, PartialEq, Eq)]
pub struct CapturedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// PNG-encoded bytes.
    pub png: Vec<u8>,
}

impl std::fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("png_len", &self.png.len())
            .finish()
    }
}

/// Trait implemented by concrete capture providers.
///
/// Calls may block; async callers should move them off the event loop.
pub trait CaptureBackend: Send + Sync {
    /// Captures the primary display.
    ///
    /// # Errors
    /// Returns [`CaptureError`] when the OS call or encoding fails.
    fn capture_png(&self) -> Result<CapturedImage, CaptureError>;
}

/// Encodes an RGBA buffer as PNG.
///
/// # Errors
/// Returns [`CaptureError::InvalidFrame`] when the buffer length is not
/// `width * height * 4`, and [`CaptureError::Encode`] when encoding fails.
pub fn encode_png(width: u32, height: u32, rgba: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(4))
        .ok_or(CaptureError::InvalidFrame {
            expected: usize::MAX,
            actual: rgba.len(),
        })?;
    if expected == 0 || rgba.len() != expected {
        return Err(CaptureError::InvalidFrame {
            expected,
            actual: rgba.len(),
        });
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(rgba, width, height, ExtendedColorType::Rgba8)
        .map_err(|error| CaptureError::Encode(error.to_string()))?;
    Ok(png)
}

/// Primary-display capture for supported desktop targets.
#[derive(Debug, Clone, Default)]
pub struct RealCaptureBackend;

impl RealCaptureBackend {
    /// Creates the backend.
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for RealCaptureBackend {
    fn capture_png(&self) -> Result<CapturedImage, CaptureError> {
        #[cfg(any(windows, target_os = "macos"))]
        {
            use screenshots::Screen;

            let screens = Screen::all().map_err(|error| {
                CaptureError::Backend(format!("screen enumeration failed: {error}"))
            })?;
            let screen = screens
                .iter()
                .find(|screen| screen.display_info.is_primary)
                .or_else(|| screens.first())
                .ok_or_else(|| {
                    CaptureError::Backend("no displays were reported by the OS".to_string())
                })?;

            let captured = screen
                .capture()
                .map_err(|error| CaptureError::Backend(format!("screen capture failed: {error}")))?;
            let width = captured.width();
            let height = captured.height();
            let png = encode_png(width, height, &captured.into_raw())?;

            Ok(CapturedImage { width, height, png })
        }

        #[cfg(not(any(windows, target_os = "macos")))]
        {
            Err(CaptureError::Backend(
                "screen capture is implemented for Windows and macOS only".to_string(),
            ))
        }
    }
}

/// Deterministic synthetic backend for test and CI usage.
#[derive(Debug)]
pub struct SyntheticCaptureBackend {
    width: u32,
    height: u32,
    sequence: Mutex<u64>,
}

impl SyntheticCaptureBackend {
    /// Creates a backend producing 4x4 images.
    pub fn new() -> Self {
        Self::with_size(4, 4)
    }

    /// Creates a backend producing images of the given size.
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            sequence: Mutex::new(0),
        }
    }

    /// Returns how many captures were taken.
    pub fn captures_taken(&self) -> u64 {
        self.sequence.lock().map(|sequence| *sequence).unwrap_or(0)
    }
}

impl Default for SyntheticCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SyntheticCaptureBackend {
    fn capture_png(&self) -> Result<CapturedImage, CaptureError> {
        let mut sequence = self
            .sequence
            .lock()
            .map_err(|_| CaptureError::Backend("synthetic sequence lock poisoned".to_string()))?;
        *sequence += 1;

        let byte = (*sequence % 255) as u8;
        let rgba_len = (self.width as usize) * (self.height as usize) * 4;
        let png = encode_png(self.width, self.height, &vec![byte; rgba_len])?;

        Ok(CapturedImage {
            width: self.width,
            height: self.height,
            png,
        })
    }
}

/// Source of the yes/no capture permission answer.
pub trait ConsentPrompt: Send + Sync {
    /// Asks the user once.
    ///
    /// # Errors
    /// Returns [`CaptureError::Prompt`] when no answer could be obtained.
    fn ask(&self) -> Result<bool, CaptureError>;
}

/// Answer fixed by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetConsent(pub bool);

impl ConsentPrompt for PresetConsent {
    fn ask(&self) -> Result<bool, CaptureError> {
        Ok(self.0)
    }
}

/// Interactive terminal prompt.
#[derive(Debug, Clone)]
pub struct TerminalConsent {
    prompt: String,
}

impl TerminalConsent {
    /// Creates a prompt with the given question.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Default for TerminalConsent {
    fn default() -> Self {
        Self::new("Allow periodic screen captures while your timer is running?")
    }
}

impl ConsentPrompt for TerminalConsent {
    fn ask(&self) -> Result<bool, CaptureError> {
        dialoguer::Confirm::new()
            .with_prompt(&self.prompt)
            .default(false)
            .interact()
            .map_err(|error| CaptureError::Prompt(error.to_string()))
    }
}

/// One-time permission gate. The first answer holds for the process lifetime.
pub struct ConsentGate {
    prompt: Box<dyn ConsentPrompt>,
    decision: OnceLock<bool>,
}

impl std::fmt::Debug for ConsentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentGate")
            .field("decision", &self.decision.get())
            .finish()
    }
}

impl ConsentGate {
    /// Wraps a prompt.
    pub fn new(prompt: impl ConsentPrompt + 'static) -> Self {
        Self {
            prompt: Box::new(prompt),
            decision: OnceLock::new(),
        }
    }

    /// Returns the decision, prompting only on the first call.
    pub fn is_granted(&self) -> bool {
        *self.decision.get_or_init(|| match self.prompt.ask() {
            Ok(granted) => {
                info!(stage = "consent", action = "answered", granted);
                granted
            }
            Err(error) => {
                warn!(stage = "consent", action = "prompt_failed", %error, "treating as denied");
                false
            }
        })
    }

    /// Returns the recorded decision without prompting.
    pub fn decision(&self) -> Option<bool> {
        self.decision.get().copied()
    }
}

/// Capture layer error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// Pixel buffer does not match declared geometry.
    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame {
        /// Expected RGBA byte count.
        expected: usize,
        /// Actual RGBA byte count.
        actual: usize,
    },
    /// PNG encoding failed.
    #[error("png encoding failed: {0}")]
    Encode(String),
    /// Backend runtime failure.
    #[error("capture backend failure: {0}")]
    Backend(String),
    /// Permission prompt could not be shown or answered.
    #[error("consent prompt failed: {0}")]
    Prompt(String),
}

#[cfg(test)]
mod tests {
    //! Unit tests for synthetic capture and the consent gate.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    struct CountingPrompt {
        answer: bool,
        asked: Arc<AtomicUsize>,
    }

    impl ConsentPrompt for CountingPrompt {
        fn ask(&self) -> Result<bool, CaptureError> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct BrokenPrompt;

    impl ConsentPrompt for BrokenPrompt {
        fn ask(&self) -> Result<bool, CaptureError> {
            Err(CaptureError::Prompt("not a terminal".to_string()))
        }
    }

    #[test]
    fn synthetic_backend_produces_png() {
        let backend = SyntheticCaptureBackend::new();
        let image = backend.capture_png().expect("capture should work");
        assert_eq!((image.width, image.height), (4, 4));
        assert_eq!(image.png[..8], PNG_SIGNATURE);
        assert_eq!(backend.captures_taken(), 1);
    }

    #[test]
    fn encode_rejects_mismatched_buffers() {
        assert_eq!(
            encode_png(2, 2, &[0; 15]),
            Err(CaptureError::InvalidFrame {
                expected: 16,
                actual: 15
            })
        );
        assert!(encode_png(0, 0, &[]).is_err());
    }

    #[test]
    fn denial_is_remembered_without_reprompting() {
        let asked = Arc::new(AtomicUsize::new(0));
        let gate = ConsentGate::new(CountingPrompt {
            answer: false,
            asked: asked.clone(),
        });

        assert_eq!(gate.decision(), None);
        assert!(!gate.is_granted());
        assert!(!gate.is_granted());
        assert_eq!(gate.decision(), Some(false));
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prompt_failure_counts_as_denial() {
        let gate = ConsentGate::new(BrokenPrompt);
        assert!(!gate.is_granted());
        assert!(ConsentGate::new(PresetConsent(true)).is_granted());
    }
}
