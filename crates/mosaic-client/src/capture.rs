//! Capture devices.
//!
//! Platform webcam/microphone drivers are external collaborators; the
//! client only needs this small capability seam. The synthetic devices
//! below stand in for them: a moving test pattern and a steady tone,
//! which make multi-party testing possible on machines with no camera.

use std::time::Duration;

use tracing::warn;

use mosaic_core::errors::CoreError;
use mosaic_render::RgbImage;

/// A video source: open once, pull frames, close.
pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<(), CoreError>;
    /// Blocks until the next frame at the device's native rate.
    fn read_frame(&mut self) -> Result<RgbImage, CoreError>;
    fn close(&mut self);
}

/// An audio source producing mono f32 blocks.
pub trait AudioCapture: Send {
    fn open(&mut self) -> Result<(), CoreError>;
    fn read_batch(&mut self) -> Result<Vec<f32>, CoreError>;
    fn close(&mut self);
}

/// Retry policy for flaky devices: exponential backoff, then give up
/// with a capture error (exit code 5 at the top level).
pub const CAPTURE_RETRIES: u32 = 5;

pub fn with_backoff<T>(
    mut attempt: impl FnMut() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let mut delay = Duration::from_millis(100);
    let mut last_err = None;
    for try_no in 0..CAPTURE_RETRIES {
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(try_no, error = %e, "capture attempt failed");
                last_err = Some(e);
                std::thread::sleep(delay);
                delay *= 2;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::Capture("device never opened".into())))
}

/// Synthetic webcam: a horizontally scrolling gradient with a bright
/// identity square, distinct per participant.
pub struct TestPatternCamera {
    width: usize,
    height: usize,
    fps: u32,
    tick: u64,
    seed: u8,
    open: bool,
}

impl TestPatternCamera {
    pub fn new(width: usize, height: usize, fps: u32, seed: u8) -> Self {
        TestPatternCamera { width, height, fps: fps.max(1), tick: 0, seed, open: false }
    }
}

impl CaptureDevice for TestPatternCamera {
    fn open(&mut self) -> Result<(), CoreError> {
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage, CoreError> {
        if !self.open {
            return Err(CoreError::Capture("camera not open".into()));
        }
        std::thread::sleep(Duration::from_secs(1) / self.fps);
        self.tick = self.tick.wrapping_add(1);

        let mut img = RgbImage::new(self.width, self.height)
            .map_err(|e| CoreError::Capture(e.to_string()))?;
        let shift = (self.tick * 3) as usize;
        for y in 0..self.height {
            for x in 0..self.width {
                let g = (((x + shift) * 255) / self.width.max(1)) as u8;
                img.set_pixel(x, y, [g, g.wrapping_add(self.seed), (y * 255 / self.height) as u8]);
            }
        }
        // Identity square in the top-left corner.
        let side = (self.width.min(self.height) / 4).max(1);
        for y in 0..side {
            for x in 0..side {
                img.set_pixel(x, y, [255, self.seed, 255u8.wrapping_sub(self.seed)]);
            }
        }
        Ok(img)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Synthetic microphone: a quiet sine tone in 20 ms blocks.
pub struct ToneMic {
    sample_rate: u32,
    phase: f32,
    freq: f32,
    amplitude: f32,
    open: bool,
}

impl ToneMic {
    pub fn new(sample_rate: u32, freq: f32, amplitude: f32) -> Self {
        ToneMic { sample_rate, phase: 0.0, freq, amplitude, open: false }
    }
}

impl AudioCapture for ToneMic {
    fn open(&mut self) -> Result<(), CoreError> {
        self.open = true;
        Ok(())
    }

    fn read_batch(&mut self) -> Result<Vec<f32>, CoreError> {
        if !self.open {
            return Err(CoreError::Capture("microphone not open".into()));
        }
        std::thread::sleep(Duration::from_millis(20));
        let block = (self.sample_rate as usize / 1000) * 20;
        let step = std::f32::consts::TAU * self.freq / self.sample_rate as f32;
        let mut out = Vec::with_capacity(block);
        for _ in 0..block {
            out.push(self.phase.sin() * self.amplitude);
            self.phase = (self.phase + step) % std::f32::consts::TAU;
        }
        Ok(out)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_requires_open() {
        let mut cam = TestPatternCamera::new(8, 8, 1000, 7);
        assert!(cam.read_frame().is_err());
        cam.open().unwrap();
        let frame = cam.read_frame().unwrap();
        assert_eq!(frame.width(), 8);
        cam.close();
        assert!(cam.read_frame().is_err());
    }

    #[test]
    fn pattern_moves_between_frames() {
        let mut cam = TestPatternCamera::new(16, 8, 1000, 1);
        cam.open().unwrap();
        let a = cam.read_frame().unwrap();
        let b = cam.read_frame().unwrap();
        assert_ne!(a.data(), b.data());
    }

    #[test]
    fn tone_mic_is_bounded_and_periodic() {
        let mut mic = ToneMic::new(48_000, 440.0, 0.25);
        mic.open().unwrap();
        let batch = mic.read_batch().unwrap();
        assert_eq!(batch.len(), 960);
        assert!(batch.iter().all(|s| s.abs() <= 0.25 + 1e-6));
        assert!(batch.iter().any(|s| s.abs() > 0.2));
    }

    #[test]
    fn backoff_gives_up_after_retries() {
        let mut calls = 0;
        let result: Result<(), CoreError> = with_backoff(|| {
            calls += 1;
            Err(CoreError::Capture("busy".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, CAPTURE_RETRIES);
    }

    #[test]
    fn backoff_returns_first_success() {
        let mut calls = 0;
        let result = with_backoff(|| {
            calls += 1;
            if calls < 3 {
                Err(CoreError::Capture("warming up".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }
}
