//! Frame-difference motion detector.
//!
//! Keeps a downscaled, blurred grayscale copy of the last processed frame
//! and compares each new processed frame against it: absolute difference,
//! binary threshold, one dilation pass, then external contours. Motion is
//! declared when any contour covers at least `min_area` pixels at detect
//! resolution.
//!
//! Detection is decimated: only every `skip_frames`-th frame is processed.
//! A skipped frame yields [`Decision::Skipped`], which is distinct from
//! "no motion" and must not advance the recording state machine.

use std::time::Instant;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::dilate;
use imageproc::point::Point;
use tracing::debug;

use crate::config::MotionConfig;
use crate::stream::Frame;

/// Idle cycles after which the worker may stretch its sleep interval.
const LONG_IDLE_CYCLES: u32 = 50;

/// Interval between performance stat log lines.
const STATS_INTERVAL_SECS: u64 = 60;

/// Three-valued detection outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Motion,
    NoMotion,
    /// Frame fell outside the detection cadence; carries no information.
    Skipped,
}

pub struct MotionDetector {
    threshold: u8,
    min_area: u32,
    skip_frames: u32,
    detect_width: u32,
    detect_height: u32,
    blur_sigma: f32,
    frame_counter: u64,
    frames_processed: u64,
    consecutive_no_motion: u32,
    previous_gray: Option<GrayImage>,
    started: Instant,
    last_stats: Instant,
}

impl MotionDetector {
    pub fn new(cfg: &MotionConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            min_area: cfg.min_area,
            skip_frames: cfg.skip_frames.max(1),
            detect_width: cfg.detect_width,
            detect_height: cfg.detect_height,
            // Common kernel-to-sigma mapping for a Gaussian that fits the kernel.
            blur_sigma: cfg.blur_kernel as f32 / 6.0,
            frame_counter: 0,
            frames_processed: 0,
            consecutive_no_motion: 0,
            previous_gray: None,
            started: Instant::now(),
            last_stats: Instant::now(),
        }
    }

    /// Seed the reference frame. Called once with the first decoded frame.
    pub fn initialize(&mut self, frame: &Frame) {
        self.previous_gray = Some(self.prepare(frame));
    }

    /// Run one frame through the decimated detection pipeline.
    pub fn process(&mut self, frame: &Frame) -> Decision {
        self.frame_counter += 1;
        if self.frame_counter % self.skip_frames as u64 != 0 {
            return Decision::Skipped;
        }
        self.frames_processed += 1;

        let current = self.prepare(frame);
        let Some(previous) = self.previous_gray.as_ref() else {
            self.previous_gray = Some(current);
            return Decision::Skipped;
        };

        let delta = abs_diff(previous, &current);
        let mask = binary_threshold(&delta, self.threshold);
        let mask = dilate(&mask, Norm::LInf, 1);

        let contours: Vec<Contour<i32>> = find_contours(&mask);
        let min_area = self.min_area as f64;
        let motion = contours
            .iter()
            .filter(|c| c.border_type == BorderType::Outer)
            .any(|c| contour_area(&c.points) >= min_area);

        self.previous_gray = Some(current);

        if motion {
            self.consecutive_no_motion = 0;
        } else {
            self.consecutive_no_motion = self.consecutive_no_motion.saturating_add(1);
        }

        self.maybe_log_stats();

        if motion {
            Decision::Motion
        } else {
            Decision::NoMotion
        }
    }

    /// True once the camera has been quiet long enough to stretch sleeps.
    pub fn long_idle(&self) -> bool {
        self.consecutive_no_motion > LONG_IDLE_CYCLES
    }

    /// Downscale + blur into the detect-resolution grayscale working format.
    fn prepare(&self, frame: &Frame) -> GrayImage {
        let native = GrayImage::from_fn(frame.width, frame.height, |x, y| {
            Luma([frame.data[(y * frame.width + x) as usize]])
        });
        let resized = imageops::resize(
            &native,
            self.detect_width,
            self.detect_height,
            FilterType::Triangle,
        );
        gaussian_blur_f32(&resized, self.blur_sigma)
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats.elapsed().as_secs() < STATS_INTERVAL_SECS {
            return;
        }
        self.last_stats = Instant::now();
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            debug!(
                fps = self.frame_counter as f64 / elapsed,
                detection_fps = self.frames_processed as f64 / elapsed,
                "Detector throughput"
            );
        }
    }
}

fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        Luma([a.get_pixel(x, y)[0].abs_diff(b.get_pixel(x, y)[0])])
    })
}

fn binary_threshold(img: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if img.get_pixel(x, y)[0] >= threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

/// Shoelace area of a closed contour.
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum: i64 = 0;
    for i in 0..points.len() {
        let p = points[i];
        let q = points[(i + 1) % points.len()];
        sum += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    sum.abs() as f64 / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionConfig;

    fn test_config(skip_frames: u32) -> MotionConfig {
        MotionConfig {
            skip_frames,
            // Small blur keeps the synthetic edges sharp enough to count.
            blur_kernel: 3,
            ..MotionConfig::default()
        }
    }

    fn solid_frame(level: u8) -> Frame {
        let img = GrayImage::from_pixel(320, 240, Luma([level]));
        Frame { data: img.into_raw(), width: 320, height: 240 }
    }

    /// A dark frame with a bright square large enough to exceed min_area.
    fn frame_with_box(x0: u32, y0: u32, size: u32) -> Frame {
        let img = GrayImage::from_fn(320, 240, |x, y| {
            if x >= x0 && x < x0 + size && y >= y0 && y < y0 + size {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        Frame { data: img.into_raw(), width: 320, height: 240 }
    }

    #[test]
    fn identical_frames_yield_no_motion() {
        let mut det = MotionDetector::new(&test_config(1));
        det.initialize(&solid_frame(0));
        assert_eq!(det.process(&solid_frame(0)), Decision::NoMotion);
        assert_eq!(det.process(&solid_frame(0)), Decision::NoMotion);
    }

    #[test]
    fn large_change_yields_motion() {
        let mut det = MotionDetector::new(&test_config(1));
        det.initialize(&solid_frame(0));
        assert_eq!(det.process(&frame_with_box(100, 80, 80)), Decision::Motion);
    }

    #[test]
    fn motion_stops_when_scene_settles() {
        let mut det = MotionDetector::new(&test_config(1));
        det.initialize(&solid_frame(0));
        assert_eq!(det.process(&frame_with_box(100, 80, 80)), Decision::Motion);
        // Same scene again: the reference was replaced, so no delta remains.
        assert_eq!(det.process(&frame_with_box(100, 80, 80)), Decision::NoMotion);
    }

    #[test]
    fn decimation_skips_off_cadence_frames() {
        let mut det = MotionDetector::new(&test_config(3));
        det.initialize(&solid_frame(0));
        assert_eq!(det.process(&frame_with_box(100, 80, 80)), Decision::Skipped);
        assert_eq!(det.process(&frame_with_box(100, 80, 80)), Decision::Skipped);
        // Third frame is on cadence and sees the accumulated difference.
        assert_eq!(det.process(&frame_with_box(100, 80, 80)), Decision::Motion);
    }

    #[test]
    fn small_change_stays_below_min_area() {
        let mut det = MotionDetector::new(&test_config(1));
        det.initialize(&solid_frame(0));
        // A 10×10 box is ~100 px, well under the default 800 px minimum.
        assert_eq!(det.process(&frame_with_box(100, 80, 10)), Decision::NoMotion);
    }

    #[test]
    fn long_idle_tracks_consecutive_quiet_frames() {
        let mut det = MotionDetector::new(&test_config(1));
        det.initialize(&solid_frame(0));
        for _ in 0..=LONG_IDLE_CYCLES {
            det.process(&solid_frame(0));
        }
        assert!(det.long_idle());
        det.process(&frame_with_box(100, 80, 80));
        assert!(!det.long_idle());
    }

    #[test]
    fn shoelace_area_of_square() {
        let points = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(contour_area(&points), 100.0);
        assert_eq!(contour_area(&points[..2]), 0.0);
    }
}
