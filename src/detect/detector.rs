use opencv::core::{Mat, Point, Rect, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::DetectionParams;

use super::mask::MaskEngine;

/// Threshold relaxation while a track is open: continuing a trajectory must
/// be easier than starting one.
const TRACKING_THRESHOLD_FACTOR: f64 = 0.7;

/// One bright region surviving the per-frame gates. Coordinates are in
/// full-resolution pixel space regardless of the processing scale.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub cx: f64,
    pub cy: f64,
    pub area: f64,
    pub brightness: f64,
    pub bbox: Rect,
    pub frame_ts: f64,
}

/// Per-frame candidate extraction over two consecutive grayscale frames.
/// Works at processing scale; reports at full resolution.
pub struct Detector {
    params: DetectionParams,
    scale: f64,
    full_size: Size,
    kernel: Mat,
}

impl Detector {
    pub fn new(params: DetectionParams, scale: f64, full_size: Size) -> opencv::Result<Self> {
        let kernel =
            imgproc::get_structuring_element_def(imgproc::MORPH_ELLIPSE, Size::new(3, 3))?;
        Ok(Self {
            params,
            scale,
            full_size,
            kernel,
        })
    }

    pub fn set_params(&mut self, params: DetectionParams) {
        self.params = params;
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    pub fn detect(
        &self,
        curr: &Mat,
        prev: &Mat,
        masks: &MaskEngine,
        tracking_mode: bool,
        frame_ts: f64,
    ) -> opencv::Result<Vec<Candidate>> {
        let p = &self.params;

        let mut diff = Mat::default();
        opencv::core::absdiff(curr, prev, &mut diff)?;
        masks.apply_exclusion(&mut diff)?;

        let threshold = if tracking_mode {
            p.diff_threshold * TRACKING_THRESHOLD_FACTOR
        } else {
            p.diff_threshold
        };
        let mut binary = Mat::default();
        imgproc::threshold(&diff, &mut binary, threshold, 255.0, imgproc::THRESH_BINARY)?;

        let mut opened = Mat::default();
        imgproc::morphology_ex_def(&binary, &mut opened, imgproc::MORPH_OPEN, &self.kernel)?;
        let mut cleaned = Mat::default();
        imgproc::morphology_ex_def(&opened, &mut cleaned, imgproc::MORPH_CLOSE, &self.kernel)?;

        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours_def(
            &cleaned,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
        )?;

        let min_brightness = if tracking_mode {
            p.min_brightness_tracking
        } else {
            p.min_brightness
        };
        let inv_scale = 1.0 / self.scale;
        let area_scale = inv_scale * inv_scale;
        let full_w = self.full_size.width as f64;
        let full_h = self.full_size.height as f64;

        let mut candidates = Vec::new();
        for contour in contours.iter() {
            let bbox = imgproc::bounding_rect(&contour)?;
            let area = imgproc::contour_area_def(&contour)? * area_scale;
            if area < p.min_area || area > p.max_area {
                continue;
            }

            let m = imgproc::moments_def(&contour)?;
            let (cx, cy) = if m.m00.abs() > f64::EPSILON {
                (m.m10 / m.m00, m.m01 / m.m00)
            } else {
                (
                    bbox.x as f64 + bbox.width as f64 / 2.0,
                    bbox.y as f64 + bbox.height as f64 / 2.0,
                )
            };

            // Mean brightness on the current frame within the detected
            // region; the cleaned binary restricted to the bbox is the
            // contour mask.
            let frame_rect = Rect::new(0, 0, curr.cols(), curr.rows());
            let clipped = bbox & frame_rect;
            if clipped.width <= 0 || clipped.height <= 0 {
                continue;
            }
            let roi = Mat::roi(curr, clipped)?;
            let roi_mask = Mat::roi(&cleaned, clipped)?;
            let brightness = opencv::core::mean(&roi, &roi_mask)?[0];
            if brightness < min_brightness {
                continue;
            }

            let full_cx = cx * inv_scale;
            let full_cy = cy * inv_scale;

            if full_cy >= (1.0 - p.exclude_bottom_ratio) * full_h {
                continue;
            }
            if p.exclude_edge_ratio > 0.0 {
                let margin_x = p.exclude_edge_ratio * full_w;
                let margin_y = p.exclude_edge_ratio * full_h;
                if full_cx < margin_x
                    || full_cx > full_w - margin_x
                    || full_cy < margin_y
                    || full_cy > full_h - margin_y
                {
                    continue;
                }
            }

            // Tiny blobs sitting on known clutter never seed tracks.
            if area <= p.small_area_threshold {
                let overlap = masks.bbox_overlap_ratio(bbox)?;
                if overlap > p.nuisance_overlap_threshold {
                    continue;
                }
            }

            candidates.push(Candidate {
                cx: full_cx,
                cy: full_cy,
                area,
                brightness,
                bbox: Rect::new(
                    (bbox.x as f64 * inv_scale) as i32,
                    (bbox.y as f64 * inv_scale) as i32,
                    (bbox.width as f64 * inv_scale) as i32,
                    (bbox.height as f64 * inv_scale) as i32,
                ),
                frame_ts,
            });
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectionParams, Sensitivity};
    use opencv::core::{Scalar, CV_8UC1};

    fn gray(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    fn with_blob(rows: i32, cols: i32, x: i32, y: i32, value: f64) -> Mat {
        let mut m = gray(rows, cols);
        imgproc::circle(
            &mut m,
            Point::new(x, y),
            2,
            Scalar::all(value),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        m
    }

    fn detector(params: DetectionParams) -> Detector {
        Detector::new(params, 1.0, Size::new(64, 64)).unwrap()
    }

    fn medium() -> DetectionParams {
        DetectionParams::preset(Sensitivity::Medium)
    }

    #[test]
    fn finds_bright_moving_blob() {
        let det = detector(medium());
        let masks = MaskEngine::new(Size::new(64, 64));
        let prev = gray(64, 64);
        let curr = with_blob(64, 64, 32, 30, 255.0);

        let candidates = det.detect(&curr, &prev, &masks, false, 1.0).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert!((c.cx - 32.0).abs() < 2.0);
        assert!((c.cy - 30.0).abs() < 2.0);
        assert!(c.brightness > 200.0);
        assert_eq!(c.frame_ts, 1.0);
    }

    #[test]
    fn full_exclusion_mask_yields_no_candidates() {
        let det = detector(medium());
        let mut masks = MaskEngine::new(Size::new(64, 64));
        let all =
            Mat::new_rows_cols_with_default(64, 64, CV_8UC1, Scalar::all(255.0)).unwrap();
        masks.set_exclusion(all);

        let prev = gray(64, 64);
        let curr = with_blob(64, 64, 32, 30, 255.0);
        let candidates = det.detect(&curr, &prev, &masks, false, 0.0).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn bottom_band_is_excluded() {
        // 1/16 of 64 rows: everything at y >= 60 is out.
        let det = detector(medium());
        let masks = MaskEngine::new(Size::new(64, 64));
        let prev = gray(64, 64);
        let curr = with_blob(64, 64, 32, 61, 255.0);
        let candidates = det.detect(&curr, &prev, &masks, false, 0.0).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn edge_ratio_excludes_near_border_centroids() {
        let mut params = medium();
        params.exclude_edge_ratio = 0.1;
        let det = detector(params);
        let masks = MaskEngine::new(Size::new(64, 64));
        let prev = gray(64, 64);

        // 5% in from the left: inside the excluded margin.
        let near = with_blob(64, 64, 3, 32, 255.0);
        assert!(det.detect(&near, &prev, &masks, false, 0.0).unwrap().is_empty());

        // 15% in: detected.
        let inside = with_blob(64, 64, 10, 32, 255.0);
        assert_eq!(det.detect(&inside, &prev, &masks, false, 0.0).unwrap().len(), 1);
    }

    #[test]
    fn tracking_mode_relaxes_brightness_gate() {
        let det = detector(medium());
        let masks = MaskEngine::new(Size::new(64, 64));
        let prev = gray(64, 64);
        let curr = with_blob(64, 64, 32, 32, 170.0);

        assert!(det.detect(&curr, &prev, &masks, false, 0.0).unwrap().is_empty());
        assert_eq!(det.detect(&curr, &prev, &masks, true, 0.0).unwrap().len(), 1);
    }

    #[test]
    fn nuisance_mask_drops_small_overlapping_blob() {
        let det = detector(medium());
        let mut masks = MaskEngine::new(Size::new(64, 64));
        // Nuisance fully covers the blob neighbourhood.
        let mut nuisance = gray(64, 64);
        imgproc::rectangle(
            &mut nuisance,
            Rect::new(24, 24, 16, 16),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nuisance.png");
        MaskEngine::save_png(&path, &nuisance).unwrap();
        assert!(masks.load_nuisance(&path, 0).unwrap());

        let prev = gray(64, 64);
        let curr = with_blob(64, 64, 32, 32, 255.0);
        let candidates = det.detect(&curr, &prev, &masks, false, 0.0).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn coordinates_scale_back_to_full_resolution() {
        // Processing at half scale: frames are 32x32, full frame is 64x64.
        let det = Detector::new(medium(), 0.5, Size::new(64, 64)).unwrap();
        let masks = MaskEngine::new(Size::new(32, 32));
        let prev = gray(32, 32);
        let curr = with_blob(32, 32, 16, 15, 255.0);

        let candidates = det.detect(&curr, &prev, &masks, false, 0.0).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert!((c.cx - 32.0).abs() < 4.0);
        assert!((c.cy - 30.0).abs() < 4.0);
    }
}
