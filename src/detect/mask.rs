use std::path::Path;
use std::sync::Arc;

use opencv::core::{Mat, Rect, Scalar, Size};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

/// Brightness level above which a pixel counts as a permanent light when
/// regenerating the exclusion mask from a live frame.
const GENERATE_THRESHOLD: f64 = 200.0;
const GENERATE_BASE_DILATE: i32 = 5;

/// Nuisance lookup handed to the tracker. Coordinates come in at full
/// resolution; the map internally lives at processing scale.
pub struct NuisanceMap {
    mask: Mat,
    scale: f64,
}

impl NuisanceMap {
    pub fn new(mask: Mat, scale: f64) -> Self {
        Self { mask, scale }
    }

    pub fn hit(&self, x: f64, y: f64) -> bool {
        let col = (x * self.scale) as i32;
        let row = (y * self.scale) as i32;
        if row < 0 || col < 0 || row >= self.mask.rows() || col >= self.mask.cols() {
            return false;
        }
        matches!(self.mask.at_2d::<u8>(row, col), Ok(v) if *v != 0)
    }
}

/// Loads, normalises and regenerates the two mask kinds. Exclusion masks
/// zero regions out of the frame difference; nuisance masks only feed
/// overlap filters.
pub struct MaskEngine {
    exclusion: Option<Mat>,
    nuisance: Option<Mat>,
    target: Size,
}

impl MaskEngine {
    pub fn new(target: Size) -> Self {
        Self {
            exclusion: None,
            nuisance: None,
            target,
        }
    }

    pub fn load_exclusion(
        &mut self,
        path: &Path,
        dilate_px: i32,
    ) -> opencv::Result<bool> {
        match load_normalized(path, self.target, dilate_px)? {
            Some(mask) => {
                self.exclusion = Some(mask);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn load_nuisance(&mut self, path: &Path, dilate_px: i32) -> opencv::Result<bool> {
        match load_normalized(path, self.target, dilate_px)? {
            Some(mask) => {
                self.nuisance = Some(mask);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_exclusion(&mut self, mask: Mat) {
        self.exclusion = Some(mask);
    }

    pub fn clear_exclusion(&mut self) {
        self.exclusion = None;
    }

    pub fn clear_nuisance(&mut self) {
        self.nuisance = None;
    }

    pub fn exclusion(&self) -> Option<&Mat> {
        self.exclusion.as_ref()
    }

    pub fn nuisance(&self) -> Option<&Mat> {
        self.nuisance.as_ref()
    }

    /// Share the nuisance mask with the tracker. `scale` maps full-res
    /// coordinates into mask space.
    pub fn nuisance_map(&self, scale: f64) -> Option<Arc<NuisanceMap>> {
        let mask = self.nuisance.as_ref()?;
        let copy = mask.try_clone().ok()?;
        Some(Arc::new(NuisanceMap::new(copy, scale)))
    }

    /// Zero out excluded regions of a frame difference in place.
    pub fn apply_exclusion(&self, diff: &mut Mat) -> opencv::Result<()> {
        if let Some(mask) = &self.exclusion {
            diff.set_to(&Scalar::all(0.0), mask)?;
        }
        Ok(())
    }

    /// Fraction of a bounding box covered by nuisance pixels; 0.0 when no
    /// nuisance mask is configured.
    pub fn bbox_overlap_ratio(&self, bbox: Rect) -> opencv::Result<f64> {
        let mask = match &self.nuisance {
            Some(m) => m,
            None => return Ok(0.0),
        };
        let frame_rect = Rect::new(0, 0, mask.cols(), mask.rows());
        let clipped = bbox & frame_rect;
        if clipped.width <= 0 || clipped.height <= 0 {
            return Ok(0.0);
        }
        let roi = Mat::roi(mask, clipped)?;
        let covered = opencv::core::count_non_zero(&roi)? as f64;
        Ok(covered / (clipped.width as f64 * clipped.height as f64))
    }

    /// Build a fresh exclusion mask from a live grayscale frame: every
    /// persistently bright region, grown by the dilation radius.
    pub fn generate_from_frame(gray: &Mat, extra_dilate: i32) -> opencv::Result<Mat> {
        let mut mask = Mat::default();
        imgproc::threshold(
            gray,
            &mut mask,
            GENERATE_THRESHOLD,
            255.0,
            imgproc::THRESH_BINARY,
        )?;
        dilate_mask(&mask, GENERATE_BASE_DILATE + extra_dilate.max(0))
    }

    pub fn save_png(path: &Path, mask: &Mat) -> opencv::Result<()> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let path = path.to_string_lossy();
        imgcodecs::imwrite_def(&path, mask)?;
        Ok(())
    }
}

fn load_normalized(path: &Path, target: Size, dilate_px: i32) -> opencv::Result<Option<Mat>> {
    let text = path.to_string_lossy();
    let raw = imgcodecs::imread(&text, imgcodecs::IMREAD_GRAYSCALE)?;
    if raw.empty() {
        return Ok(None);
    }
    let mut mask = normalize_to(&raw, target)?;
    if dilate_px > 0 {
        mask = dilate_mask(&mask, dilate_px)?;
    }
    Ok(Some(mask))
}

/// Resize to the target resolution and re-binarise. Nearest-neighbour
/// keeps mask edges hard.
fn normalize_to(mask: &Mat, target: Size) -> opencv::Result<Mat> {
    let sized = if mask.cols() != target.width || mask.rows() != target.height {
        let mut resized = Mat::default();
        imgproc::resize(
            mask,
            &mut resized,
            target,
            0.0,
            0.0,
            imgproc::INTER_NEAREST,
        )?;
        resized
    } else {
        mask.try_clone()?
    };
    let mut binary = Mat::default();
    imgproc::threshold(&sized, &mut binary, 0.0, 255.0, imgproc::THRESH_BINARY)?;
    Ok(binary)
}

fn dilate_mask(mask: &Mat, radius: i32) -> opencv::Result<Mat> {
    if radius <= 0 {
        return mask.try_clone();
    }
    let kernel = imgproc::get_structuring_element_def(
        imgproc::MORPH_ELLIPSE,
        Size::new(radius * 2 + 1, radius * 2 + 1),
    )?;
    let mut out = Mat::default();
    imgproc::dilate_def(mask, &mut out, &kernel)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC1;

    fn blank(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    #[test]
    fn bbox_overlap_without_mask_is_zero() {
        let engine = MaskEngine::new(Size::new(64, 48));
        let ratio = engine.bbox_overlap_ratio(Rect::new(0, 0, 10, 10)).unwrap();
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn bbox_overlap_counts_covered_fraction() {
        let mut engine = MaskEngine::new(Size::new(64, 48));
        let mut mask = blank(48, 64);
        // Cover the left half of a 10x10 box at the origin.
        imgproc::rectangle(
            &mut mask,
            Rect::new(0, 0, 5, 10),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        engine.nuisance = Some(mask);
        let ratio = engine.bbox_overlap_ratio(Rect::new(0, 0, 10, 10)).unwrap();
        assert!((ratio - 0.5).abs() < 0.01);
    }

    #[test]
    fn exclusion_zeroes_masked_pixels() {
        let mut engine = MaskEngine::new(Size::new(8, 8));
        let mut mask = blank(8, 8);
        *mask.at_2d_mut::<u8>(2, 3).unwrap() = 255;
        engine.set_exclusion(mask);

        let mut diff =
            Mat::new_rows_cols_with_default(8, 8, CV_8UC1, Scalar::all(40.0)).unwrap();
        engine.apply_exclusion(&mut diff).unwrap();
        assert_eq!(*diff.at_2d::<u8>(2, 3).unwrap(), 0);
        assert_eq!(*diff.at_2d::<u8>(0, 0).unwrap(), 40);
    }

    #[test]
    fn generate_marks_bright_regions() {
        let mut gray = blank(32, 32);
        imgproc::circle(
            &mut gray,
            opencv::core::Point::new(16, 16),
            2,
            Scalar::all(250.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let mask = MaskEngine::generate_from_frame(&gray, 0).unwrap();
        assert!(*mask.at_2d::<u8>(16, 16).unwrap() != 0);
        assert_eq!(*mask.at_2d::<u8>(0, 0).unwrap(), 0);
        // Dilation grew the blob beyond its 2 px radius.
        assert!(*mask.at_2d::<u8>(16, 21).unwrap() != 0);
    }

    #[test]
    fn nuisance_map_scales_full_res_coordinates() {
        let mut mask = blank(24, 32);
        *mask.at_2d_mut::<u8>(10, 10).unwrap() = 255;
        let map = NuisanceMap::new(mask, 0.5);
        // Full-res (20, 20) lands on mask (10, 10).
        assert!(map.hit(20.0, 20.0));
        assert!(!map.hit(0.0, 0.0));
        assert!(!map.hit(-5.0, 3.0));
        assert!(!map.hit(1e6, 1e6));
    }
}
