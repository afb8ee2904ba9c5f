//! Multi-scale Haar cascade face detector.
//!
//! Evaluates an OpenCV-format boosted cascade over an image pyramid: each
//! level is a bilinear downscale of the grayscale input, the base window
//! slides at unit stride, and stage sums are computed from variance-
//! normalized Haar responses over integral images. Raw hits are fused by
//! the neighbor-grouping pass and sorted by cluster size.

use crate::cascade::{CascadeError, CascadeModel, HaarFeature};
use crate::imaging::resize_gray_bilinear;
use crate::types::FaceRect;
use std::path::Path;

// --- Scan parameters ---
const DEFAULT_SCALE_FACTOR: f32 = 1.3;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
const DEFAULT_MIN_SIZE: u32 = 40;
/// Floor for the pyramid step; a step of 1.0 or less would never shrink
/// the image and the scan would not terminate.
const MIN_SCALE_STEP: f64 = 1.01;
/// Rectangle-similarity slack used both to cluster raw hits and to expand
/// rects for the containment check.
const GROUP_EPS: f64 = 0.2;
/// The trainer normalizes window variance over the window inset by one
/// pixel on each side.
const NORM_RECT_INSET: u32 = 1;

/// Tuning knobs for [`FaceDetector::detect`].
#[derive(Debug, Clone, Copy)]
pub struct DetectParams {
    /// Pyramid step between scan scales.
    pub scale_factor: f32,
    /// Minimum cluster size for a raw-hit group to count as a face.
    pub min_neighbors: u32,
    /// Smallest face size in original-image pixels; smaller pyramid levels
    /// are skipped entirely.
    pub min_size: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

/// Haar-cascade face detector over grayscale frames.
pub struct FaceDetector {
    model: CascadeModel,
    params: DetectParams,
}

impl FaceDetector {
    /// Load a cascade XML file. A missing file surfaces as
    /// [`CascadeError::NotFound`] so callers can degrade gracefully.
    pub fn load(path: &Path, params: DetectParams) -> Result<Self, CascadeError> {
        let model = CascadeModel::from_file(path)?;
        Ok(Self::from_model(model, params))
    }

    /// Wrap an already-parsed cascade.
    pub fn from_model(model: CascadeModel, params: DetectParams) -> Self {
        Self { model, params }
    }

    pub fn params(&self) -> DetectParams {
        self.params
    }

    /// Detect faces in a grayscale frame.
    ///
    /// Returned rects are clamped to the image bounds and ordered by
    /// neighbor count descending, so the strongest cluster comes first.
    /// An image smaller than the cascade's base window yields no hits.
    pub fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceRect> {
        debug_assert_eq!(gray.len(), width as usize * height as usize);
        let win_w = self.model.window_width;
        let win_h = self.model.window_height;
        if width < win_w || height < win_h {
            return Vec::new();
        }

        let scale_step = f64::from(self.params.scale_factor).max(MIN_SCALE_STEP);
        let mut raw: Vec<FaceRect> = Vec::new();
        let mut factor: f64 = 1.0;
        loop {
            let scaled_w = (width as f64 / factor).round() as u32;
            let scaled_h = (height as f64 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            // Window size mapped back to original coordinates at this level.
            let mapped_w = (win_w as f64 * factor).round() as u32;
            let mapped_h = (win_h as f64 * factor).round() as u32;
            if mapped_w < self.params.min_size || mapped_h < self.params.min_size {
                factor *= scale_step;
                continue;
            }

            let level_owned;
            let level: &[u8] = if scaled_w == width && scaled_h == height {
                gray
            } else {
                level_owned = resize_gray_bilinear(gray, width, height, scaled_w, scaled_h);
                &level_owned
            };

            let ii = IntegralImage::build(level, scaled_w, scaled_h);
            for wy in 0..=(scaled_h - win_h) {
                for wx in 0..=(scaled_w - win_w) {
                    let inv_norm = 1.0 / variance_norm(&ii, wx, wy, win_w, win_h);
                    if window_passes(&self.model, &ii, wx, wy, inv_norm) {
                        raw.push(FaceRect {
                            x: (wx as f64 * factor).round() as i32,
                            y: (wy as f64 * factor).round() as i32,
                            width: mapped_w,
                            height: mapped_h,
                        });
                    }
                }
            }

            factor *= scale_step;
        }

        group_rectangles(raw, self.params.min_neighbors, GROUP_EPS)
            .into_iter()
            .filter_map(|(rect, _)| rect.clamped_to(width, height))
            .collect()
    }
}

/// Summed-area tables for pixel values and squared pixel values, with the
/// usual one-row/one-column zero border.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq: Vec<u64>,
}

impl IntegralImage {
    fn build(gray: &[u8], width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = gray[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sq }
    }

    fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        lookup(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        lookup(&self.sq, self.stride, x, y, w, h)
    }
}

fn lookup(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);
    let br = table[(y + h) * stride + x + w];
    let tl = table[y * stride + x];
    let tr = table[y * stride + x + w];
    let bl = table[(y + h) * stride + x];
    (br + tl) - (tr + bl)
}

/// Standard deviation scale for one window position. A flat window has no
/// variance to normalize by and uses a factor of 1.
fn variance_norm(ii: &IntegralImage, wx: u32, wy: u32, win_w: u32, win_h: u32) -> f64 {
    let inset = if win_w > 2 * NORM_RECT_INSET && win_h > 2 * NORM_RECT_INSET {
        NORM_RECT_INSET
    } else {
        0
    };
    let w = win_w - 2 * inset;
    let h = win_h - 2 * inset;
    let area = (w as u64 * h as u64) as f64;
    let sum = ii.rect_sum(wx + inset, wy + inset, w, h) as f64;
    let sq = ii.sq_rect_sum(wx + inset, wy + inset, w, h) as f64;
    let nf2 = area * sq - sum * sum;
    if nf2 > 0.0 {
        nf2.sqrt()
    } else {
        1.0
    }
}

fn feature_value(feature: &HaarFeature, ii: &IntegralImage, wx: u32, wy: u32) -> f64 {
    feature
        .rects
        .iter()
        .map(|r| r.weight as f64 * ii.rect_sum(wx + r.x, wy + r.y, r.width, r.height) as f64)
        .sum()
}

/// Run every stage at one window position. Stages reject early, so most
/// windows cost only a handful of feature evaluations.
fn window_passes(
    model: &CascadeModel,
    ii: &IntegralImage,
    wx: u32,
    wy: u32,
    inv_norm: f64,
) -> bool {
    for stage in &model.stages {
        let mut stage_sum = 0.0f64;
        for tree in &stage.trees {
            let mut idx = 0i32;
            let leaf = loop {
                let node = &tree.nodes[idx as usize];
                let val =
                    feature_value(&model.features[node.feature as usize], ii, wx, wy) * inv_norm;
                let next = if val < node.threshold as f64 {
                    node.left
                } else {
                    node.right
                };
                if next <= 0 {
                    break next.unsigned_abs() as usize;
                }
                idx = next;
            };
            stage_sum += tree.leaves[leaf] as f64;
        }
        if stage_sum < stage.threshold as f64 {
            return false;
        }
    }
    true
}

/// Two rects are neighbors when their corners agree within a slack
/// proportional to their size.
fn similar(a: &FaceRect, b: &FaceRect, eps: f64) -> bool {
    let delta = eps * 0.5 * (a.width.min(b.width) + a.height.min(b.height)) as f64;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && ((a.x + a.width as i32) - (b.x + b.width as i32)).abs() as f64 <= delta
        && ((a.y + a.height as i32) - (b.y + b.height as i32)).abs() as f64 <= delta
}

/// Partition rects into similarity classes (transitive closure over
/// [`similar`]), returning a compact label per rect and the class count.
fn partition(rects: &[FaceRect], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    let mut labels = vec![0usize; rects.len()];
    let mut next = 0usize;
    let mut class_of = std::collections::HashMap::new();
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        let label = *class_of.entry(root).or_insert_with(|| {
            let l = next;
            next += 1;
            l
        });
        labels[i] = label;
    }
    (labels, next)
}

/// Fuse raw pyramid hits into final detections.
///
/// Clusters similar rects, averages each cluster, keeps clusters with at
/// least `min_neighbors` members, then drops weakly-supported averages
/// contained inside stronger ones. Output is (rect, neighbor count),
/// sorted by count descending.
fn group_rectangles(raw: Vec<FaceRect>, min_neighbors: u32, eps: f64) -> Vec<(FaceRect, u32)> {
    if raw.is_empty() {
        return Vec::new();
    }

    let (labels, nclasses) = partition(&raw, eps);
    let mut sums = vec![[0i64; 4]; nclasses];
    let mut counts = vec![0u32; nclasses];
    for (rect, &cls) in raw.iter().zip(&labels) {
        sums[cls][0] += rect.x as i64;
        sums[cls][1] += rect.y as i64;
        sums[cls][2] += rect.width as i64;
        sums[cls][3] += rect.height as i64;
        counts[cls] += 1;
    }

    let average = |cls: usize| -> FaceRect {
        let n = counts[cls] as f64;
        FaceRect {
            x: (sums[cls][0] as f64 / n).round() as i32,
            y: (sums[cls][1] as f64 / n).round() as i32,
            width: (sums[cls][2] as f64 / n).round() as u32,
            height: (sums[cls][3] as f64 / n).round() as u32,
        }
    };

    let survivors: Vec<(FaceRect, u32)> = (0..nclasses)
        .filter(|&c| counts[c] >= min_neighbors)
        .map(|c| (average(c), counts[c]))
        .collect();

    let mut out = Vec::new();
    'candidates: for (i, &(r1, n1)) in survivors.iter().enumerate() {
        for (j, &(r2, n2)) in survivors.iter().enumerate() {
            if i == j {
                continue;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            let inside = r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width as i32 <= r2.x + r2.width as i32 + dx
                && r1.y + r1.height as i32 <= r2.y + r2.height as i32 + dy;
            if inside && (n2 > n1.max(3) || n1 < 3) {
                continue 'candidates;
            }
        }
        out.push((r1, n1));
    }

    out.sort_by(|a, b| b.1.cmp(&a.1));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{Stage, TreeNode, WeakTree, WeightedRect};

    /// One-stage stump cascade over a 4x4 window that fires when the left
    /// half of the window is brighter than the right.
    fn contrast_cascade() -> CascadeModel {
        CascadeModel {
            window_width: 4,
            window_height: 4,
            stages: vec![Stage {
                threshold: 0.5,
                trees: vec![WeakTree {
                    nodes: vec![TreeNode {
                        left: 0,
                        right: -1,
                        feature: 0,
                        threshold: 0.25,
                    }],
                    leaves: vec![0.0, 1.0],
                }],
            }],
            features: vec![HaarFeature {
                rects: vec![
                    WeightedRect {
                        x: 0,
                        y: 0,
                        width: 4,
                        height: 4,
                        weight: -1.0,
                    },
                    WeightedRect {
                        x: 0,
                        y: 0,
                        width: 2,
                        height: 4,
                        weight: 2.0,
                    },
                ],
            }],
        }
    }

    fn test_params() -> DetectParams {
        DetectParams {
            scale_factor: 1.3,
            min_neighbors: 1,
            min_size: 1,
        }
    }

    /// 4x4 frame, left half bright.
    fn left_bright_4x4() -> Vec<u8> {
        let mut gray = vec![0u8; 16];
        for y in 0..4 {
            for x in 0..2 {
                gray[y * 4 + x] = 255;
            }
        }
        gray
    }

    #[test]
    fn test_integral_rect_sums_match_brute_force() {
        let gray = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let ii = IntegralImage::build(&gray, 3, 3);
        assert_eq!(ii.rect_sum(0, 0, 3, 3), 45);
        assert_eq!(ii.rect_sum(1, 1, 2, 2), 5 + 6 + 8 + 9);
        assert_eq!(ii.rect_sum(0, 2, 3, 1), 7 + 8 + 9);
        assert_eq!(ii.sq_rect_sum(0, 0, 2, 2), 1 + 4 + 16 + 25);
    }

    #[test]
    fn test_variance_norm_of_flat_window_is_one() {
        let gray = vec![128u8; 16];
        let ii = IntegralImage::build(&gray, 4, 4);
        assert!((variance_norm(&ii, 0, 0, 4, 4) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_variance_norm_of_contrast_window() {
        let ii = IntegralImage::build(&left_bright_4x4(), 4, 4);
        // Norm rect is the 2x2 interior: two pixels at 255, two at 0.
        // sqrt(4 * 130050 - 510^2) = 510.
        assert!((variance_norm(&ii, 0, 0, 4, 4) - 510.0).abs() < 1e-6);
    }

    #[test]
    fn test_detect_finds_contrast_pattern() {
        let detector = FaceDetector::from_model(contrast_cascade(), test_params());
        let hits = detector.detect(&left_bright_4x4(), 4, 4);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], FaceRect {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
        });
    }

    #[test]
    fn test_detect_rejects_uniform_frame() {
        let detector = FaceDetector::from_model(contrast_cascade(), test_params());
        let gray = vec![128u8; 64];
        assert!(detector.detect(&gray, 8, 8).is_empty());
    }

    #[test]
    fn test_detect_on_frame_smaller_than_window_is_empty() {
        let detector = FaceDetector::from_model(contrast_cascade(), test_params());
        let gray = vec![255u8; 4];
        assert!(detector.detect(&gray, 2, 2).is_empty());
    }

    #[test]
    fn test_min_size_skips_every_level() {
        let params = DetectParams {
            min_size: 10,
            ..test_params()
        };
        let detector = FaceDetector::from_model(contrast_cascade(), params);
        assert!(detector.detect(&left_bright_4x4(), 4, 4).is_empty());
    }

    /// Same left-brighter-than-right stump over a 12x12 window. Big enough
    /// that the grouping slack (0.2 * window size) reaches the neighboring
    /// scan positions, the way it does for real face-sized windows.
    fn wide_contrast_cascade() -> CascadeModel {
        CascadeModel {
            window_width: 12,
            window_height: 12,
            stages: vec![Stage {
                threshold: 0.5,
                trees: vec![WeakTree {
                    nodes: vec![TreeNode {
                        left: 0,
                        right: -1,
                        feature: 0,
                        threshold: 0.25,
                    }],
                    leaves: vec![0.0, 1.0],
                }],
            }],
            features: vec![HaarFeature {
                rects: vec![
                    WeightedRect {
                        x: 0,
                        y: 0,
                        width: 12,
                        height: 12,
                        weight: -1.0,
                    },
                    WeightedRect {
                        x: 0,
                        y: 0,
                        width: 6,
                        height: 12,
                        weight: 2.0,
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_detect_fuses_neighboring_hits() {
        // 16x16 frame, left half bright: every 12x12 window position fires
        // (the left-half sum always dominates) and all 25 raw hits cluster
        // into a single averaged detection.
        let mut gray = vec![0u8; 16 * 16];
        for y in 0..16 {
            for x in 0..8 {
                gray[y * 16 + x] = 255;
            }
        }
        let params = DetectParams {
            min_neighbors: 5,
            ..test_params()
        };
        let detector = FaceDetector::from_model(wide_contrast_cascade(), params);
        let hits = detector.detect(&gray, 16, 16);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0], rect(2, 2, 12, 12));
    }

    fn rect(x: i32, y: i32, w: u32, h: u32) -> FaceRect {
        FaceRect {
            x,
            y,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_similar_uses_size_proportional_slack() {
        let a = rect(100, 100, 100, 100);
        assert!(similar(&a, &rect(110, 95, 100, 100), 0.2));
        assert!(!similar(&a, &rect(150, 100, 100, 100), 0.2));
    }

    #[test]
    fn test_group_rectangles_averages_cluster_and_drops_singleton() {
        let raw = vec![
            rect(10, 10, 100, 100),
            rect(14, 8, 100, 100),
            rect(6, 12, 100, 100),
            rect(300, 300, 50, 50),
        ];
        let grouped = group_rectangles(raw, 2, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        let (avg, neighbors) = grouped[0];
        assert_eq!(neighbors, 3);
        assert_eq!(avg, rect(10, 10, 100, 100));
    }

    #[test]
    fn test_group_rectangles_empty_input() {
        assert!(group_rectangles(Vec::new(), 5, GROUP_EPS).is_empty());
    }

    #[test]
    fn test_group_rectangles_drops_weak_contained_cluster() {
        let mut raw = vec![rect(0, 0, 100, 100); 4];
        raw.push(rect(10, 10, 20, 20));
        raw.push(rect(12, 10, 20, 20));
        let grouped = group_rectangles(raw, 2, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].0.width, 100);
    }

    #[test]
    fn test_group_rectangles_sorts_by_neighbors() {
        let mut raw = vec![rect(200, 200, 50, 50); 5];
        raw.extend(vec![rect(0, 0, 50, 50); 3]);
        let grouped = group_rectangles(raw, 2, GROUP_EPS);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].1, 5);
        assert_eq!(grouped[1].1, 3);
    }

    #[test]
    fn test_default_params_match_service_tuning() {
        let params = DetectParams::default();
        assert!((params.scale_factor - 1.3).abs() < 1e-6);
        assert_eq!(params.min_neighbors, 5);
        assert_eq!(params.min_size, 40);
    }
}
