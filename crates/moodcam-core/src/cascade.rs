//! Pretrained Haar cascade loading.
//!
//! Parses the OpenCV new-style cascade XML (`<cascade
//! type_id="opencv-cascade-classifier">`) into plain structs the detector
//! can evaluate. Only boosted stages over upright HAAR features are
//! supported, which covers the stock `haarcascade_frontalface_default.xml`
//! this service ships against; LBP cascades and tilted features are
//! rejected at load time with a named error.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("could not read cascade file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade XML is not well-formed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// One weighted rectangle of a Haar feature, in base-window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// A Haar feature: two or three weighted rectangles whose weighted pixel
/// sums are combined into a single response.
#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// One internal node of a weak-classifier tree.
///
/// `left`/`right` follow the OpenCV encoding: a positive value is the index
/// of the next internal node (always past the current one), a value `<= 0`
/// selects leaf `-value`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub left: i32,
    pub right: i32,
    pub feature: u32,
    pub threshold: f32,
}

/// A weak classifier: a stump or shallow tree over Haar features.
#[derive(Debug, Clone, PartialEq)]
pub struct WeakTree {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

/// A boosted stage: the sum of its weak-classifier outputs must reach
/// `threshold` for a window to survive.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub trees: Vec<WeakTree>,
}

/// The full pretrained cascade: base window size, stages, feature pool.
#[derive(Debug, Clone)]
pub struct CascadeModel {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl CascadeModel {
    /// Load and parse a cascade XML file.
    pub fn from_file(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let model = Self::parse(&xml)?;
        tracing::info!(
            path = %path.display(),
            width = model.window_width,
            height = model.window_height,
            stages = model.stages.len(),
            features = model.features.len(),
            "loaded face cascade"
        );
        Ok(model)
    }

    /// Parse a cascade from its XML text.
    pub fn parse(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let cascade = doc
            .root_element()
            .children()
            .find(|n| n.is_element() && n.has_tag_name("cascade"))
            .ok_or_else(|| malformed("no <cascade> element under <opencv_storage>"))?;

        let stage_type = text_of(&cascade, "stageType")?;
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!(
                "stageType {stage_type} (only BOOST cascades are supported)"
            )));
        }
        let feature_type = text_of(&cascade, "featureType")?;
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!(
                "featureType {feature_type} (only HAAR cascades are supported)"
            )));
        }

        let window_width: u32 = parse_text(&cascade, "width")?;
        let window_height: u32 = parse_text(&cascade, "height")?;
        if window_width == 0 || window_height == 0 {
            return Err(malformed("zero base window size"));
        }

        let features = parse_features(&cascade, window_width, window_height)?;
        let stages = parse_stages(&cascade, features.len())?;
        if stages.is_empty() {
            return Err(malformed("cascade has no stages"));
        }

        Ok(CascadeModel {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn num_weak_classifiers(&self) -> usize {
        self.stages.iter().map(|s| s.trees.len()).sum()
    }
}

fn malformed(msg: impl Into<String>) -> CascadeError {
    CascadeError::Malformed(msg.into())
}

fn child<'a>(
    node: &roxmltree::Node<'a, 'a>,
    name: &str,
) -> Result<roxmltree::Node<'a, 'a>, CascadeError> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(name))
        .ok_or_else(|| malformed(format!("missing <{name}> element")))
}

fn text_of(node: &roxmltree::Node, name: &str) -> Result<String, CascadeError> {
    Ok(child(node, name)?.text().unwrap_or("").trim().to_string())
}

fn parse_text<T: std::str::FromStr>(node: &roxmltree::Node, name: &str) -> Result<T, CascadeError> {
    let text = text_of(node, name)?;
    text.parse()
        .map_err(|_| malformed(format!("<{name}> is not a valid number: {text:?}")))
}

/// Anonymous `<_>` list entries, the FileStorage sequence encoding.
fn entries<'a>(node: &roxmltree::Node<'a, 'a>) -> impl Iterator<Item = roxmltree::Node<'a, 'a>> {
    node.children().filter(|n| n.is_element() && n.has_tag_name("_"))
}

fn parse_features(
    cascade: &roxmltree::Node,
    window_w: u32,
    window_h: u32,
) -> Result<Vec<HaarFeature>, CascadeError> {
    let features_node = child(cascade, "features")?;
    let mut features = Vec::new();

    for (fi, feature_node) in entries(&features_node).enumerate() {
        if let Ok(tilted) = text_of(&feature_node, "tilted") {
            if tilted != "0" {
                return Err(CascadeError::Unsupported(format!(
                    "feature {fi} is tilted (45-degree features are not supported)"
                )));
            }
        }

        let rects_node = child(&feature_node, "rects")?;
        let mut rects = Vec::new();
        for rect_node in entries(&rects_node) {
            let text = rect_node.text().unwrap_or("").trim();
            let tokens: Vec<&str> = text.split_whitespace().collect();
            if tokens.len() != 5 {
                return Err(malformed(format!(
                    "feature {fi}: rect needs `x y w h weight`, got {text:?}"
                )));
            }
            let num = |s: &str, what: &str| -> Result<u32, CascadeError> {
                s.parse()
                    .map_err(|_| malformed(format!("feature {fi}: bad rect {what}: {s:?}")))
            };
            let rect = WeightedRect {
                x: num(tokens[0], "x")?,
                y: num(tokens[1], "y")?,
                width: num(tokens[2], "width")?,
                height: num(tokens[3], "height")?,
                weight: tokens[4]
                    .parse()
                    .map_err(|_| malformed(format!("feature {fi}: bad rect weight")))?,
            };
            if rect.x as u64 + rect.width as u64 > window_w as u64
                || rect.y as u64 + rect.height as u64 > window_h as u64
            {
                return Err(malformed(format!(
                    "feature {fi}: rect exceeds the {window_w}x{window_h} base window"
                )));
            }
            rects.push(rect);
        }

        if rects.is_empty() || rects.len() > 3 {
            return Err(malformed(format!(
                "feature {fi}: expected 1-3 rects, got {}",
                rects.len()
            )));
        }
        features.push(HaarFeature { rects });
    }

    if features.is_empty() {
        return Err(malformed("cascade has no features"));
    }
    Ok(features)
}

fn parse_stages(
    cascade: &roxmltree::Node,
    feature_count: usize,
) -> Result<Vec<Stage>, CascadeError> {
    let stages_node = child(cascade, "stages")?;
    let mut stages = Vec::new();

    for (si, stage_node) in entries(&stages_node).enumerate() {
        let threshold: f32 = parse_text(&stage_node, "stageThreshold")?;
        let weak_node = child(&stage_node, "weakClassifiers")?;

        let mut trees = Vec::new();
        for (ti, tree_node) in entries(&weak_node).enumerate() {
            let nodes = parse_internal_nodes(&tree_node, feature_count)
                .map_err(|e| malformed(format!("stage {si} tree {ti}: {e}")))?;
            let leaves: Vec<f32> = number_run(&tree_node, "leafValues")
                .map_err(|e| malformed(format!("stage {si} tree {ti}: {e}")))?;

            if leaves.len() != nodes.len() + 1 {
                return Err(malformed(format!(
                    "stage {si} tree {ti}: {} nodes need {} leaves, got {}",
                    nodes.len(),
                    nodes.len() + 1,
                    leaves.len()
                )));
            }
            for (ni, node) in nodes.iter().enumerate() {
                for idx in [node.left, node.right] {
                    // A child node must sit deeper in the list than its
                    // parent or the tree walk would revisit it forever.
                    let valid = if idx > 0 {
                        ni < idx as usize && (idx as usize) < nodes.len()
                    } else {
                        (idx.unsigned_abs() as usize) < leaves.len()
                    };
                    if !valid {
                        return Err(malformed(format!(
                            "stage {si} tree {ti}: child index {idx} out of range"
                        )));
                    }
                }
            }
            trees.push(WeakTree { nodes, leaves });
        }

        if trees.is_empty() {
            return Err(malformed(format!("stage {si} has no weak classifiers")));
        }
        stages.push(Stage { threshold, trees });
    }

    Ok(stages)
}

fn parse_internal_nodes(
    tree_node: &roxmltree::Node,
    feature_count: usize,
) -> Result<Vec<TreeNode>, String> {
    let raw = tree_node
        .children()
        .find(|n| n.is_element() && n.has_tag_name("internalNodes"))
        .and_then(|n| n.text())
        .ok_or("missing <internalNodes>")?;
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(format!(
            "<internalNodes> needs groups of 4 values, got {}",
            tokens.len()
        ));
    }

    let mut nodes = Vec::with_capacity(tokens.len() / 4);
    for chunk in tokens.chunks_exact(4) {
        let left: i32 = chunk[0].parse().map_err(|_| format!("bad left {:?}", chunk[0]))?;
        let right: i32 = chunk[1].parse().map_err(|_| format!("bad right {:?}", chunk[1]))?;
        let feature: u32 = chunk[2]
            .parse()
            .map_err(|_| format!("bad feature index {:?}", chunk[2]))?;
        let threshold: f32 = chunk[3]
            .parse()
            .map_err(|_| format!("bad threshold {:?}", chunk[3]))?;
        if feature as usize >= feature_count {
            return Err(format!(
                "feature index {feature} out of range ({feature_count} features)"
            ));
        }
        nodes.push(TreeNode {
            left,
            right,
            feature,
            threshold,
        });
    }
    Ok(nodes)
}

fn number_run(node: &roxmltree::Node, name: &str) -> Result<Vec<f32>, String> {
    let raw = node
        .children()
        .find(|n| n.is_element() && n.has_tag_name(name))
        .and_then(|n| n.text())
        .ok_or_else(|| format!("missing <{name}>"))?;
    raw.split_whitespace()
        .map(|t| t.parse().map_err(|_| format!("bad number {t:?} in <{name}>")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 4x4-window cascade with one stage, one stump, one full-window
    /// feature. The shared fixture for detector tests lives in
    /// `detector::tests`; this one exercises the parser itself.
    const MINIMAL: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>4</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>5.0000000000000000e-01</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 2.5000000000000000e-01</internalNodes>
          <leafValues>
            0. 1.</leafValues></_>
      </weakClassifiers></_>
  </stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 4 4 -1.</_>
        <_>
          0 0 2 4 2.</_></rects>
      <tilted>0</tilted></_>
  </features>
</cascade>
</opencv_storage>
"#;

    #[test]
    fn test_parse_minimal_cascade() {
        let model = CascadeModel::parse(MINIMAL).unwrap();
        assert_eq!(model.window_width, 4);
        assert_eq!(model.window_height, 4);
        assert_eq!(model.num_stages(), 1);
        assert_eq!(model.num_features(), 1);
        assert_eq!(model.num_weak_classifiers(), 1);

        let stage = &model.stages[0];
        assert!((stage.threshold - 0.5).abs() < 1e-6);
        let tree = &stage.trees[0];
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.leaves, vec![0.0, 1.0]);
        assert_eq!(tree.nodes[0].left, 0);
        assert_eq!(tree.nodes[0].right, -1);

        let feature = &model.features[0];
        assert_eq!(feature.rects.len(), 2);
        assert!((feature.rects[0].weight + 1.0).abs() < 1e-6);
        assert!((feature.rects[1].weight - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_scientific_notation_and_trailing_dot() {
        // FileStorage writes floats like `-3.1511999666690826e-02` and `-1.`.
        let model = CascadeModel::parse(MINIMAL).unwrap();
        assert!((model.stages[0].trees[0].nodes[0].threshold - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_reject_lbp_cascade() {
        let xml = MINIMAL.replace("HAAR", "LBP");
        match CascadeModel::parse(&xml) {
            Err(CascadeError::Unsupported(msg)) => assert!(msg.contains("LBP")),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_tilted_feature() {
        let xml = MINIMAL.replace("<tilted>0</tilted>", "<tilted>1</tilted>");
        assert!(matches!(
            CascadeModel::parse(&xml),
            Err(CascadeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_reject_rect_outside_window() {
        let xml = MINIMAL.replace("0 0 4 4 -1.", "0 0 5 4 -1.");
        assert!(matches!(
            CascadeModel::parse(&xml),
            Err(CascadeError::Malformed(_))
        ));
    }

    #[test]
    fn test_reject_rect_with_huge_offset() {
        // x + width must not wrap around u32 and slip past the window check.
        let xml = MINIMAL.replace("0 0 4 4 -1.", "4294967295 0 4 4 -1.");
        assert!(matches!(
            CascadeModel::parse(&xml),
            Err(CascadeError::Malformed(_))
        ));
    }

    #[test]
    fn test_reject_wrong_leaf_count() {
        let xml = MINIMAL.replace("0. 1.", "0. 1. 2.");
        match CascadeModel::parse(&xml) {
            Err(CascadeError::Malformed(msg)) => assert!(msg.contains("leaves")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_feature_index_out_of_range() {
        let xml = MINIMAL.replace("0 -1 0 2.5", "0 -1 7 2.5");
        assert!(matches!(
            CascadeModel::parse(&xml),
            Err(CascadeError::Malformed(_))
        ));
    }

    #[test]
    fn test_reject_huge_leaf_index() {
        // i32::MIN as a child must fail validation, not overflow on negation.
        let xml = MINIMAL.replace(
            "0 -1 0 2.5000000000000000e-01",
            "0 -2147483648 0 2.5000000000000000e-01",
        );
        match CascadeModel::parse(&xml) {
            Err(CascadeError::Malformed(msg)) => assert!(msg.contains("child index")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_truncated_internal_nodes() {
        let xml = MINIMAL.replace(
            "0 -1 0 2.5000000000000000e-01",
            "0 -1 0",
        );
        assert!(matches!(
            CascadeModel::parse(&xml),
            Err(CascadeError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = CascadeModel::from_file(Path::new("/nonexistent/cascade.xml")).unwrap_err();
        assert!(matches!(err, CascadeError::NotFound(_)));
    }

    #[test]
    fn test_multi_node_tree_parses() {
        // Depth-2 tree: root at node 0 routes to node 1 or leaf 0.
        let xml = MINIMAL.replace(
            "0 -1 0 2.5000000000000000e-01</internalNodes>\n          <leafValues>\n            0. 1.",
            "1 0 0 2.5000000000000000e-01 0 -1 0 7.5000000000000000e-01</internalNodes>\n          <leafValues>\n            0. 5.0000000000000000e-01 1.",
        );
        let model = CascadeModel::parse(&xml).unwrap();
        let tree = &model.stages[0].trees[0];
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(tree.leaves.len(), 3);
        assert_eq!(tree.nodes[0].left, 1);
    }

    #[test]
    fn test_reject_child_that_does_not_advance() {
        // Node 1 routes back to itself; the evaluator would never reach a leaf.
        let xml = MINIMAL.replace(
            "0 -1 0 2.5000000000000000e-01</internalNodes>\n          <leafValues>\n            0. 1.",
            "1 0 0 2.5000000000000000e-01 1 -1 0 7.5000000000000000e-01</internalNodes>\n          <leafValues>\n            0. 5.0000000000000000e-01 1.",
        );
        match CascadeModel::parse(&xml) {
            Err(CascadeError::Malformed(msg)) => assert!(msg.contains("child index")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
