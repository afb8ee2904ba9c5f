use serde::{Deserialize, Serialize};

/// The seven emotion classes, in the model's output order.
///
/// The pretrained network emits one score per class; `from_index` maps the
/// argmax back to a label. Serialized as the lowercase label on every wire
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Neutral,
    Sad,
    Surprise,
}

impl Emotion {
    /// All classes in model output order.
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprise,
    ];

    /// Map a model output index to its label.
    pub fn from_index(index: usize) -> Option<Emotion> {
        Emotion::ALL.get(index).copied()
    }

    /// Position of this label in the model's output vector.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase label as shown in the UI and the CSV export.
    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
        }
    }

    /// Emoji companion drawn next to the label.
    pub fn emoji(self) -> &'static str {
        match self {
            Emotion::Angry => "\u{1F620}",
            Emotion::Disgust => "\u{1F922}",
            Emotion::Fear => "\u{1F628}",
            Emotion::Happy => "\u{1F60A}",
            Emotion::Neutral => "\u{1F610}",
            Emotion::Sad => "\u{1F622}",
            Emotion::Surprise => "\u{1F62E}",
        }
    }
}

/// Axis-aligned face rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with an `img_w` × `img_h` image.
    ///
    /// Returns `None` when the intersection is empty, so callers never crop
    /// a zero-sized region for a box that sits at (or past) the border.
    pub fn clamped_to(&self, img_w: u32, img_h: u32) -> Option<FaceRect> {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x.saturating_add(self.width as i32)).min(img_w as i32);
        let y1 = (self.y.saturating_add(self.height as i32)).min(img_h as i32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(FaceRect {
            x: x0,
            y: y0,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// One classified face: where it is and what the network decided.
///
/// `confidence` is the softmax probability of the winning label. Produced
/// per inference call and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub rect: FaceRect,
    pub emotion: Emotion,
    pub confidence: f32,
}

/// Running per-session tally, one counter per emotion label.
///
/// Serializes as a JSON object with all seven keys always present, in label
/// order, so the client table never has to special-case absent labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmotionCounts([u64; Emotion::ALL.len()]);

impl EmotionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, emotion: Emotion) {
        self.0[emotion.index()] += 1;
    }

    pub fn get(&self, emotion: Emotion) -> u64 {
        self.0[emotion.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, u64)> + '_ {
        Emotion::ALL.iter().map(move |&e| (e, self.get(e)))
    }
}

impl Serialize for EmotionCounts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(Emotion::ALL.len()))?;
        for (emotion, count) in self.iter() {
            map.serialize_entry(emotion.label(), &count)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emotion_index_roundtrip() {
        for (i, &emotion) in Emotion::ALL.iter().enumerate() {
            assert_eq!(emotion.index(), i);
            assert_eq!(Emotion::from_index(i), Some(emotion));
        }
        assert_eq!(Emotion::from_index(7), None);
    }

    #[test]
    fn test_emotion_label_order_matches_model() {
        let labels: Vec<&str> = Emotion::ALL.iter().map(|e| e.label()).collect();
        assert_eq!(
            labels,
            ["angry", "disgust", "fear", "happy", "neutral", "sad", "surprise"]
        );
    }

    #[test]
    fn test_emotion_serializes_as_label() {
        let json = serde_json::to_string(&Emotion::Happy).unwrap();
        assert_eq!(json, "\"happy\"");
        let back: Emotion = serde_json::from_str("\"surprise\"").unwrap();
        assert_eq!(back, Emotion::Surprise);
    }

    #[test]
    fn test_clamp_inside_is_identity() {
        let r = FaceRect::new(10, 20, 30, 40);
        assert_eq!(r.clamped_to(100, 100), Some(r));
    }

    #[test]
    fn test_clamp_partial_overlap() {
        let r = FaceRect::new(-5, 90, 20, 20);
        let clamped = r.clamped_to(100, 100).unwrap();
        assert_eq!(clamped, FaceRect::new(0, 90, 15, 10));
    }

    #[test]
    fn test_clamp_outside_is_none() {
        let r = FaceRect::new(200, 200, 10, 10);
        assert_eq!(r.clamped_to(100, 100), None);
        let r = FaceRect::new(-50, 0, 10, 10);
        assert_eq!(r.clamped_to(100, 100), None);
    }

    #[test]
    fn test_counts_increment_and_total() {
        let mut counts = EmotionCounts::new();
        assert!(counts.is_empty());
        counts.increment(Emotion::Happy);
        counts.increment(Emotion::Happy);
        counts.increment(Emotion::Sad);
        assert_eq!(counts.get(Emotion::Happy), 2);
        assert_eq!(counts.get(Emotion::Sad), 1);
        assert_eq!(counts.get(Emotion::Angry), 0);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_counts_serialize_all_keys_in_order() {
        let mut counts = EmotionCounts::new();
        counts.increment(Emotion::Fear);
        let json = serde_json::to_string(&counts).unwrap();
        assert_eq!(
            json,
            r#"{"angry":0,"disgust":0,"fear":1,"happy":0,"neutral":0,"sad":0,"surprise":0}"#
        );
    }

    #[test]
    fn test_detection_serializes_box_field() {
        let det = Detection {
            rect: FaceRect::new(1, 2, 3, 4),
            emotion: Emotion::Neutral,
            confidence: 0.5,
        };
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["box"]["x"], 1);
        assert_eq!(value["emotion"], "neutral");
    }
}
