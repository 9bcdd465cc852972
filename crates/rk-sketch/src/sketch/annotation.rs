//! Text annotations anchored on key points

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Vertical placement of a text relative to its anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VerticalAlignment {
    Bottom,
    Top,
    #[default]
    Center,
}

/// Horizontal placement of a text relative to its anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HorizontalAlignment {
    Left,
    Right,
    #[default]
    Center,
}

/// Plain text, or a named attribute whose value is a default to fill in
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum TextKind {
    #[default]
    Plain,
    Attribute { name: String },
}

/// A text drawn at a key point
#[derive(Debug, Clone, PartialEq)]
pub struct Text {
    /// Unique identifier
    pub id: Uuid,
    key_point: Uuid,
    value: String,
    height: f64,
    /// Rotation in radians
    angle: f64,
    vertical: VerticalAlignment,
    horizontal: HorizontalAlignment,
    kind: TextKind,
}

impl Text {
    pub(crate) fn new(key_point: Uuid, value: impl Into<String>, height: f64, kind: TextKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_point,
            value: value.into(),
            height,
            angle: 0.0,
            vertical: VerticalAlignment::default(),
            horizontal: HorizontalAlignment::default(),
            kind,
        }
    }

    /// Anchor key point
    pub fn key_point(&self) -> Uuid {
        self.key_point
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn vertical_alignment(&self) -> VerticalAlignment {
        self.vertical
    }

    pub fn horizontal_alignment(&self) -> HorizontalAlignment {
        self.horizontal
    }

    pub fn kind(&self) -> &TextKind {
        &self.kind
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self.kind, TextKind::Attribute { .. })
    }

    /// Attribute name, or the text itself for plain texts
    pub fn name(&self) -> &str {
        match &self.kind {
            TextKind::Attribute { name } => name,
            TextKind::Plain => &self.value,
        }
    }

    pub(crate) fn set_value(&mut self, value: String) -> String {
        std::mem::replace(&mut self.value, value)
    }

    pub(crate) fn set_height(&mut self, height: f64) -> f64 {
        std::mem::replace(&mut self.height, height)
    }

    pub(crate) fn set_angle(&mut self, angle: f64) -> f64 {
        std::mem::replace(&mut self.angle, angle)
    }

    pub(crate) fn set_alignment(&mut self, vertical: VerticalAlignment, horizontal: HorizontalAlignment) {
        self.vertical = vertical;
        self.horizontal = horizontal;
    }

    /// Rename an attribute. Returns the old name, or `None` for plain texts.
    pub(crate) fn rename_attribute(&mut self, name: String) -> Option<String> {
        match &mut self.kind {
            TextKind::Attribute { name: current } => Some(std::mem::replace(current, name)),
            TextKind::Plain => None,
        }
    }
}

/// Serialized form of a text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextData {
    pub id: Uuid,
    pub key_point: Uuid,
    pub value: String,
    pub height: f64,
    #[serde(default)]
    pub angle: f64,
    #[serde(default)]
    pub vertical: VerticalAlignment,
    #[serde(default)]
    pub horizontal: HorizontalAlignment,
    #[serde(default)]
    pub kind: TextKind,
}

impl From<&Text> for TextData {
    fn from(text: &Text) -> Self {
        Self {
            id: text.id,
            key_point: text.key_point,
            value: text.value.clone(),
            height: text.height,
            angle: text.angle,
            vertical: text.vertical,
            horizontal: text.horizontal,
            kind: text.kind.clone(),
        }
    }
}

impl From<TextData> for Text {
    fn from(data: TextData) -> Self {
        Self {
            id: data.id,
            key_point: data.key_point,
            value: data.value,
            height: data.height,
            angle: data.angle,
            vertical: data.vertical,
            horizontal: data.horizontal,
            kind: data.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_name_and_value() {
        let kp = Uuid::new_v4();
        let plain = Text::new(kp, "Label", 0.5, TextKind::Plain);
        assert_eq!(plain.name(), "Label");
        assert!(!plain.is_attribute());

        let mut attribute = Text::new(
            kp,
            "M8",
            0.5,
            TextKind::Attribute {
                name: "Thread".to_string(),
            },
        );
        assert_eq!(attribute.name(), "Thread");
        assert_eq!(attribute.value(), "M8");
        assert_eq!(attribute.rename_attribute("Size".to_string()).as_deref(), Some("Thread"));
        assert_eq!(attribute.name(), "Size");
    }

    #[test]
    fn test_text_data_survives_ron() {
        let mut text = Text::new(
            Uuid::new_v4(),
            "M8",
            0.25,
            TextKind::Attribute {
                name: "Thread".to_string(),
            },
        );
        text.set_angle(0.5);
        text.set_alignment(VerticalAlignment::Top, HorizontalAlignment::Left);

        let encoded = ron::to_string(&TextData::from(&text)).unwrap();
        let decoded: TextData = ron::from_str(&encoded).unwrap();
        assert_eq!(Text::from(decoded), text);
    }

    #[test]
    fn test_text_data_defaults() {
        let kp = Uuid::new_v4();
        let json = format!(
            r#"{{"id":"{}","key_point":"{}","value":"Note","height":1.0}}"#,
            Uuid::new_v4(),
            kp
        );
        let text = Text::from(serde_json::from_str::<TextData>(&json).unwrap());
        assert_eq!(text.kind(), &TextKind::Plain);
        assert_eq!(text.vertical_alignment(), VerticalAlignment::Center);
        assert_eq!(text.horizontal_alignment(), HorizontalAlignment::Center);
        assert_eq!(text.angle(), 0.0);
    }
}
