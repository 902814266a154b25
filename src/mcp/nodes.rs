//! Trimming of Figma node documents before they are returned to the client.
//!
//! The plugin reports nodes in Figma's REST shape, which is large and full of
//! data a model cannot use. [`filter_figma_node`] keeps the identifying
//! fields, geometry, text and paint of each node, with colours rewritten as
//! hex strings, and drops vector nodes entirely.

use serde_json::{Map, Value};

/// Node fields copied through unchanged.
const KEPT_FIELDS: &[&str] = &[
    "id",
    "name",
    "type",
    "cornerRadius",
    "absoluteBoundingBox",
    "characters",
];

/// Text style fields that are kept.
const STYLE_FIELDS: &[&str] = &[
    "fontFamily",
    "fontStyle",
    "fontWeight",
    "fontSize",
    "textAlignHorizontal",
    "letterSpacing",
    "lineHeightPx",
];

/// Returns the trimmed form of `node`, or `None` for a vector node.
///
/// Children are filtered recursively and vector children are removed.
#[must_use]
pub fn filter_figma_node(node: &Value) -> Option<Value> {
    let Value::Object(node) = node else {
        return Some(node.clone());
    };
    if node.get("type").and_then(Value::as_str) == Some("VECTOR") {
        return None;
    }

    let mut filtered = Map::new();
    for &field in KEPT_FIELDS {
        if let Some(value) = node.get(field) {
            filtered.insert(field.to_string(), value.clone());
        }
    }

    for field in ["fills", "strokes"] {
        if let Some(paints) = node.get(field).and_then(Value::as_array) {
            if !paints.is_empty() {
                let paints = paints.iter().map(filter_paint).collect();
                filtered.insert(field.to_string(), Value::Array(paints));
            }
        }
    }

    if let Some(style) = node.get("style").and_then(Value::as_object) {
        let kept: Map<String, Value> = STYLE_FIELDS
            .iter()
            .filter_map(|&f| style.get(f).map(|v| (f.to_string(), v.clone())))
            .collect();
        filtered.insert("style".to_string(), Value::Object(kept));
    }

    if let Some(children) = node.get("children").and_then(Value::as_array) {
        let children = children.iter().filter_map(filter_figma_node).collect();
        filtered.insert("children".to_string(), Value::Array(children));
    }

    Some(Value::Object(filtered))
}

/// Strips variable bindings and image references from a paint and rewrites
/// its colours as hex.
fn filter_paint(paint: &Value) -> Value {
    let Value::Object(paint) = paint else {
        return paint.clone();
    };

    let mut paint = paint.clone();
    paint.remove("boundVariables");
    paint.remove("imageRef");

    if let Some(Value::Array(stops)) = paint.get_mut("gradientStops") {
        for stop in stops.iter_mut().filter_map(Value::as_object_mut) {
            stop.remove("boundVariables");
            hex_in_place(stop);
        }
    }
    hex_in_place(&mut paint);

    Value::Object(paint)
}

fn hex_in_place(object: &mut Map<String, Value>) {
    if let Some(color) = object.get_mut("color") {
        if let Some(hex) = rgba_to_hex(color) {
            *color = Value::String(hex);
        }
    }
}

/// Converts a `{r, g, b, a}` colour with components in `0..=1` to
/// `#rrggbb`, or `#rrggbbaa` when not fully opaque.
///
/// Strings already starting with `#` are returned as is.
#[must_use]
pub fn rgba_to_hex(color: &Value) -> Option<String> {
    if let Some(hex) = color.as_str().filter(|s| s.starts_with('#')) {
        return Some(hex.to_string());
    }

    let channel = |name: &str| color.get(name).and_then(Value::as_f64);
    let (r, g, b) = (channel("r")?, channel("g")?, channel("b")?);
    let a = channel("a").unwrap_or(1.0);

    let [r, g, b, a] = [r, g, b, a].map(to_byte);
    if a == u8::MAX {
        Some(format!("#{r:02x}{g:02x}{b:02x}"))
    } else {
        Some(format!("#{r:02x}{g:02x}{b:02x}{a:02x}"))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to 0..=255
fn to_byte(component: f64) -> u8 {
    (component.clamp(0.0, 1.0) * 255.0).round() as u8
}
