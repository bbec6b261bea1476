//! Dot-notation field paths: `spec.replicas`, `spec.ports[0].port`.

use std::fmt;

use serde_json::Value as Json;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: String,
    index: Option<usize>,
}

/// A parsed field path. No segments means the whole object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: SmallVec<[Segment; 6]>,
}

impl FieldPath {
    /// Parse a path. `""` and `"object"` address the whole object; a leading
    /// `.` is ignored; each segment may end with a single `[index]`.
    pub fn parse(raw: &str) -> Option<FieldPath> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "object" {
            return Some(FieldPath { raw: String::new(), segments: SmallVec::new() });
        }
        let s = trimmed.strip_prefix('.').unwrap_or(trimmed);
        let mut segments = SmallVec::new();
        for seg in s.split('.') {
            segments.push(parse_segment(seg)?);
        }
        Some(FieldPath { raw: s.to_string(), segments })
    }

    pub fn is_whole_object(&self) -> bool { self.segments.is_empty() }

    /// Follow the path; `None` when any step is missing or of the wrong shape.
    pub fn resolve<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = match cur {
                Json::Object(map) => map.get(&seg.key)?,
                _ => return None,
            };
            if let Some(i) = seg.index {
                cur = match cur {
                    Json::Array(arr) => arr.get(i)?,
                    _ => return None,
                };
            }
        }
        Some(cur)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() { f.write_str("object") } else { f.write_str(&self.raw) }
    }
}

fn parse_segment(seg: &str) -> Option<Segment> {
    let (key, index) = match seg.find('[') {
        Some(open) => {
            let inner = seg[open + 1..].strip_suffix(']')?;
            if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (&seg[..open], Some(inner.parse().ok()?))
        }
        None => (seg, None),
    };
    if key.is_empty() || key.contains(|c: char| c == '[' || c == ']' || c.is_whitespace()) {
        return None;
    }
    Some(Segment { key: key.to_string(), index })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_indexed_paths() {
        assert_eq!(FieldPath::parse(".spec.replicas").unwrap().to_string(), "spec.replicas");
        assert_eq!(FieldPath::parse("spec.ports[0].port").unwrap().to_string(), "spec.ports[0].port");
        assert!(FieldPath::parse("").unwrap().is_whole_object());
        assert!(FieldPath::parse("object").unwrap().is_whole_object());
        assert_eq!(FieldPath::parse("object").unwrap().to_string(), "object");
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["spec..x", "spec.", "spec.a[", "spec.a[x]", "spec.a[0][1]", "spec.[0]", "spec.a b"] {
            assert!(FieldPath::parse(bad).is_none(), "{bad} should be rejected");
        }
    }

    #[test]
    fn resolves_nested_values() {
        let obj = serde_json::json!({
            "metadata": { "labels": { "app.kubernetes.io/name": "web" } },
            "spec": { "ports": [{ "port": 80 }, { "port": 443 }], "replicas": 3 }
        });
        let get = |p: &str| FieldPath::parse(p).unwrap().resolve(&obj).cloned();
        assert_eq!(get("spec.replicas"), Some(serde_json::json!(3)));
        assert_eq!(get("spec.ports[1].port"), Some(serde_json::json!(443)));
        assert_eq!(get("spec.ports[2].port"), None);
        assert_eq!(get("spec.replicas.x"), None);
        assert_eq!(get(""), Some(obj.clone()));
    }
}
