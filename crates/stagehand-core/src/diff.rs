//! Structural template diff that ignores sequence order.
//!
//! Templates are compared as parsed YAML documents. Mappings are compared key
//! by key, sequences are compared as multisets, and tagged values (`!Ref`,
//! `!Sub`, ...) must carry the same tag.

use serde::Serialize;
use serde_yaml::Value;
use std::fmt;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
}

/// One difference, located by a `root['Key'][0]` style path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
}

/// The set of differences between two templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateDiff {
    entries: Vec<DiffEntry>,
}

impl TemplateDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[DiffEntry] {
        &self.entries
    }

    /// Whether anything at or below `path` changed.
    pub fn touches(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path.starts_with(path))
    }
}

impl fmt::Display for TemplateDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let marker = match entry.kind {
                DiffKind::Added => '+',
                DiffKind::Removed => '-',
                DiffKind::Changed => '~',
            };
            writeln!(f, "{} {}", marker, entry.path)?;
        }
        Ok(())
    }
}

/// Diff an uploaded template against a freshly rendered one.
///
/// When nothing has been uploaded yet the whole rendered document counts as
/// added.
pub fn diff_templates(uploaded: Option<&str>, rendered: &str) -> Result<TemplateDiff> {
    let new: Value = serde_yaml::from_str(rendered)?;
    match uploaded {
        None => Ok(TemplateDiff {
            entries: vec![DiffEntry {
                path: ROOT.to_string(),
                kind: DiffKind::Added,
            }],
        }),
        Some(text) => {
            let old: Value = serde_yaml::from_str(text)?;
            Ok(diff_values(&old, &new))
        }
    }
}

pub fn diff_values(old: &Value, new: &Value) -> TemplateDiff {
    let mut entries = Vec::new();
    walk(ROOT, old, new, &mut entries);
    TemplateDiff { entries }
}

/// Deep equality where sequences compare as multisets.
pub fn unordered_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Mapping(ma), Value::Mapping(mb)) => {
            ma.len() == mb.len()
                && ma
                    .iter()
                    .all(|(k, va)| mb.get(k).is_some_and(|vb| unordered_eq(va, vb)))
        }
        (Value::Sequence(sa), Value::Sequence(sb)) => {
            sa.len() == sb.len() && match_sequences(sa, sb).unmatched_is_empty()
        }
        (Value::Tagged(ta), Value::Tagged(tb)) => {
            ta.tag == tb.tag && unordered_eq(&ta.value, &tb.value)
        }
        _ => a == b,
    }
}

const ROOT: &str = "root";

struct SequenceMatch {
    old_unmatched: Vec<usize>,
    new_unmatched: Vec<usize>,
}

impl SequenceMatch {
    fn unmatched_is_empty(&self) -> bool {
        self.old_unmatched.is_empty() && self.new_unmatched.is_empty()
    }
}

fn match_sequences(old: &[Value], new: &[Value]) -> SequenceMatch {
    let mut used = vec![false; old.len()];
    let mut new_unmatched = Vec::new();

    for (j, item) in new.iter().enumerate() {
        let found = old
            .iter()
            .enumerate()
            .find(|(i, candidate)| !used[*i] && unordered_eq(candidate, item))
            .map(|(i, _)| i);
        match found {
            Some(i) => used[i] = true,
            None => new_unmatched.push(j),
        }
    }

    let old_unmatched = used
        .iter()
        .enumerate()
        .filter(|(_, u)| !**u)
        .map(|(i, _)| i)
        .collect();

    SequenceMatch {
        old_unmatched,
        new_unmatched,
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => format!("['{}']", s),
        Value::Number(n) => format!("[{}]", n),
        Value::Bool(b) => format!("[{}]", b),
        other => format!(
            "['{}']",
            serde_yaml::to_string(other)
                .unwrap_or_default()
                .trim_end()
        ),
    }
}

fn walk(path: &str, old: &Value, new: &Value, out: &mut Vec<DiffEntry>) {
    match (old, new) {
        (Value::Mapping(mo), Value::Mapping(mn)) => {
            for (key, vo) in mo {
                let child = format!("{}{}", path, key_label(key));
                match mn.get(key) {
                    Some(vn) => walk(&child, vo, vn, out),
                    None => out.push(DiffEntry {
                        path: child,
                        kind: DiffKind::Removed,
                    }),
                }
            }
            for key in mn.keys() {
                if !mo.contains_key(key) {
                    out.push(DiffEntry {
                        path: format!("{}{}", path, key_label(key)),
                        kind: DiffKind::Added,
                    });
                }
            }
        }
        (Value::Sequence(so), Value::Sequence(sn)) => {
            let matched = match_sequences(so, sn);
            let pairs = matched.old_unmatched.len().min(matched.new_unmatched.len());

            // Leftover elements are paired positionally so nested changes are
            // reported at their own path.
            for (i, j) in matched
                .old_unmatched
                .iter()
                .zip(matched.new_unmatched.iter())
            {
                walk(&format!("{}[{}]", path, j), &so[*i], &sn[*j], out);
            }
            for i in matched.old_unmatched.iter().skip(pairs) {
                out.push(DiffEntry {
                    path: format!("{}[{}]", path, i),
                    kind: DiffKind::Removed,
                });
            }
            for j in matched.new_unmatched.iter().skip(pairs) {
                out.push(DiffEntry {
                    path: format!("{}[{}]", path, j),
                    kind: DiffKind::Added,
                });
            }
        }
        (Value::Tagged(to), Value::Tagged(tn)) if to.tag == tn.tag => {
            walk(&format!("{}<{}>", path, to.tag), &to.value, &tn.value, out);
        }
        _ => {
            if old != new {
                out.push(DiffEntry {
                    path: path.to_string(),
                    kind: DiffKind::Changed,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_identical_templates_have_empty_diff() {
        let text = "Resources:\n  Bucket:\n    Type: AWS::S3::Bucket\n";
        let diff = diff_templates(Some(text), text).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_reordered_sequences_are_equal() {
        let old = parse(
            r#"
Resources:
  Role:
    Policies:
      - Name: a
        Actions: [s3:GetObject, s3:PutObject]
      - Name: b
        Actions: [logs:PutLogEvents]
"#,
        );
        let new = parse(
            r#"
Resources:
  Role:
    Policies:
      - Name: b
        Actions: [logs:PutLogEvents]
      - Name: a
        Actions: [s3:PutObject, s3:GetObject]
"#,
        );
        assert!(diff_values(&old, &new).is_empty());
        assert!(unordered_eq(&old, &new));
    }

    #[test]
    fn test_value_change_is_reported() {
        let old = parse("Outputs:\n  Domain:\n    Value: a.example.com\n");
        let new = parse("Outputs:\n  Domain:\n    Value: b.example.com\n");
        let diff = diff_values(&old, &new);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.entries()[0].path, "root['Outputs']['Domain']['Value']");
        assert_eq!(diff.entries()[0].kind, DiffKind::Changed);
    }

    #[test]
    fn test_added_and_removed_keys() {
        let old = parse("a: 1\nb: 2\n");
        let new = parse("a: 1\nc: 3\n");
        let diff = diff_values(&old, &new);
        assert!(diff.entries().contains(&DiffEntry {
            path: "root['b']".to_string(),
            kind: DiffKind::Removed
        }));
        assert!(diff.entries().contains(&DiffEntry {
            path: "root['c']".to_string(),
            kind: DiffKind::Added
        }));
    }

    #[test]
    fn test_changed_sequence_element_is_located() {
        let old = parse("items:\n  - name: x\n    size: 1\n  - name: y\n    size: 2\n");
        let new = parse("items:\n  - name: y\n    size: 2\n  - name: x\n    size: 5\n");
        let diff = diff_values(&old, &new);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.entries()[0].path, "root['items'][1]['size']");
        assert!(diff.touches("root['items']"));
    }

    #[test]
    fn test_sequence_multiplicity_matters() {
        let old = parse("[a, a, b]");
        let new = parse("[a, b, b]");
        assert!(!diff_values(&old, &new).is_empty());
        assert!(!unordered_eq(&old, &new));
    }

    #[test]
    fn test_tags_are_compared() {
        let old = parse("Value: !Ref Bucket\n");
        let same = parse("Value: !Ref Bucket\n");
        let other = parse("Value: !GetAtt Bucket\n");
        assert!(diff_values(&old, &same).is_empty());
        assert!(!diff_values(&old, &other).is_empty());
    }

    #[test]
    fn test_missing_upload_reports_everything() {
        let diff = diff_templates(None, "a: 1\n").unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.entries()[0].kind, DiffKind::Added);
        assert_eq!(diff.to_string(), "+ root\n");
    }
}
