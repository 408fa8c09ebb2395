//! Conversion of rendered YAML text into generic resource documents.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{Error, Result};

/// A rendered resource: a map of string keys to arbitrary values
pub type Document = Map<String, Value>;

/// Splits multi-document YAML into its documents.
///
/// Each document is converted on its own, so a malformed one does not hide the
/// others. Empty and null documents are dropped.
pub fn documents_from_yaml(content: &str) -> Vec<Result<Document>> {
    split_documents(content)
        .into_iter()
        .filter(|chunk| !chunk.trim().is_empty())
        .filter_map(|chunk| match serde_yaml::from_str::<serde_yaml::Value>(&chunk) {
            Ok(serde_yaml::Value::Null) => None,
            Ok(value) => Some(document_from_yaml_value(value)),
            Err(e) => Some(Err(Error::Conversion(e.to_string()))),
        })
        .collect()
}

/// Converts multi-document YAML, keeping the documents that convert and logging the rest
pub fn partition_documents(name: &str, content: &str) -> Vec<Document> {
    let (ok, failed): (Vec<_>, Vec<_>) = documents_from_yaml(content)
        .into_iter()
        .partition(Result::is_ok);
    for err in failed.into_iter().filter_map(Result::err) {
        warn!(file = name, "skipping rendered document: {err}");
    }
    ok.into_iter().filter_map(Result::ok).collect()
}

/// Parses a single YAML document that must be a mapping
pub fn document_from_str(content: &str) -> Result<Document> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| Error::Conversion(e.to_string()))?;
    document_from_yaml_value(value)
}

/// Exposes any serializable entity as a nested map, keeping its serialized field names
pub fn to_document<T: Serialize>(obj: &T) -> Result<Document> {
    match serde_json::to_value(obj)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Conversion(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
    }
}

fn document_from_yaml_value(value: serde_yaml::Value) -> Result<Document> {
    match normalize(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Conversion(format!(
            "expected a mapping at the top level, got {}",
            type_name(&other)
        ))),
    }
}

/// Converts YAML into JSON values, stringifying non-string mapping keys
fn normalize(value: serde_yaml::Value) -> Result<Value> {
    use serde_yaml::Value as Yaml;
    Ok(match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                let f = n.as_f64().unwrap_or_default();
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| Error::Conversion(format!("{f} is not a valid number")))?
            }
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(seq) => Value::Array(seq.into_iter().map(normalize).collect::<Result<_>>()?),
        Yaml::Mapping(mapping) => {
            let mut map = Map::with_capacity(mapping.len());
            for (k, v) in mapping {
                map.insert(key_to_string(k)?, normalize(v)?);
            }
            Value::Object(map)
        }
        Yaml::Tagged(tagged) => normalize(tagged.value)?,
    })
}

fn key_to_string(key: serde_yaml::Value) -> Result<String> {
    use serde_yaml::Value as Yaml;
    match key {
        Yaml::String(s) => Ok(s),
        Yaml::Bool(b) => Ok(b.to_string()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Null => Ok("null".to_string()),
        Yaml::Tagged(tagged) => key_to_string(tagged.value),
        other => Err(Error::Conversion(format!(
            "unsupported mapping key {other:?}"
        ))),
    }
}

/// Document separators are lines starting with `---`. Content after the marker on the same
/// line opens the next document.
fn split_documents(content: &str) -> Vec<String> {
    let mut docs = vec![];
    let mut current = String::new();
    for line in content.lines() {
        if let Some(rest) = separator(line) {
            docs.push(std::mem::take(&mut current));
            if !rest.is_empty() && !rest.starts_with('#') {
                current.push_str(rest);
                current.push('\n');
            }
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    docs.push(current);
    docs
}

/// The text following a `---` marker, or `None` when `line` is not a separator
fn separator(line: &str) -> Option<&str> {
    let rest = line.trim_end().strip_prefix("---")?;
    match rest.chars().next() {
        None | Some('#') => Some(rest),
        Some(c) if c.is_whitespace() => Some(rest.trim_start()),
        Some(_) => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_and_skips_empty_documents() {
        let docs = documents_from_yaml(
            "---\napiVersion: v1\nkind: ConfigMap\n---\n\n---\napiVersion: v1\nkind: Secret\n",
        );
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].as_ref().unwrap()["kind"], json!("Secret"));
    }

    #[test]
    fn separators_inside_values_are_not_split() {
        let docs = documents_from_yaml("kind: ConfigMap\ndata:\n  banner: \"a---b\"\n");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].as_ref().unwrap()["data"]["banner"], json!("a---b"));
    }

    #[test]
    fn normalizes_non_string_keys() {
        let doc = document_from_str("ports:\n  80: http\n  true: yes\n  1.5: half\n").unwrap();
        assert_eq!(
            Value::Object(doc),
            json!({"ports": {"80": "http", "true": "yes", "1.5": "half"}})
        );
    }

    #[test]
    fn top_level_must_be_a_mapping() {
        assert!(matches!(document_from_str("- a\n- b\n"), Err(Error::Conversion(_))));
        assert!(matches!(document_from_str("just a string"), Err(Error::Conversion(_))));
    }

    #[test]
    fn malformed_document_does_not_hide_the_others() {
        let content = "kind: A\n---\nkind: [unterminated\n---\nkind: C\n";
        let docs = documents_from_yaml(content);
        assert_eq!(docs.len(), 3);
        assert!(docs[1].is_err());

        let kept = partition_documents("main", content);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["kind"], json!("A"));
        assert_eq!(kept[1]["kind"], json!("C"));
    }

    #[test]
    fn content_on_the_separator_line_is_kept() {
        let content = "--- {apiVersion: v1, kind: ConfigMap, metadata: {name: a}}\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n--- kind: Secret\nmetadata:\n  name: c\n--- # trailing comment\n";
        let kept = partition_documents("main", content);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0]["metadata"]["name"], json!("a"));
        assert_eq!(kept[1]["metadata"]["name"], json!("b"));
        assert_eq!(kept[2]["kind"], json!("Secret"));
        assert_eq!(kept[2]["metadata"]["name"], json!("c"));
    }

    #[test]
    fn to_document_keeps_serialized_names() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Spec {
            plan_id: String,
        }
        let doc = to_document(&Spec {
            plan_id: "small".into(),
        })
        .unwrap();
        assert_eq!(doc["planId"], json!("small"));
        assert!(to_document(&"scalar").is_err());
    }
}
