//! Merging of caller supplied JSON fragments into a built document

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Merge `fragment` into `base`. Objects merge recursively; any other value
/// in the fragment replaces what `base` holds at that key.
///
/// An empty (or whitespace-only) fragment leaves `base` untouched.
pub fn merge_json(base: Value, fragment: &str) -> Result<Value> {
    if fragment.trim().is_empty() {
        return Ok(base);
    }

    let overlay: Value = serde_json::from_str(fragment)?;
    let Value::Object(overlay) = overlay else {
        return Err(Error::InvalidOptions(format!(
            "additional document JSON must be an object, got: {}",
            fragment
        )));
    };

    match base {
        Value::Object(mut base) => {
            merge_maps(&mut base, overlay);
            Ok(Value::Object(base))
        }
        _ => Err(Error::InvalidOptions("base document is not a JSON object".into())),
    }
}

fn merge_maps(into: &mut Map<String, Value>, from: Map<String, Value>) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge_maps(existing, incoming),
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "Owner": "containerd",
            "VirtualMachine": {
                "ComputeTopology": {
                    "Memory": { "SizeInMB": 1024, "AllowOvercommit": true },
                    "Processor": { "Count": 2 }
                }
            }
        })
    }

    #[test]
    fn test_empty_fragment_is_identity() {
        assert_eq!(merge_json(document(), "").unwrap(), document());
        assert_eq!(merge_json(document(), "  \n").unwrap(), document());
        assert_eq!(merge_json(document(), "{}").unwrap(), document());
    }

    #[test]
    fn test_new_top_level_keys_preserve_existing() {
        let merged = merge_json(document(), r#"{"HostingSystemId": "abc", "Extra": [1, 2]}"#).unwrap();
        let merged = merged.as_object().unwrap();
        for (key, value) in document().as_object().unwrap() {
            assert_eq!(merged.get(key), Some(value));
        }
        assert_eq!(merged["HostingSystemId"], "abc");
        assert_eq!(merged["Extra"], json!([1, 2]));
    }

    #[test]
    fn test_fragment_wins_on_leaf_conflict() {
        let merged = merge_json(
            document(),
            r#"{"VirtualMachine": {"ComputeTopology": {"Memory": {"SizeInMB": 4096}}}}"#,
        )
        .unwrap();
        let memory = &merged["VirtualMachine"]["ComputeTopology"]["Memory"];
        assert_eq!(memory["SizeInMB"], 4096);
        assert_eq!(memory["AllowOvercommit"], true);
        assert_eq!(merged["VirtualMachine"]["ComputeTopology"]["Processor"]["Count"], 2);
    }

    #[test]
    fn test_fragment_replaces_non_object_with_object() {
        let merged = merge_json(document(), r#"{"Owner": {"Name": "x"}}"#).unwrap();
        assert_eq!(merged["Owner"], json!({ "Name": "x" }));
    }

    #[test]
    fn test_invalid_fragment() {
        assert!(matches!(merge_json(document(), "{not json"), Err(Error::Json(_))));
        assert!(matches!(merge_json(document(), "[1]"), Err(Error::InvalidOptions(_))));
    }
}
