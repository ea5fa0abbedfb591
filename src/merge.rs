//! Darwin Core extension merge
//!
//! Rows requested in the `dwc` format keep only the fields that are terms of
//! the configured extensions; everything else is folded into the dynamic
//! properties term as a JSON object.

use crate::{Config, PackagerError, Row};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionSpec {
    pub extension_paths: Vec<PathBuf>,
    pub dynamic_term: String,
    pub id_field: String,
}

impl ExtensionSpec {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extension_paths: config.dwc_extension_paths.clone(),
            dynamic_term: config.dwc_dynamic_term.clone(),
            id_field: config.dwc_id_field.clone(),
        }
    }
}

pub trait ExtensionMerger: Send + Sync {
    fn merge(&self, rows: Vec<Row>, spec: &ExtensionSpec) -> Result<Vec<Row>, PackagerError>;
}

/// Merger driven by the `<property name="...">` terms of extension files.
#[derive(Debug, Default, Clone, Copy)]
pub struct DwcTermMerger;

impl DwcTermMerger {
    fn load_terms(spec: &ExtensionSpec) -> Result<BTreeSet<String>, PackagerError> {
        let mut terms = BTreeSet::new();
        for path in &spec.extension_paths {
            let definition = std::fs::read_to_string(path).map_err(|e| {
                PackagerError::MergeFailure(format!(
                    "cannot read extension {}: {e}",
                    path.display()
                ))
            })?;
            terms.extend(property_names(&definition)?);
        }

        if terms.is_empty() {
            return Err(PackagerError::MergeFailure(
                "extensions define no Darwin Core terms".to_string(),
            ));
        }
        Ok(terms)
    }
}

/// Matches `<property ... name="term">`, with either quote style.
const PROPERTY_NAME: &str = r#"<property\s[^>]*?\bname\s*=\s*(?:"([^"]*)"|'([^']*)')"#;

/// Names of the `<property>` elements of an extension definition.
fn property_names(definition: &str) -> Result<Vec<String>, PackagerError> {
    let pattern = Regex::new(PROPERTY_NAME)
        .map_err(|e| PackagerError::MergeFailure(format!("property pattern: {e}")))?;

    Ok(pattern
        .captures_iter(definition)
        .filter_map(|captures| captures.get(1).or_else(|| captures.get(2)))
        .map(|name| name.as_str().to_string())
        .collect())
}

impl ExtensionMerger for DwcTermMerger {
    fn merge(&self, rows: Vec<Row>, spec: &ExtensionSpec) -> Result<Vec<Row>, PackagerError> {
        let terms = Self::load_terms(spec)?;

        rows.into_iter()
            .map(|row| {
                if !row.contains_key(&spec.id_field) {
                    return Err(PackagerError::MergeFailure(format!(
                        "record without {} field",
                        spec.id_field
                    )));
                }

                let mut merged = Row::new();
                let mut dynamic = Row::new();
                for (field, value) in row {
                    if field == spec.id_field || terms.contains(&field) {
                        merged.insert(field, value);
                    } else if !value.is_null() {
                        dynamic.insert(field, value);
                    }
                }

                if !dynamic.is_empty() {
                    merged.insert(
                        spec.dynamic_term.clone(),
                        Value::String(Value::Object(dynamic).to_string()),
                    );
                }
                Ok(merged)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OCCURRENCE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<extension name="Occurrence" namespace="http://rs.tdwg.org/dwc/terms/" rowType="http://rs.tdwg.org/dwc/terms/Occurrence">
  <property group="Record" name="type" namespace="http://purl.org/dc/terms/" qualName="http://purl.org/dc/terms/type"/>
  <property group="Occurrence" name="catalogNumber" namespace="http://rs.tdwg.org/dwc/terms/"
      qualName="http://rs.tdwg.org/dwc/terms/catalogNumber"/>
  <property group="Record" name="dynamicProperties" namespace="http://rs.tdwg.org/dwc/terms/"/>
</extension>
"#;

    fn spec(dir: &tempfile::TempDir) -> ExtensionSpec {
        let path = dir.path().join("dwc_occurrence.xml");
        std::fs::write(&path, OCCURRENCE).unwrap();
        ExtensionSpec {
            extension_paths: vec![path],
            dynamic_term: "dynamicProperties".to_string(),
            id_field: "_id".to_string(),
        }
    }

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_property_names() {
        assert_eq!(
            property_names(OCCURRENCE).unwrap(),
            vec!["type", "catalogNumber", "dynamicProperties"]
        );
    }

    #[test]
    fn test_property_names_ignore_lookalike_elements_and_accept_single_quotes() {
        let definition = r#"<extension name="Occurrence">
  <properties name="notATerm">
    <property group='Record' name='basisOfRecord'/>
    <propertyGroup name="alsoNotATerm"/>
    <property
        name="eventDate" namespace="http://rs.tdwg.org/dwc/terms/"/>
  </properties>
</extension>"#;

        assert_eq!(
            property_names(definition).unwrap(),
            vec!["basisOfRecord", "eventDate"]
        );
    }

    #[test]
    fn test_non_terms_move_to_dynamic_properties() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![row(json!({
            "_id": 7,
            "catalogNumber": "BMNH(E) 1234",
            "colour": "red",
            "legs": 6,
            "notes": null
        }))];

        let merged = DwcTermMerger.merge(rows, &spec(&dir)).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["_id"], json!(7));
        assert_eq!(merged[0]["catalogNumber"], json!("BMNH(E) 1234"));
        assert!(!merged[0].contains_key("colour"));

        let dynamic: Value =
            serde_json::from_str(merged[0]["dynamicProperties"].as_str().unwrap()).unwrap();
        assert_eq!(dynamic, json!({"colour": "red", "legs": 6}));
    }

    #[test]
    fn test_rows_of_terms_only_have_no_dynamic_properties() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![row(json!({"_id": 1, "type": "PhysicalObject"}))];

        let merged = DwcTermMerger.merge(rows, &spec(&dir)).unwrap();
        assert!(!merged[0].contains_key("dynamicProperties"));
    }

    #[test]
    fn test_missing_id_or_extension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = DwcTermMerger.merge(vec![row(json!({"type": "x"}))], &spec(&dir));
        assert!(matches!(result, Err(PackagerError::MergeFailure(_))));

        let missing = ExtensionSpec {
            extension_paths: vec![dir.path().join("absent.xml")],
            ..spec(&dir)
        };
        let result = DwcTermMerger.merge(vec![row(json!({"_id": 1}))], &missing);
        assert!(matches!(result, Err(PackagerError::MergeFailure(_))));
    }
}
