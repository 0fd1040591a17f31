//! Stack document parsing and validation.
//!
//! Parses stack YAML and validates structural constraints:
//! - format_version must be "1.0"
//! - parameter defaults must sit within their allowed_values
//! - depends_on references must name declared resources
//! - every property and output expression must pass static preflight

use super::error::ResolveError;
use super::eval;
use super::types::StackTemplate;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Document read/parse failure.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

/// Validation finding. A valid template produces an empty list.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a stack document from disk.
pub fn parse_template_file(path: &Path) -> Result<StackTemplate, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_template(&content)
}

/// Parse a stack document from a string.
pub fn parse_template(yaml: &str) -> Result<StackTemplate, ParseError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Validate a parsed template. Returns a list of errors (empty = valid).
pub fn validate_template(template: &StackTemplate) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if template.format_version != "1.0" {
        push(format!(
            "format_version must be \"1.0\", got \"{}\"",
            template.format_version
        ));
    }

    for (name, param) in &template.parameters {
        if let (Some(default), false) = (&param.default, param.allowed_values.is_empty()) {
            if !param.allowed_values.contains(default) {
                push(format!(
                    "parameter '{}': default is not one of the allowed values",
                    name
                ));
            }
        }
    }

    for (id, resource) in &template.resources {
        if resource.resource_type.is_empty() {
            push(format!("resource '{}' has an empty type", id));
        }

        for dep in &resource.depends_on {
            if !template.resources.contains_key(dep) {
                push(format!(
                    "resource '{}' depends on unknown resource '{}'",
                    id, dep
                ));
            }
            if dep == id {
                push(format!("resource '{}' depends on itself", id));
            }
        }

        for (prop, expr) in &resource.properties {
            if let Err(e) = eval::preflight(expr, template) {
                push(preflight_message(&format!("resource '{}' property '{}'", id, prop), &e));
            }
        }
    }

    for (name, output) in &template.outputs {
        if let Err(e) = eval::preflight(&output.value, template) {
            push(preflight_message(&format!("output '{}'", name), &e));
        }
    }

    errors
}

fn preflight_message(location: &str, err: &ResolveError) -> String {
    format!("{}: {}", location, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let yaml = r#"
format_version: "1.0"
description: static website stack
parameters:
  env:
    default: dev
    allowed_values: [dev, prod]
resources:
  site_bucket:
    type: storage_bucket
    properties:
      bucket_name: { join: ["site-", { ref: env }] }
"#;
        let template = parse_template(yaml).unwrap();
        assert_eq!(template.resources.len(), 1);
        let errors = validate_template(&template);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(|e| &e.message).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_bad_format_version() {
        let yaml = r#"
format_version: "2.0"
resources:
  a:
    type: storage_bucket
"#;
        let template = parse_template(yaml).unwrap();
        let errors = validate_template(&template);
        assert!(errors.iter().any(|e| e.message.contains("format_version")));
    }

    #[test]
    fn test_default_outside_allowed_values() {
        let yaml = r#"
format_version: "1.0"
parameters:
  env:
    default: staging
    allowed_values: [dev, prod]
resources:
  a:
    type: storage_bucket
"#;
        let template = parse_template(yaml).unwrap();
        let errors = validate_template(&template);
        assert!(errors.iter().any(|e| e.message.contains("allowed values")));
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = r#"
format_version: "1.0"
resources:
  a:
    type: storage_bucket
    depends_on: [ghost]
"#;
        let template = parse_template(yaml).unwrap();
        let errors = validate_template(&template);
        assert!(errors.iter().any(|e| e.message.contains("unknown resource")));
    }

    #[test]
    fn test_self_dependency() {
        let yaml = r#"
format_version: "1.0"
resources:
  a:
    type: storage_bucket
    depends_on: [a]
"#;
        let template = parse_template(yaml).unwrap();
        let errors = validate_template(&template);
        assert!(errors.iter().any(|e| e.message.contains("depends on itself")));
    }

    #[test]
    fn test_property_referencing_unknown_parameter() {
        let yaml = r#"
format_version: "1.0"
resources:
  a:
    type: storage_bucket
    properties:
      name: { ref: ghost }
"#;
        let template = parse_template(yaml).unwrap();
        let errors = validate_template(&template);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("property 'name'") && e.message.contains("ghost")));
    }

    #[test]
    fn test_output_referencing_unknown_resource() {
        let yaml = r#"
format_version: "1.0"
resources:
  a:
    type: storage_bucket
outputs:
  url:
    value: { get_attr: [ghost, domain_name] }
"#;
        let template = parse_template(yaml).unwrap();
        let errors = validate_template(&template);
        assert!(errors
            .iter()
            .any(|e| e.message.contains("output 'url'") && e.message.contains("ghost")));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.yaml");
        std::fs::write(
            &path,
            r#"
format_version: "1.0"
resources:
  a:
    type: storage_bucket
"#,
        )
        .unwrap();
        let template = parse_template_file(&path).unwrap();
        assert_eq!(template.format_version, "1.0");
    }

    #[test]
    fn test_parse_missing_file() {
        let result = parse_template_file(Path::new("/nonexistent/stack.yaml"));
        assert!(matches!(result, Err(ParseError::Io { .. })));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_template("not: [valid: yaml: {{");
        assert!(matches!(result, Err(ParseError::Yaml(_))));
    }
}
