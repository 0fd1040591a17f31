//! Expression evaluation against a resolution context.
//!
//! Resolution is pure and deterministic: identical (expression, context)
//! pairs always yield identical output. The context is append-only during a
//! run — a resource's attributes are published only once it is Created.

use super::error::ResolveError;
use super::types::{scalar_to_string, Attributes, Expr, Mapping, StackTemplate};
use indexmap::IndexMap;
use std::collections::HashSet;

/// Parameter values, mapping tables, and created resources' attributes
/// available when evaluating an expression.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    parameters: IndexMap<String, serde_yaml_ng::Value>,
    mappings: IndexMap<String, Mapping>,
    declared: HashSet<String>,
    attributes: IndexMap<String, Attributes>,
}

impl ResolutionContext {
    /// Bind parameters from overrides and defaults, validating enum
    /// membership. Fails on an undeclared override, a parameter with neither
    /// override nor default, or a value outside `allowed_values`.
    pub fn new(
        template: &StackTemplate,
        overrides: &IndexMap<String, String>,
    ) -> Result<Self, ResolveError> {
        for name in overrides.keys() {
            if !template.parameters.contains_key(name) {
                return Err(ResolveError::UnknownParameter(name.clone()));
            }
        }

        let mut parameters = IndexMap::new();
        for (name, decl) in &template.parameters {
            let value = match overrides.get(name) {
                Some(raw) => serde_yaml_ng::Value::String(raw.clone()),
                None => decl
                    .default
                    .clone()
                    .ok_or_else(|| ResolveError::MissingParameterValue(name.clone()))?,
            };

            if !decl.allowed_values.is_empty() {
                // Overrides arrive as strings, so membership compares on the
                // scalar string representation.
                let wanted = scalar_to_string(&value);
                let allowed = decl
                    .allowed_values
                    .iter()
                    .any(|a| a == &value || (wanted.is_some() && scalar_to_string(a) == wanted));
                if !allowed {
                    return Err(ResolveError::InvalidEnumValue {
                        name: name.clone(),
                        value: wanted.unwrap_or_else(|| format!("{value:?}")),
                    });
                }
            }

            parameters.insert(name.clone(), value);
        }

        Ok(Self {
            parameters,
            mappings: template.mappings.clone(),
            declared: template.resources.keys().cloned().collect(),
            attributes: IndexMap::new(),
        })
    }

    /// Effective value of a declared parameter.
    pub fn parameter(&self, name: &str) -> Result<&serde_yaml_ng::Value, ResolveError> {
        self.parameters
            .get(name)
            .ok_or_else(|| ResolveError::UnknownParameter(name.to_string()))
    }

    /// Three-level mapping lookup. Each missing level reports exactly which
    /// lookup failed; there is no default fallback.
    pub fn mapping_lookup(
        &self,
        mapping: &str,
        key: &str,
        attribute: &str,
    ) -> Result<serde_yaml_ng::Value, ResolveError> {
        let table = self
            .mappings
            .get(mapping)
            .ok_or_else(|| ResolveError::UnknownMapping(mapping.to_string()))?;
        let entry = table
            .get(key)
            .ok_or_else(|| ResolveError::UnknownMappingKey {
                mapping: mapping.to_string(),
                key: key.to_string(),
            })?;
        entry
            .get(attribute)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownMappingAttribute {
                mapping: mapping.to_string(),
                key: key.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Attribute of a Created resource. A declared-but-not-created resource
    /// is an ordering bug, distinct from an undeclared one.
    pub fn attribute(
        &self,
        resource: &str,
        attribute: &str,
    ) -> Result<serde_yaml_ng::Value, ResolveError> {
        if !self.declared.contains(resource) {
            return Err(ResolveError::UnknownResource(resource.to_string()));
        }
        let attrs = self.attributes.get(resource).ok_or_else(|| {
            ResolveError::AttributeNotAvailable {
                resource: resource.to_string(),
                attribute: attribute.to_string(),
            }
        })?;
        attrs
            .get(attribute)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownAttribute {
                resource: resource.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Publish a created resource's attributes. Append-only.
    pub fn publish(&mut self, resource: &str, attributes: Attributes) {
        self.attributes.insert(resource.to_string(), attributes);
    }

    /// True once a resource's attributes have been published.
    pub fn is_published(&self, resource: &str) -> bool {
        self.attributes.contains_key(resource)
    }
}

/// Resolve an expression to a YAML value.
pub fn resolve(
    expr: &Expr,
    ctx: &ResolutionContext,
) -> Result<serde_yaml_ng::Value, ResolveError> {
    match expr {
        Expr::Scalar(v) => Ok(v.clone()),
        Expr::Ref { name } => ctx.parameter(name).cloned(),
        Expr::GetAttr { get_attr: (resource, attribute) } => ctx.attribute(resource, attribute),
        Expr::FindInMap { find_in_map: (mapping, key, attribute) } => {
            ctx.mapping_lookup(mapping, key, attribute)
        }
        Expr::Join { join } => {
            let mut out = String::new();
            for (i, child) in join.iter().enumerate() {
                let value = resolve(child, ctx)?;
                out.push_str(&join_piece(&value, i)?);
            }
            Ok(serde_yaml_ng::Value::String(out))
        }
        Expr::Sub { sub } => resolve_sub(sub, ctx),
        Expr::Seq(items) => {
            let resolved = items
                .iter()
                .map(|e| resolve(e, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(serde_yaml_ng::Value::Sequence(resolved))
        }
        Expr::Map(entries) => {
            let mut mapping = serde_yaml_ng::Mapping::new();
            for (k, e) in entries {
                mapping.insert(
                    serde_yaml_ng::Value::String(k.clone()),
                    resolve(e, ctx)?,
                );
            }
            Ok(serde_yaml_ng::Value::Mapping(mapping))
        }
    }
}

/// Coerce one resolved join child to a string. Sequences flatten in order,
/// so `join: ["", [a, b, c]]` yields "abc"; maps are a type mismatch.
fn join_piece(value: &serde_yaml_ng::Value, index: usize) -> Result<String, ResolveError> {
    if let serde_yaml_ng::Value::Sequence(items) = value {
        let mut out = String::new();
        for item in items {
            out.push_str(&join_piece(item, index)?);
        }
        return Ok(out);
    }
    scalar_to_string(value).ok_or_else(|| ResolveError::TypeMismatch {
        context: format!("join element {index}"),
    })
}

/// Resolve all properties of a resource in declaration order.
pub fn resolve_properties(
    properties: &IndexMap<String, Expr>,
    ctx: &ResolutionContext,
) -> Result<Attributes, ResolveError> {
    let mut out = IndexMap::new();
    for (name, expr) in properties {
        out.insert(name.clone(), resolve(expr, ctx)?);
    }
    Ok(out)
}

/// Resolve a substitution template by splicing `${...}` placeholders.
/// `${name}` is a parameter reference, `${resource.attr}` an attribute
/// reference. Any unresolvable placeholder fails the whole substitution.
fn resolve_sub(
    template: &str,
    ctx: &ResolutionContext,
) -> Result<serde_yaml_ng::Value, ResolveError> {
    let mut out = String::new();
    let mut rest = template;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find('}').ok_or_else(|| {
            ResolveError::UnclosedPlaceholder(template.len() - rest.len() + open)
        })?;
        let key = after[..close].trim();
        if key.is_empty() {
            return Err(ResolveError::EmptyPlaceholder);
        }

        let value = match key.split_once('.') {
            Some((resource, attribute)) => ctx.attribute(resource, attribute)?,
            None => ctx.parameter(key)?.clone(),
        };
        let piece = scalar_to_string(&value).ok_or_else(|| ResolveError::TypeMismatch {
            context: format!("placeholder '${{{key}}}'"),
        })?;
        out.push_str(&piece);

        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(serde_yaml_ng::Value::String(out))
}

/// Best-effort scan of a substitution template's placeholder keys.
/// Malformed templates are reported by `preflight`, not here.
pub(crate) fn sub_placeholders(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else { break };
        let key = after[..close].trim();
        if !key.is_empty() {
            keys.push(key.to_string());
        }
        rest = &after[close + 1..];
    }
    keys
}

/// Statically check an expression against the template: every parameter ref,
/// mapping triple, and attribute target must be declared. Attribute *values*
/// are the only thing deferred to provisioning time, so a template that
/// passes preflight can only fail on provider calls.
pub fn preflight(expr: &Expr, template: &StackTemplate) -> Result<(), ResolveError> {
    match expr {
        Expr::Scalar(_) => Ok(()),
        Expr::Ref { name } => {
            if template.parameters.contains_key(name) {
                Ok(())
            } else {
                Err(ResolveError::UnknownParameter(name.clone()))
            }
        }
        Expr::GetAttr { get_attr: (resource, _) } => {
            if template.resources.contains_key(resource) {
                Ok(())
            } else {
                Err(ResolveError::UnknownResource(resource.clone()))
            }
        }
        Expr::FindInMap { find_in_map: (mapping, key, attribute) } => {
            let table = template
                .mappings
                .get(mapping)
                .ok_or_else(|| ResolveError::UnknownMapping(mapping.clone()))?;
            let entry = table.get(key).ok_or_else(|| ResolveError::UnknownMappingKey {
                mapping: mapping.clone(),
                key: key.clone(),
            })?;
            if entry.contains_key(attribute) {
                Ok(())
            } else {
                Err(ResolveError::UnknownMappingAttribute {
                    mapping: mapping.clone(),
                    key: key.clone(),
                    attribute: attribute.clone(),
                })
            }
        }
        Expr::Join { join } => join.iter().try_for_each(|e| preflight(e, template)),
        Expr::Sub { sub } => {
            // Reject malformed templates up front
            let mut rest: &str = sub;
            while let Some(open) = rest.find("${") {
                let after = &rest[open + 2..];
                let close = after.find('}').ok_or_else(|| {
                    ResolveError::UnclosedPlaceholder(sub.len() - rest.len() + open)
                })?;
                let key = after[..close].trim();
                if key.is_empty() {
                    return Err(ResolveError::EmptyPlaceholder);
                }
                match key.split_once('.') {
                    Some((resource, _)) => {
                        if !template.resources.contains_key(resource) {
                            return Err(ResolveError::UnknownResource(resource.to_string()));
                        }
                    }
                    None => {
                        if !template.parameters.contains_key(key) {
                            return Err(ResolveError::UnknownParameter(key.to_string()));
                        }
                    }
                }
                rest = &after[close + 1..];
            }
            Ok(())
        }
        Expr::Seq(items) => items.iter().try_for_each(|e| preflight(e, template)),
        Expr::Map(entries) => entries.values().try_for_each(|e| preflight(e, template)),
    }
}
