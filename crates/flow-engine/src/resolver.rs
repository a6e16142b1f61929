//! Variable resolution and string interpolation.
//!
//! References take the form `${scope.path}`. The scope is a loop variable
//! bound by an enclosing Loop, the literal `inputs` scope, or a step id whose
//! output was recorded earlier in the run. The path walks nested object
//! fields with dots; numeric segments (or `[N]`) index arrays.
//!
//! A template that is exactly one reference resolves to the referenced value
//! with its type intact. Any other template containing references produces a
//! string with each reference replaced by its string form.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Name of the scope holding the caller-supplied inputs.
pub const INPUT_SCOPE: &str = "inputs";

/// Errors raised while resolving a reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The first segment names neither a loop variable, `inputs`, nor a recorded step
    #[error("Unknown variable scope '{0}'")]
    UnknownScope(String),

    /// A path segment does not exist in the referenced value
    #[error("Field '{field}' not found while resolving '{reference}'")]
    MissingField { reference: String, field: String },

    /// The reference token is malformed
    #[error("Invalid reference '{0}'")]
    InvalidReference(String),

    /// A sequence was required but the value is something else
    #[error("Value of '{0}' is not a sequence")]
    NotIterable(String),
}

impl ResolveError {
    /// Missing scopes and fields may be treated as `undefined` by callers
    /// that tolerate absent values.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::UnknownScope(_) | Self::MissingField { .. })
    }
}

/// The mutable store for a single run: caller inputs plus recorded step outputs.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    inputs: HashMap<String, Value>,
    steps: HashMap<String, Value>,
}

impl FlowContext {
    /// Create a context seeded with caller inputs.
    pub fn new(inputs: HashMap<String, Value>) -> Self {
        Self {
            inputs,
            steps: HashMap::new(),
        }
    }

    /// All caller inputs.
    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    /// Get a single caller input.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Record the output of a step, replacing any earlier value.
    pub fn set_step_output(&mut self, step_id: impl Into<String>, output: Value) {
        self.steps.insert(step_id.into(), output);
    }

    /// Forget the recorded output of a step.
    pub fn clear_step(&mut self, step_id: &str) -> Option<Value> {
        self.steps.remove(step_id)
    }

    /// Get the recorded output of a step.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// All recorded step outputs.
    pub fn steps(&self) -> &HashMap<String, Value> {
        &self.steps
    }

    /// Check whether a step has recorded output.
    pub fn has_step(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }
}

/// Loop bindings visible to the nodes currently executing.
///
/// Bindings are pushed when an iteration begins and popped when it ends, so
/// they never reach the run's [`FlowContext`].
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: Vec<(String, Value)>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a name; shadows any outer binding of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.push((name.into(), value));
    }

    /// Remove the innermost binding.
    pub fn pop(&mut self) -> Option<(String, Value)> {
        self.bindings.pop()
    }

    /// Look up a name, innermost binding first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Literal text copied as-is.
    Literal(&'a str),
    /// The trimmed body of a `${...}` token.
    Reference(&'a str),
}

/// Split a template into literal text and reference tokens.
pub fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, ResolveError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ResolveError::InvalidReference(rest[start..].to_string()))?;
        let body = after[..end].trim();
        if body.is_empty() {
            return Err(ResolveError::InvalidReference("${}".to_string()));
        }
        segments.push(Segment::Reference(body));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// All reference bodies in a template; malformed templates yield none.
pub fn references(template: &str) -> Vec<&str> {
    parse_template(template)
        .map(|segments| {
            segments
                .into_iter()
                .filter_map(|s| match s {
                    Segment::Reference(r) => Some(r),
                    Segment::Literal(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// All reference bodies found anywhere inside a value template.
pub fn value_references(template: &Value) -> Vec<String> {
    match template {
        Value::String(s) => references(s).into_iter().map(str::to_string).collect(),
        Value::Array(items) => items.iter().flat_map(value_references).collect(),
        Value::Object(map) => map.values().flat_map(value_references).collect(),
        _ => Vec::new(),
    }
}

/// The scope name of a reference body (`step.output.x` → `step`).
pub fn reference_scope(reference: &str) -> &str {
    let end = reference
        .find(|c| c == '.' || c == '[')
        .unwrap_or(reference.len());
    &reference[..end]
}

/// Split a path into segments, accepting both `a.0.b` and `a[0].b`.
fn split_path(path: &str) -> Vec<&str> {
    path.split('.')
        .flat_map(|part| part.split(|c| c == '[' || c == ']'))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Walk `segments` into `value`, returning the first segment that is missing.
pub fn lookup_path<'v>(value: &'v Value, segments: &[&str]) -> Result<&'v Value, String> {
    let mut current = value;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(*segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| segment.to_string())?;
    }
    Ok(current)
}

/// String form used when a value is interpolated into text.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves templates against a flow context and the active loop scope.
///
/// Resolution is pure: it never mutates the context.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    context: &'a FlowContext,
    scope: &'a Scope,
}

impl<'a> Resolver<'a> {
    pub fn new(context: &'a FlowContext, scope: &'a Scope) -> Self {
        Self { context, scope }
    }

    /// Resolve a single reference body such as `fetch.output.items.0`.
    pub fn lookup(&self, reference: &str) -> Result<Value, ResolveError> {
        let segments = split_path(reference);
        let Some((scope_name, path)) = segments.split_first() else {
            return Err(ResolveError::InvalidReference(reference.to_string()));
        };

        let missing = |field: String| ResolveError::MissingField {
            reference: reference.to_string(),
            field,
        };

        if let Some(bound) = self.scope.get(scope_name) {
            return lookup_path(bound, path).cloned().map_err(missing);
        }

        if *scope_name == INPUT_SCOPE {
            let Some((name, rest)) = path.split_first() else {
                let all = self
                    .context
                    .inputs()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                return Ok(Value::Object(all));
            };
            let input = self
                .context
                .input(name)
                .ok_or_else(|| missing(name.to_string()))?;
            return lookup_path(input, rest).cloned().map_err(missing);
        }

        if let Some(output) = self.context.step_output(scope_name) {
            return lookup_path(output, path).cloned().map_err(missing);
        }

        Err(ResolveError::UnknownScope(scope_name.to_string()))
    }

    /// Resolve a string template.
    ///
    /// Plain literals come back as strings; a lone reference keeps its type;
    /// mixed templates are interpolated.
    pub fn resolve(&self, template: &str) -> Result<Value, ResolveError> {
        let segments = parse_template(template)?;
        match segments.as_slice() {
            [Segment::Reference(reference)] => self.lookup(reference),
            _ => self.interpolate_segments(&segments).map(Value::String),
        }
    }

    /// Resolve a template and always produce a string.
    pub fn interpolate(&self, template: &str) -> Result<String, ResolveError> {
        let segments = parse_template(template)?;
        self.interpolate_segments(&segments)
    }

    fn interpolate_segments(&self, segments: &[Segment<'_>]) -> Result<String, ResolveError> {
        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Reference(reference) => out.push_str(&display_value(&self.lookup(reference)?)),
            }
        }
        Ok(out)
    }

    /// Resolve every string inside a value template, recursing into arrays
    /// and objects. Non-string scalars are returned unchanged.
    pub fn resolve_value(&self, template: &Value) -> Result<Value, ResolveError> {
        match template {
            Value::String(s) => self.resolve(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve_value(value)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a map of named bindings.
    pub fn resolve_bindings(
        &self,
        bindings: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, ResolveError> {
        bindings
            .iter()
            .map(|(name, template)| Ok((name.clone(), self.resolve_value(template)?)))
            .collect()
    }

    /// Resolve a template that must produce a sequence.
    pub fn resolve_sequence(&self, template: &Value) -> Result<Vec<Value>, ResolveError> {
        match self.resolve_value(template)? {
            Value::Array(items) => Ok(items),
            _ => Err(ResolveError::NotIterable(match template {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> FlowContext {
        let mut inputs = HashMap::new();
        inputs.insert("name".to_string(), json!("ada"));
        inputs.insert("limit".to_string(), json!(3));
        let mut ctx = FlowContext::new(inputs);
        ctx.set_step_output(
            "fetch",
            json!({"output": {"items": [{"id": 7}, {"id": 9}], "nested": {"field": true}}}),
        );
        ctx
    }

    #[test]
    fn test_single_reference_keeps_type() {
        let ctx = context();
        let mut scope = Scope::new();
        scope.push("a", json!([1, 2, 3]));
        let resolver = Resolver::new(&ctx, &scope);

        assert_eq!(resolver.resolve("${a}").unwrap(), json!([1, 2, 3]));
        assert_eq!(resolver.resolve("${inputs.limit}").unwrap(), json!(3));
    }

    #[test]
    fn test_interpolation_stringifies() {
        let ctx = context();
        let mut scope = Scope::new();
        scope.push("a", json!([1, 2, 3]));
        let resolver = Resolver::new(&ctx, &scope);

        assert_eq!(resolver.resolve("prefix-${a}").unwrap(), json!("prefix-[1,2,3]"));
        assert_eq!(
            resolver.resolve("hello ${inputs.name}, limit ${inputs.limit}").unwrap(),
            json!("hello ada, limit 3")
        );
    }

    #[test]
    fn test_plain_literal() {
        let ctx = context();
        let scope = Scope::new();
        let resolver = Resolver::new(&ctx, &scope);
        assert_eq!(resolver.resolve("just text").unwrap(), json!("just text"));
    }

    #[test]
    fn test_nested_step_fields() {
        let ctx = context();
        let scope = Scope::new();
        let resolver = Resolver::new(&ctx, &scope);

        assert_eq!(resolver.resolve("${fetch.output.nested.field}").unwrap(), json!(true));
        assert_eq!(resolver.resolve("${fetch.output.items.1.id}").unwrap(), json!(9));
        assert_eq!(resolver.resolve("${fetch.output.items[0].id}").unwrap(), json!(7));
    }

    #[test]
    fn test_missing_scope_and_field() {
        let ctx = context();
        let scope = Scope::new();
        let resolver = Resolver::new(&ctx, &scope);

        let err = resolver.resolve("${nope.value}").unwrap_err();
        assert_eq!(err, ResolveError::UnknownScope("nope".to_string()));
        assert!(err.is_missing());

        let err = resolver.resolve("${fetch.output.absent}").unwrap_err();
        assert!(matches!(err, ResolveError::MissingField { ref field, .. } if field == "absent"));

        let err = resolver.resolve("${inputs.unset}").unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn test_malformed_template() {
        let ctx = context();
        let scope = Scope::new();
        let resolver = Resolver::new(&ctx, &scope);

        assert!(matches!(
            resolver.resolve("${unterminated"),
            Err(ResolveError::InvalidReference(_))
        ));
        assert!(matches!(resolver.resolve("${ }"), Err(ResolveError::InvalidReference(_))));
    }

    #[test]
    fn test_scope_shadowing() {
        let ctx = context();
        let mut scope = Scope::new();
        scope.push("x", json!(1));
        scope.push("x", json!(2));
        assert_eq!(Resolver::new(&ctx, &scope).resolve("${x}").unwrap(), json!(2));
        scope.pop();
        assert_eq!(Resolver::new(&ctx, &scope).resolve("${x}").unwrap(), json!(1));
    }

    #[test]
    fn test_resolve_value_recurses() {
        let ctx = context();
        let scope = Scope::new();
        let resolver = Resolver::new(&ctx, &scope);

        let template = json!({
            "who": "${inputs.name}",
            "ids": ["${fetch.output.items.0.id}", 42],
            "flag": false
        });
        assert_eq!(
            resolver.resolve_value(&template).unwrap(),
            json!({"who": "ada", "ids": [7, 42], "flag": false})
        );
    }

    #[test]
    fn test_resolve_sequence_rejects_scalars() {
        let ctx = context();
        let scope = Scope::new();
        let resolver = Resolver::new(&ctx, &scope);

        assert_eq!(resolver.resolve_sequence(&json!([1, 2])).unwrap().len(), 2);
        assert!(matches!(
            resolver.resolve_sequence(&json!("${inputs.limit}")),
            Err(ResolveError::NotIterable(_))
        ));
    }

    #[test]
    fn test_reference_helpers() {
        assert_eq!(references("a ${x.y} b ${z}"), vec!["x.y", "z"]);
        assert_eq!(reference_scope("fetch.output.items"), "fetch");
        assert_eq!(reference_scope("rows[0]"), "rows");
        assert_eq!(
            value_references(&json!({"a": ["${p.q}"], "b": "${r}"})).len(),
            2
        );
    }

    #[test]
    fn test_context_isolated_per_clone() {
        let mut a = FlowContext::default();
        let b = a.clone();
        a.set_step_output("s", json!(1));
        assert!(a.has_step("s"));
        assert!(!b.has_step("s"));
    }
}
