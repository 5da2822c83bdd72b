use serde_json::{Map, Value};

use crate::event::{AttributeRef, Context, SingleContext};

/// Serializes contexts for analytics output, removing private attributes.
///
/// Redacted attribute references are listed under `_meta.redactedAttributes`.
/// `kind`, `key` and `anonymous` are never redacted.
#[derive(Debug, Clone, Default)]
pub struct ContextFormatter {
    all_attributes_private: bool,
    private_attributes: Vec<AttributeRef>,
}

impl ContextFormatter {
    pub fn new(all_attributes_private: bool, private_attributes: Vec<AttributeRef>) -> Self {
        Self {
            all_attributes_private,
            private_attributes,
        }
    }

    /// Formats a context. With `redact_anonymous`, every optional attribute
    /// of an anonymous single context is treated as private.
    pub fn format(&self, context: &Context, redact_anonymous: bool) -> Value {
        if context.is_multi() {
            let mut out = Map::new();
            out.insert("kind".into(), Value::from("multi"));
            for single in context.individual_contexts() {
                out.insert(
                    single.kind().to_string(),
                    Value::Object(self.format_single(single, false, redact_anonymous)),
                );
            }
            return Value::Object(out);
        }
        match context.individual_contexts().first() {
            Some(single) => Value::Object(self.format_single(single, true, redact_anonymous)),
            None => Value::Null,
        }
    }

    fn format_single(&self, ctx: &SingleContext, include_kind: bool, redact_anonymous: bool) -> Map<String, Value> {
        let mut out = Map::new();
        if include_kind {
            out.insert("kind".into(), Value::from(ctx.kind()));
        }
        out.insert("key".into(), Value::from(ctx.key()));
        if ctx.is_anonymous() {
            out.insert("anonymous".into(), Value::Bool(true));
        }

        let redact_all = self.all_attributes_private || (redact_anonymous && ctx.is_anonymous());
        let mut redacted: Vec<String> = Vec::new();

        let optional = ctx
            .display_name()
            .map(|name| ("name".to_string(), Value::from(name)))
            .into_iter()
            .chain(ctx.attributes().iter().map(|(k, v)| (k.clone(), v.clone())));

        for (name, value) in optional {
            if redact_all {
                redacted.push(name);
                continue;
            }
            if let Some(value) = self.redact_attribute(ctx, &name, value, &mut redacted) {
                out.insert(name, value);
            }
        }

        if !redacted.is_empty() {
            let mut meta = Map::new();
            meta.insert(
                "redactedAttributes".into(),
                Value::Array(redacted.into_iter().map(Value::from).collect()),
            );
            out.insert("_meta".into(), Value::Object(meta));
        }
        out
    }

    /// Applies every private reference rooted at `name`. Returns `None` when
    /// the whole attribute is removed.
    fn redact_attribute(
        &self,
        ctx: &SingleContext,
        name: &str,
        mut value: Value,
        redacted: &mut Vec<String>,
    ) -> Option<Value> {
        let refs = self
            .private_attributes
            .iter()
            .chain(ctx.private_attributes())
            .filter(|r| r.is_valid() && r.components()[0] == name);

        for attr in refs {
            let path = &attr.components()[1..];
            if path.is_empty() {
                if !redacted.iter().any(|r| r == attr.as_str()) {
                    redacted.push(attr.as_str().to_string());
                }
                return None;
            }
            if remove_path(&mut value, path) && !redacted.iter().any(|r| r == attr.as_str()) {
                redacted.push(attr.as_str().to_string());
            }
        }
        Some(value)
    }
}

/// Removes a nested object property. Arrays are not traversed.
fn remove_path(value: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = value;
    for component in parents {
        match current.get_mut(component.as_str()) {
            Some(next) if next.is_object() => current = next,
            _ => return false,
        }
    }
    current
        .as_object_mut()
        .map(|obj| obj.remove(last.as_str()).is_some())
        .unwrap_or(false)
}
