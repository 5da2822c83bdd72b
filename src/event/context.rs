use std::fmt;

use serde_json::{Map, Value};

/// Context kind used when none is given explicitly.
pub const DEFAULT_KIND: &str = "user";

/// Kind name reserved for multi-kind contexts.
pub const MULTI_KIND: &str = "multi";

/// Reference to a context attribute, either a plain top-level name or a
/// slash-delimited path such as `/address/city`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    raw: String,
    components: Vec<String>,
}

impl AttributeRef {
    /// Parses an attribute reference.
    ///
    /// A leading `/` selects path syntax with `~1` and `~0` escapes for `/`
    /// and `~`. Anything else is treated as a literal top-level name.
    pub fn new(raw: &str) -> Self {
        let components = match raw.strip_prefix('/') {
            Some(path) if !path.is_empty() => path
                .split('/')
                .map(|c| c.replace("~1", "/").replace("~0", "~"))
                .collect(),
            Some(_) => Vec::new(),
            None => vec![raw.to_string()],
        };
        Self {
            raw: raw.to_string(),
            components,
        }
    }

    /// Returns the reference exactly as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path components; empty for an invalid reference.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Returns true if the reference names at least one component and none
    /// of them are empty.
    pub fn is_valid(&self) -> bool {
        !self.components.is_empty() && self.components.iter().all(|c| !c.is_empty())
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for AttributeRef {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// A single-kind context: one entity (user, device, org, ...) that an
/// evaluation or event is attributed to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SingleContext {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: Map<String, Value>,
    private_attributes: Vec<AttributeRef>,
}

impl SingleContext {
    /// Creates a context of the given kind and key.
    pub fn new(kind: &str, key: &str) -> Self {
        Self {
            kind: kind.to_string(),
            key: key.to_string(),
            ..Default::default()
        }
    }

    /// Sets the optional display name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Marks the context as anonymous.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Sets a custom attribute. Reserved names are ignored.
    pub fn set(mut self, attr: &str, value: impl Into<Value>) -> Self {
        if !matches!(attr, "kind" | "key" | "name" | "anonymous" | "_meta") {
            self.attributes.insert(attr.to_string(), value.into());
        }
        self
    }

    /// Marks an attribute as private for this context only.
    pub fn private(mut self, attr: &str) -> Self {
        self.private_attributes.push(AttributeRef::new(attr));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn private_attributes(&self) -> &[AttributeRef] {
        &self.private_attributes
    }

    fn is_valid(&self) -> bool {
        !self.key.is_empty() && is_valid_kind(&self.kind)
    }
}

/// Context attached to an event. Either a single kind or a multi-kind
/// combination of several single contexts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    contexts: Vec<SingleContext>,
}

impl Context {
    /// Creates a single-kind context.
    pub fn new(kind: &str, key: &str) -> Self {
        Self::from(SingleContext::new(kind, key))
    }

    /// Creates a single-kind context of the default `user` kind.
    pub fn user(key: &str) -> Self {
        Self::new(DEFAULT_KIND, key)
    }

    /// Creates a multi-kind context. Kinds are kept sorted so that the
    /// fully-qualified key is stable regardless of input order.
    pub fn multi(contexts: Vec<SingleContext>) -> Self {
        let mut contexts = contexts;
        contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        Self { contexts }
    }

    /// Returns true if no single context was supplied.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Returns true if this is a multi-kind context.
    pub fn is_multi(&self) -> bool {
        self.contexts.len() > 1
    }

    /// Returns the individual single-kind contexts.
    pub fn individual_contexts(&self) -> &[SingleContext] {
        &self.contexts
    }

    /// Returns true if the context can be attributed and serialized.
    pub fn is_valid(&self) -> bool {
        if self.contexts.is_empty() || !self.contexts.iter().all(SingleContext::is_valid) {
            return false;
        }
        // Each kind may only appear once.
        self.contexts
            .windows(2)
            .all(|pair| pair[0].kind != pair[1].kind)
    }

    /// Kind names present in this context, in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.contexts.iter().map(|c| c.kind.as_str())
    }

    /// Returns a string that uniquely identifies this context across kinds,
    /// or `None` if the context is invalid.
    ///
    /// A plain user context is identified by its key alone; any other kind
    /// is prefixed with `kind:` and multi-kind contexts join each part.
    pub fn fully_qualified_key(&self) -> Option<String> {
        if !self.is_valid() {
            return None;
        }
        if let [single] = self.contexts.as_slice() {
            if single.kind == DEFAULT_KIND {
                return Some(single.key.clone());
            }
        }
        let parts: Vec<String> = self
            .contexts
            .iter()
            .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
            .collect();
        Some(parts.join(":"))
    }
}

impl From<SingleContext> for Context {
    fn from(single: SingleContext) -> Self {
        Self {
            contexts: vec![single],
        }
    }
}

fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind != "kind"
        && kind != MULTI_KIND
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_fully_qualified_key_is_plain_key() {
        let ctx = Context::user("abc");
        assert_eq!(ctx.fully_qualified_key().as_deref(), Some("abc"));
    }

    #[test]
    fn test_non_user_kind_is_prefixed() {
        let ctx = Context::new("org", "a:b%c");
        assert_eq!(ctx.fully_qualified_key().as_deref(), Some("org:a%3Ab%25c"));
    }

    #[test]
    fn test_multi_kind_sorted_by_kind() {
        let ctx = Context::multi(vec![
            SingleContext::new("user", "u1"),
            SingleContext::new("device", "d1"),
        ]);
        assert!(ctx.is_multi());
        assert_eq!(ctx.kinds().collect::<Vec<_>>(), vec!["device", "user"]);
        assert_eq!(
            ctx.fully_qualified_key().as_deref(),
            Some("device:d1:user:u1")
        );
    }

    #[test]
    fn test_invalid_contexts() {
        assert!(!Context::default().is_valid());
        assert!(!Context::user("").is_valid());
        assert!(!Context::new("multi", "x").is_valid());
        assert!(!Context::new("bad kind", "x").is_valid());
        let dup = Context::multi(vec![
            SingleContext::new("org", "a"),
            SingleContext::new("org", "b"),
        ]);
        assert!(!dup.is_valid());
        assert!(dup.fully_qualified_key().is_none());
    }

    #[test]
    fn test_reserved_attributes_are_not_overwritten() {
        let single = SingleContext::new("user", "k").set("key", "other").set("plan", "pro");
        assert_eq!(single.key(), "k");
        assert!(!single.attributes().contains_key("key"));
        assert_eq!(single.attributes().get("plan"), Some(&Value::from("pro")));
    }

    #[test]
    fn test_attribute_ref_parsing() {
        let plain = AttributeRef::new("email");
        assert_eq!(plain.components(), &["email".to_string()]);

        let path = AttributeRef::new("/address/city");
        assert_eq!(
            path.components(),
            &["address".to_string(), "city".to_string()]
        );

        let escaped = AttributeRef::new("/a~1b/c~0d");
        assert_eq!(escaped.components(), &["a/b".to_string(), "c~d".to_string()]);

        assert!(!AttributeRef::new("/").is_valid());
        assert!(!AttributeRef::new("/a//b").is_valid());
        assert_eq!(path.to_string(), "/address/city");
    }
}
