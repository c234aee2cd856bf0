//! JSON-with-comments decoding.

use std::path::Path;

use futures_util::future::{self, BoxFuture};

use crate::error::{Error, Result};
use crate::graph::{Compute, Node};
use crate::resource::{Encoding, ResourceRegistry};
use crate::value::Value;

/// Decodes its single text (or UTF-8 bytes) child as JSON.
///
/// `//` line comments and `/* */` block comments outside string literals are
/// ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNode {
    /// Set when this node took the registry reference on its source.
    owns_source: bool,
}

impl JsonNode {
    /// A decode node over `source`. The caller keeps ownership of `source`.
    pub fn over(source: &Node) -> Node {
        Self::build(JsonNode { owns_source: false }, source)
    }

    /// A decode node over the shared text resource at `path`.
    ///
    /// The node holds one registry reference on the resource and gives it
    /// back when it is disposed.
    pub fn file(registry: &ResourceRegistry, path: impl AsRef<Path>) -> Result<Node> {
        let source = registry.acquire(path, Encoding::Text)?;
        Ok(Self::build(JsonNode { owns_source: true }, &source))
    }

    fn build(compute: JsonNode, source: &Node) -> Node {
        let node = Node::new(compute);
        node.add_child(source);
        node
    }

    fn decode(input: &Value) -> Result<Value> {
        let text = match input {
            Value::Text(text) => text.as_str(),
            Value::Bytes(bytes) => {
                std::str::from_utf8(bytes).map_err(|err| Error::derive("[Json]", err))?
            }
            Value::Json(json) => return Ok(Value::Json(json.clone())),
            Value::Null => return Err(Error::derive("[Json]", "no input")),
        };

        serde_json::from_str(&strip_comments(text))
            .map(Value::Json)
            .map_err(|err| Error::derive("[Json]", err))
    }
}

impl Compute for JsonNode {
    fn kind(&self) -> &'static str {
        "Json"
    }

    fn derive<'a>(&'a self, inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        let result = match inputs.first() {
            Some(input) => Self::decode(input),
            None => Err(Error::derive("[Json]", "no source child")),
        };
        Box::pin(future::ready(result))
    }

    fn on_dispose(&self, node: &Node) {
        if self.owns_source {
            for source in node.children() {
                source.dispose();
            }
        }
    }
}

/// Remove comments from JSON text, leaving string literals intact.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
                // Keep tokens on either side apart.
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_line_and_block_comments() {
        let text = "{\n  // the answer\n  \"a\": 1, /* inline */ \"b\": 2\n}";
        let parsed: serde_json::Value = serde_json::from_str(&strip_comments(text)).unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn comment_markers_inside_strings_survive() {
        let text = r#"{"url": "http://example.com/*x*/", "q": "say \"//\""}"#;
        assert_eq!(strip_comments(text), text);
    }

    #[tokio::test]
    async fn decodes_text_child() {
        let source = Node::from_fn(|_| Ok(Value::from(r#"{"a": [1, 2]} // trailing"#)));
        let node = JsonNode::over(&source);
        node.init().await.unwrap();

        assert_eq!(node.name(), "[Json]");
        assert_eq!(node.cached(), Some(Value::Json(json!({"a": [1, 2]}))));
    }

    #[tokio::test]
    async fn malformed_json_is_a_derive_error() {
        let source = Node::from_fn(|_| Ok(Value::from("{\"a\": ")));
        let node = JsonNode::over(&source);

        let err = node.init().await.unwrap_err();
        assert!(matches!(err, Error::Derive { .. }));
        assert!(node.is_dirty());
    }

    #[tokio::test]
    async fn file_node_returns_its_reference_on_dispose() {
        use crate::config::CascadeConfig;
        use crate::watch::{ManualBackend, WatchShim};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"debug": true}"#).unwrap();
        let backend = ManualBackend::new();
        let shim = Arc::new(WatchShim::with_backend(Arc::new(backend.clone())));
        let registry = ResourceRegistry::new(shim, &CascadeConfig::default());

        let json = JsonNode::file(&registry, &path).unwrap();
        let other = registry.acquire(&path, Encoding::Text).unwrap();
        json.init().await.unwrap();
        assert_eq!(registry.ref_count(&path), 2);

        json.dispose();
        assert_eq!(registry.ref_count(&path), 1);
        assert!(!other.is_disposed());
        assert_eq!(backend.active(), 1);

        registry.release(&path);
        assert_eq!(registry.ref_count(&path), 0);
        assert_eq!(backend.active(), 0);
    }

    #[tokio::test]
    async fn over_leaves_source_alone_on_dispose() {
        let source = Node::from_fn(|_| Ok(Value::from("{}")));
        let node = JsonNode::over(&source);
        node.init().await.unwrap();

        node.dispose();
        assert!(!source.is_disposed());
    }
}
