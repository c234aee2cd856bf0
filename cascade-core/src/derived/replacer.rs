//! Marker substitution in source text.

use futures_util::future::{self, BoxFuture};
use indexmap::IndexMap;
use regex::{NoExpand, Regex};

use crate::error::{Error, Result};
use crate::graph::{Compute, Node};
use crate::value::Value;

/// How replacement keys become patterns and replacement values become text.
pub trait ReplaceStrategy: Send + Sync + 'static {
    /// The pattern whose every match is replaced by `key`'s value.
    fn pattern(&self, key: &str) -> Result<Regex>;

    /// The text injected for a replacement node's value.
    fn render(&self, value: &Value) -> String {
        value.to_string()
    }
}

/// Matches `/** @replace "Key" */`, tolerating whitespace around the parts.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerStrategy;

impl ReplaceStrategy for MarkerStrategy {
    fn pattern(&self, key: &str) -> Result<Regex> {
        let source = format!(r#"/\*\*\s*@replace\s*"{}"\s*\*/"#, regex::escape(key));
        Regex::new(&source).map_err(|err| Error::Config(err.to_string()))
    }
}

/// Replaces markers in a source text with the values of other nodes.
///
/// The first child is the source; each further child is the replacement for
/// one key, in insertion order.
pub struct Replacer {
    patterns: Vec<Regex>,
    strategy: Box<dyn ReplaceStrategy>,
}

impl Replacer {
    /// A replacer over `source` using the `@replace` marker syntax.
    pub fn over(source: &Node, replacements: IndexMap<String, Node>) -> Result<Node> {
        Self::with_strategy(source, replacements, MarkerStrategy)
    }

    pub fn with_strategy(
        source: &Node,
        replacements: IndexMap<String, Node>,
        strategy: impl ReplaceStrategy,
    ) -> Result<Node> {
        let patterns = replacements
            .keys()
            .map(|key| strategy.pattern(key))
            .collect::<Result<Vec<_>>>()?;

        let node = Node::new(Replacer {
            patterns,
            strategy: Box::new(strategy),
        });
        node.add_child(source);
        for replacement in replacements.values() {
            node.add_child(replacement);
        }
        Ok(node)
    }

    fn replace(&self, inputs: &[Value]) -> Result<Value> {
        let Some((source, values)) = inputs.split_first() else {
            return Err(Error::derive("[Replacer]", "no source child"));
        };

        let mut text = source.to_string();
        for (pattern, value) in self.patterns.iter().zip(values) {
            let rendered = self.strategy.render(value);
            text = pattern.replace_all(&text, NoExpand(&rendered)).into_owned();
        }
        Ok(Value::Text(text))
    }
}

impl Compute for Replacer {
    fn kind(&self) -> &'static str {
        "Replacer"
    }

    fn derive<'a>(&'a self, inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        Box::pin(future::ready(self.replace(inputs)))
    }
}
