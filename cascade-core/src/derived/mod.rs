//! Ready-made node kinds that only supply a derivation.

mod json;
mod replacer;

pub use json::{strip_comments, JsonNode};
pub use replacer::{MarkerStrategy, ReplaceStrategy, Replacer};

use futures_util::future::{self, BoxFuture};

use crate::error::Result;
use crate::graph::{Compute, Node};
use crate::value::Value;

/// A leaf holding a fixed value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstNode {
    value: Value,
}

impl ConstNode {
    pub fn of(value: impl Into<Value>) -> Node {
        Node::new(ConstNode {
            value: value.into(),
        })
    }
}

impl Compute for ConstNode {
    fn kind(&self) -> &'static str {
        "Const"
    }

    fn derive<'a>(&'a self, _inputs: &'a [Value]) -> BoxFuture<'a, Result<Value>> {
        Box::pin(future::ready(Ok(self.value.clone())))
    }
}
