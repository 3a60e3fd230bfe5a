//! Encoding of value graphs into wire form.
//!
//! Shared nodes are tracked in an arena keyed by node identity. The first
//! encounter emits `shared {id, value}`, every later one a `ref(id)`, so
//! cycles terminate and sharing survives. Decoding rebuilds the arena by id
//! and closes cycles as it goes. Callables become `callback(id)` placeholders
//! through a registration hook supplied by the session.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{Callback, Node, Value};

/// Wire form of a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoded {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Encoded>),
    Object(BTreeMap<String, Encoded>),
    /// First occurrence of a shared node.
    Shared { id: u32, value: Box<Encoded> },
    /// Back-reference to a node introduced earlier in the same message.
    Ref(u32),
    /// Remote reference to a callable registered by the sender.
    Callback(u64),
}

/// Deepest nesting of arrays, objects and shared nodes a value may have on
/// the wire. Each level costs two levels of JSON.
pub const MAX_DEPTH: usize = 256;

/// Encodes values for one message. Node ids are scoped to the encoder.
pub(crate) struct Encoder<'a> {
    nodes: FxHashMap<usize, u32>,
    register: &'a mut dyn FnMut(&Callback) -> u64,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(register: &'a mut dyn FnMut(&Callback) -> u64) -> Self {
        Self {
            nodes: FxHashMap::default(),
            register,
        }
    }

    /// Fails with [`Error::Serialization`] when `value` nests deeper than
    /// [`MAX_DEPTH`].
    pub(crate) fn encode(&mut self, value: &Value) -> Result<Encoded> {
        self.encode_at(value, 0)
    }

    fn encode_at(&mut self, value: &Value, depth: usize) -> Result<Encoded> {
        if depth > MAX_DEPTH {
            return Err(Error::Serialization(format!(
                "value nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(match value {
            Value::Null => Encoded::Null,
            Value::Bool(b) => Encoded::Bool(*b),
            Value::Number(n) => Encoded::Number(n.clone()),
            Value::String(s) => Encoded::String(s.clone()),
            Value::Array(items) => Encoded::Array(
                items
                    .iter()
                    .map(|v| self.encode_at(v, depth + 1))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(entries) => Encoded::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.encode_at(v, depth + 1)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Shared(node) => {
                if let Some(&id) = self.nodes.get(&node.addr()) {
                    return Ok(Encoded::Ref(id));
                }
                let id = self.nodes.len() as u32;
                self.nodes.insert(node.addr(), id);
                Encoded::Shared {
                    id,
                    value: Box::new(self.encode_at(&node.get(), depth + 1)?),
                }
            }
            Value::Callback(callback) => Encoded::Callback((self.register)(callback)),
        })
    }
}

/// Decodes values of one message, sharing the node arena across them.
pub(crate) struct Decoder<'a> {
    nodes: FxHashMap<u32, Node>,
    proxy: &'a dyn Fn(u64) -> Callback,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(proxy: &'a dyn Fn(u64) -> Callback) -> Self {
        Self {
            nodes: FxHashMap::default(),
            proxy,
        }
    }

    pub(crate) fn decode(&mut self, encoded: Encoded) -> Result<Value> {
        Ok(match encoded {
            Encoded::Null => Value::Null,
            Encoded::Bool(b) => Value::Bool(b),
            Encoded::Number(n) => Value::Number(n),
            Encoded::String(s) => Value::String(s),
            Encoded::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.decode(item))
                    .collect::<Result<_>>()?,
            ),
            Encoded::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.decode(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Encoded::Shared { id, value } => {
                if self.nodes.contains_key(&id) {
                    return Err(Error::Decode(format!("node {} introduced twice", id)));
                }
                let node = Node::new(Value::Null);
                self.nodes.insert(id, node.clone());
                node.set(self.decode(*value)?);
                Value::Shared(node)
            }
            Encoded::Ref(id) => match self.nodes.get(&id) {
                Some(node) => Value::Shared(node.clone()),
                None => return Err(Error::Decode(format!("reference to unknown node {}", id))),
            },
            Encoded::Callback(reference) => Value::Callback((self.proxy)(reference)),
        })
    }
}
