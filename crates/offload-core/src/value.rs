//! Marshalable values exchanged with a worker.
//!
//! A [`Value`] is a JSON-like tree extended with two things JSON cannot
//! carry:
//!
//! - [`Node`]: a shared cell that gives a sub-graph identity, so the same
//!   object can appear several times in one message or contain itself.
//! - [`Callback`]: an async callable. Passing one across a session registers
//!   it as a remote reference; the peer receives a proxy that calls back.
//!
//! Nodes are reference counted, so a cyclic graph is never freed. Build
//! cycles only for values whose lifetime is bounded by the invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CallError, Error, Result};

/// Keyed entries of an object value.
pub type Object = BTreeMap<String, Value>;

/// Outcome of invoking a [`Callback`].
pub type CallResult = std::result::Result<Value, CallError>;

/// A value that can cross the process boundary.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Object),
    /// An identity-carrying node; repeated occurrences stay shared.
    Shared(Node),
    /// A callable; becomes a remote reference on the peer.
    Callback(Callback),
}

impl Value {
    /// Build an object value from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert any serializable type into a value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(serde_json::to_value(value)?.into())
    }

    /// Deserialize this value into a concrete type.
    ///
    /// Fails if the value contains callbacks or cycles.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }

    /// Convert into plain JSON.
    ///
    /// Shared nodes are inlined at every occurrence. Callbacks and cycles have
    /// no JSON form and produce [`Error::Conversion`].
    pub fn to_json(&self) -> Result<serde_json::Value> {
        to_json(self, &mut Vec::new())
    }

    /// Follow shared nodes until a non-shared value is reached.
    pub fn resolve(&self) -> Value {
        let mut current = self.clone();
        let mut visited = Vec::new();
        while let Value::Shared(node) = &current {
            if visited.contains(&node.addr()) {
                return Value::Null;
            }
            visited.push(node.addr());
            current = node.get();
        }
        current
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Shared(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            Value::Callback(callback) => Some(callback),
            _ => None,
        }
    }

    /// Look up a key on an object value (not through shared nodes).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|entries| entries.get(key))
    }
}

fn to_json(value: &Value, in_progress: &mut Vec<usize>) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| to_json(item, in_progress))
                .collect::<Result<_>>()?,
        ),
        Value::Object(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), to_json(v, in_progress)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Shared(node) => {
            if in_progress.contains(&node.addr()) {
                return Err(Error::Conversion(
                    "cyclic value has no JSON representation".to_string(),
                ));
            }
            in_progress.push(node.addr());
            let json = to_json(&node.get(), in_progress);
            in_progress.pop();
            json?
        }
        Value::Callback(_) => {
            return Err(Error::Conversion(
                "callback has no JSON representation".to_string(),
            ));
        }
    })
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Object(
                entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats become `Null`, as in JSON.
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Object> for Value {
    fn from(entries: Object) -> Self {
        Value::Object(entries)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        Value::Shared(node)
    }
}

impl From<Callback> for Value {
    fn from(callback: Callback) -> Self {
        Value::Callback(callback)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Structural equality. Shared nodes compare by content, cycles terminate.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        deep_eq(self, other, &mut Vec::new())
    }
}

fn deep_eq(a: &Value, b: &Value, assumed: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Shared(x), Value::Shared(y)) => {
            let pair = (x.addr(), y.addr());
            if x.ptr_eq(y) || assumed.contains(&pair) {
                return true;
            }
            assumed.push(pair);
            deep_eq(&x.get(), &y.get(), assumed)
        }
        (Value::Shared(x), other) => deep_eq(&x.get(), other, assumed),
        (other, Value::Shared(y)) => deep_eq(other, &y.get(), assumed),
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| deep_eq(x, y, assumed))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|((kx, vx), (ky, vy))| kx == ky && deep_eq(vx, vy, assumed))
        }
        (Value::Callback(x), Value::Callback(y)) => x.ptr_eq(y),
        _ => false,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_debug(self, f, &mut Vec::new())
    }
}

fn write_debug(value: &Value, f: &mut fmt::Formatter<'_>, open: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", n),
        Value::String(s) => write!(f, "{:?}", s),
        Value::Array(items) => {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_debug(item, f, open)?;
            }
            f.write_str("]")
        }
        Value::Object(entries) => {
            f.write_str("{")?;
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{:?}: ", key)?;
                write_debug(item, f, open)?;
            }
            f.write_str("}")
        }
        Value::Shared(node) => {
            if open.contains(&node.addr()) {
                return f.write_str("<cycle>");
            }
            open.push(node.addr());
            f.write_str("&")?;
            let result = write_debug(&node.get(), f, open);
            open.pop();
            result
        }
        Value::Callback(callback) => write!(f, "{:?}", callback),
    }
}

/// Identity-carrying cell for shared and cyclic graphs.
///
/// Clones share the same cell. Equality of the owning [`Value`] is
/// structural; use [`Node::ptr_eq`] to test identity.
#[derive(Clone)]
pub struct Node(Arc<Mutex<Value>>);

impl Node {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(Arc::new(Mutex::new(value.into())))
    }

    /// Snapshot of the current content.
    ///
    /// Nested nodes in the snapshot still point at the original cells.
    pub fn get(&self) -> Value {
        self.lock().clone()
    }

    /// Replace the content; the way to close a cycle.
    pub fn set(&self, value: impl Into<Value>) {
        *self.lock() = value.into();
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used as the identity key while encoding.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Value::Shared(self.clone()), f)
    }
}

type Handler = dyn Fn(Vec<Value>) -> BoxFuture<'static, CallResult> + Send + Sync;

/// An async callable that can be passed as an argument.
///
/// Local closures and proxies for remote references have the same type, so
/// a callback received from a peer can be invoked, stored, or passed on.
#[derive(Clone)]
pub struct Callback {
    handler: Arc<Handler>,
}

impl Callback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// Invoke the callable. The synchronous part of the handler runs before
    /// this returns; the rest runs when the future is polled.
    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        (self.handler)(args)
    }

    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.handler, &other.handler)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<callback>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cyclic(a: i64) -> Value {
        let node = Node::new(Value::Null);
        node.set(Value::object([
            ("a", Value::from(a)),
            ("b", Value::Shared(node.clone())),
        ]));
        Value::Shared(node)
    }

    #[test]
    fn test_json_conversion_roundtrip() {
        let json = serde_json::json!({"a": [1, "2", null, [{}], true], "b": 1.5});
        let value = Value::from(json.clone());
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn test_cyclic_values_compare_and_print() {
        let first = cyclic(1);
        let second = cyclic(1);
        let different = cyclic(2);

        assert_eq!(first, second);
        assert_ne!(first, different);
        assert_eq!(format!("{:?}", first), r#"&{"a": 1, "b": <cycle>}"#);
    }

    #[test]
    fn test_cycles_and_callbacks_have_no_json_form() {
        assert!(matches!(cyclic(1).to_json(), Err(Error::Conversion(_))));

        let callback = Callback::new(|_| async { Ok(Value::Null) });
        let value = Value::from(vec![Value::Callback(callback)]);
        assert!(matches!(value.to_json(), Err(Error::Conversion(_))));
    }

    #[test]
    fn test_shared_is_transparent_for_equality() {
        let node = Node::new(Value::from("x"));
        assert_eq!(Value::Shared(node), Value::from("x"));
    }

    #[test]
    fn test_serde_bridge() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Point {
            x: i64,
            y: i64,
        }

        let value = Value::from_serialize(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(value.get("x").and_then(Value::as_i64), Some(1));
        let point: Point = value.deserialize_into().unwrap();
        assert_eq!(point, Point { x: 1, y: 2 });
    }

    #[test]
    fn test_resolve_follows_nodes() {
        let inner = Node::new(Value::from(7));
        let outer = Node::new(Value::Shared(inner));
        assert_eq!(Value::Shared(outer).resolve().as_i64(), Some(7));

        let selfish = Node::new(Value::Null);
        selfish.set(Value::Shared(selfish.clone()));
        assert!(Value::Shared(selfish).resolve().is_null());
    }
}
