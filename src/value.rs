//! Host value type and the bidirectional bridge to Lua values.
//!
//! `Value` is the representation host code uses on its side of the
//! boundary. The bridge is total in both directions: anything the host can
//! express becomes a Lua value, and anything a script can produce comes
//! back either as data, as an opaque host object, or as a pass-through
//! wrapper that stays callable through the runtime.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use mlua::{Lua, UserData, Variadic};

use crate::error::to_lua_error;
use crate::suspend::{make_token_fn, RegularFn, SuspendableFn};

// ─────────────────────────────────────────────────────────────────────────────
// Opaque host objects
// ─────────────────────────────────────────────────────────────────────────────

/// Reference to an arbitrary host object carried through the VM as userdata.
///
/// Scripts can hold and pass these around but cannot look inside; crossing
/// back to the host returns the original reference (pointer identity).
#[derive(Clone)]
pub struct OpaqueValue(Arc<dyn Any + Send + Sync>);

impl OpaqueValue {
    /// Wrap a host object.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        OpaqueValue(Arc::new(value))
    }

    /// Wrap an already-shared host object.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        OpaqueValue(value)
    }

    /// Borrow the wrapped object, if it has the expected type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (&*self.0 as &dyn Any).downcast_ref()
    }

    /// Whether two wrappers refer to the same host object.
    pub fn same_object(&self, other: &OpaqueValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl UserData for OpaqueValue {}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpaqueValue(..)")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Table keys
// ─────────────────────────────────────────────────────────────────────────────

/// Scalar key of a host-side mapping converted from a Lua table.
///
/// String keys are the symbolic names of the script world; integer, boolean
/// and float keys are preserved as-is. Non-scalar keys (tables, functions,
/// userdata) cannot cross the boundary and raise a conversion error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(String),
    Bool(bool),
    Float(FloatKey),
}

impl From<i64> for TableKey {
    fn from(key: i64) -> Self {
        TableKey::Int(key)
    }
}

impl From<&str> for TableKey {
    fn from(key: &str) -> Self {
        TableKey::Str(key.to_string())
    }
}

/// Float table key compared and hashed by bit pattern.
#[derive(Debug, Clone, Copy)]
pub struct FloatKey(pub f64);

impl PartialEq for FloatKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatKey {}

impl Hash for FloatKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.to_bits());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host values
// ─────────────────────────────────────────────────────────────────────────────

/// A value on the host side of the bridge.
#[derive(Clone)]
pub enum Value {
    /// Lua nil.
    Nil,
    /// Boolean value.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered sequence; 0-indexed here, 1-indexed in Lua.
    List(Vec<Value>),
    /// Key/value mapping.
    Map(HashMap<TableKey, Value>),
    /// Opaque host object, carried through the VM as userdata.
    Opaque(OpaqueValue),
    /// Host callable wrapped as a non-suspendable Lua function on entry.
    HostFn(RegularFn),
    /// Host callable wrapped as a suspendable Lua function on entry.
    Suspendable(SuspendableFn),
    /// An already-wrapped Lua value, passed through unchanged.
    Script(mlua::Value),
}

impl Value {
    /// Get as boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as sequence.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get as mapping.
    pub fn as_map(&self) -> Option<&HashMap<TableKey, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Convert a JSON value into a host value.
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (TableKey::Str(k), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert a data value to JSON. Returns `None` for values with no JSON
    /// representation (opaque objects, callables, pass-through Lua values).
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Nil => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Int(i) => Some(serde_json::Value::Number((*i).into())),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
            Value::Str(s) => Some(serde_json::Value::String(s.clone())),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (key, value) in entries {
                    let key = match key {
                        TableKey::Int(i) => i.to_string(),
                        TableKey::Str(s) => s.clone(),
                        TableKey::Bool(b) => b.to_string(),
                        TableKey::Float(f) => f.0.to_string(),
                    };
                    object.insert(key, value.to_json()?);
                }
                Some(serde_json::Value::Object(object))
            }
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.same_object(b),
            (Value::HostFn(a), Value::HostFn(b)) => Arc::ptr_eq(a, b),
            (Value::Suspendable(a), Value::Suspendable(b)) => Arc::ptr_eq(a, b),
            (Value::Script(a), Value::Script(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(n) => write!(f, "Float({n})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Value::Opaque(_) => f.write_str("Opaque(..)"),
            Value::HostFn(_) => f.write_str("HostFn(..)"),
            Value::Suspendable(_) => f.write_str("Suspendable(..)"),
            Value::Script(v) => f.debug_tuple("Script").field(v).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host → Lua
// ─────────────────────────────────────────────────────────────────────────────

/// Conversion environment: the VM plus the shim factory that turns
/// suspendable host functions into yielding Lua closures.
pub(crate) struct ConvertCtx<'a> {
    pub lua: &'a Lua,
    pub suspend_factory: &'a mlua::Function,
}

/// Convert a host value into a Lua value. Must run under the VM lock.
pub(crate) fn value_to_lua(cx: &ConvertCtx<'_>, value: Value) -> mlua::Result<mlua::Value> {
    match value {
        Value::Nil => Ok(mlua::Value::Nil),
        Value::Bool(b) => Ok(mlua::Value::Boolean(b)),
        Value::Int(i) => Ok(mlua::Value::Integer(i)),
        Value::Float(f) => Ok(mlua::Value::Number(f)),
        Value::Str(s) => Ok(mlua::Value::String(cx.lua.create_string(&s)?)),
        Value::List(items) => {
            let table = cx.lua.create_table()?;
            for (index, item) in items.into_iter().enumerate() {
                // Nil entries stay holes; raw_set of nil is a no-op.
                table.raw_set(index as i64 + 1, value_to_lua(cx, item)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
        Value::Map(entries) => {
            let table = cx.lua.create_table()?;
            for (key, item) in entries {
                table.raw_set(table_key_to_lua(cx.lua, &key)?, value_to_lua(cx, item)?)?;
            }
            Ok(mlua::Value::Table(table))
        }
        Value::Opaque(opaque) => Ok(mlua::Value::UserData(cx.lua.create_userdata(opaque)?)),
        Value::HostFn(func) => Ok(mlua::Value::Function(wrap_regular(cx, func)?)),
        Value::Suspendable(func) => {
            let make_token = make_token_fn(cx.lua, func)?;
            let wrapped: mlua::Function = cx.suspend_factory.call(make_token)?;
            Ok(mlua::Value::Function(wrapped))
        }
        Value::Script(v) => Ok(v),
    }
}

/// Wrap a regular host function: run it under the current execution
/// context, convert host errors to script errors, convert the result.
fn wrap_regular(cx: &ConvertCtx<'_>, func: RegularFn) -> mlua::Result<mlua::Function> {
    let factory = cx.suspend_factory.clone();
    cx.lua
        .create_function(move |lua, args: Variadic<mlua::Value>| {
            let result = func(args.into_iter().collect()).map_err(to_lua_error)?;
            let cx = ConvertCtx {
                lua,
                suspend_factory: &factory,
            };
            value_to_lua(&cx, result)
        })
}

pub(crate) fn table_key_to_lua(lua: &Lua, key: &TableKey) -> mlua::Result<mlua::Value> {
    Ok(match key {
        TableKey::Int(i) => mlua::Value::Integer(*i),
        TableKey::Str(s) => mlua::Value::String(lua.create_string(s)?),
        TableKey::Bool(b) => mlua::Value::Boolean(*b),
        TableKey::Float(f) => mlua::Value::Number(f.0),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Lua → host
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a Lua value into a host value. Must run under the VM lock: the
/// table walk touches live VM state and may recurse through nested tables,
/// but never back into script code.
pub(crate) fn lua_to_value(value: mlua::Value) -> mlua::Result<Value> {
    match value {
        mlua::Value::Nil => Ok(Value::Nil),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Int(i)),
        mlua::Value::Number(n) => Ok(Value::Float(n)),
        mlua::Value::String(s) => Ok(Value::Str(s.to_string_lossy().to_string())),
        mlua::Value::UserData(ud) => match ud.borrow::<OpaqueValue>() {
            Ok(opaque) => Ok(Value::Opaque((*opaque).clone())),
            // Foreign userdata (file handles etc.) passes through opaque.
            Err(_) => Ok(Value::Script(mlua::Value::UserData(ud))),
        },
        mlua::Value::Table(table) => table_to_value(table),
        // Functions and coroutine threads stay callable only through the
        // runtime that owns them.
        other => Ok(Value::Script(other)),
    }
}

/// Walk a table once. While every key seen is a positive integer the
/// entries accumulate into a sequence (missing indices become nil holes);
/// the first other key demotes the accumulated sequence into a mapping
/// keyed by its 1-based indices, and the walk continues as a mapping.
fn table_to_value(table: mlua::Table) -> mlua::Result<Value> {
    let mut sequence: Option<Vec<Value>> = Some(Vec::new());
    let mut mapping: HashMap<TableKey, Value> = HashMap::new();

    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        let (key, value) = pair?;
        let value = lua_to_value(value)?;
        match (&mut sequence, &key) {
            (Some(items), mlua::Value::Integer(i)) if *i > 0 => {
                let index = *i as usize - 1;
                if items.len() <= index {
                    items.resize(index + 1, Value::Nil);
                }
                items[index] = value;
            }
            _ => {
                if let Some(items) = sequence.take() {
                    for (index, item) in items.into_iter().enumerate() {
                        if !matches!(item, Value::Nil) {
                            mapping.insert(TableKey::Int(index as i64 + 1), item);
                        }
                    }
                }
                mapping.insert(lua_to_table_key(key)?, value);
            }
        }
    }

    match sequence {
        Some(items) if items.is_empty() => Ok(Value::Map(HashMap::new())),
        Some(items) => Ok(Value::List(items)),
        None => Ok(Value::Map(mapping)),
    }
}

fn lua_to_table_key(key: mlua::Value) -> mlua::Result<TableKey> {
    match key {
        mlua::Value::Integer(i) => Ok(TableKey::Int(i)),
        mlua::Value::String(s) => Ok(TableKey::Str(s.to_string_lossy().to_string())),
        mlua::Value::Boolean(b) => Ok(TableKey::Bool(b)),
        mlua::Value::Number(n) => Ok(TableKey::Float(FloatKey(n))),
        other => Err(mlua::Error::RuntimeError(format!(
            "table key of type {} cannot cross the host boundary",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"name": "vav-1", "zones": [1, 2, 3], "active": true, "setpoint": 21.5}"#,
        )
        .unwrap();
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), Some(json));
    }

    #[test]
    fn float_keys_compare_by_bits() {
        let mut map = HashMap::new();
        map.insert(TableKey::Float(FloatKey(1.5)), Value::Int(1));
        assert!(map.contains_key(&TableKey::Float(FloatKey(1.5))));
        assert!(!map.contains_key(&TableKey::Float(FloatKey(2.5))));
    }

    #[test]
    fn opaque_identity_survives_clone() {
        let opaque = OpaqueValue::new(42u32);
        let other = opaque.clone();
        assert!(opaque.same_object(&other));
        assert_eq!(other.downcast_ref::<u32>(), Some(&42));
        assert!(!opaque.same_object(&OpaqueValue::new(42u32)));
    }
}
