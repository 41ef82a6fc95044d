//! Conversion between Lua stack values and [`Value`]
//!
//! Lua → [`Value`] is total: anything without a JSON form is replaced by a
//! fixed marker string. Table keys follow one rule:
//!
//! - string keys are kept as-is;
//! - number keys are stringified (`1`, `2.5`), boolean keys become
//!   `"true"`/`"false"`;
//! - keys that are tables, functions, userdata or threads are dropped.
//!
//! A stringified key never shadows a real string key: in
//! `{[1] = 'a', ["1"] = 'b'}` the entry under `["1"]` is kept and the one
//! under `[1]` is dropped, so object keys stay unique.
//!
//! A table whose keys are exactly `1..=n` (n ≥ 1) becomes an array; every
//! other table, including the empty one, becomes an object.

use mlua_sys as ffi;
use std::collections::HashSet;
use std::ffi::{c_int, c_void};

use super::stack::{push_str, read_string};
use crate::value::Value;

pub const FUNCTION_MARKER: &str = "<function>";
pub const USERDATA_MARKER: &str = "<userdata>";
pub const THREAD_MARKER: &str = "<thread>";
pub const CYCLE_MARKER: &str = "<cycle>";
pub const DEPTH_MARKER: &str = "<table>";

/// Reads the value at `idx` of `state`.
///
/// # Safety
/// `state` must be a valid Lua thread and `idx` an acceptable index.
pub unsafe fn to_value(state: *mut ffi::lua_State, idx: c_int, max_depth: usize) -> Value {
    let mut reader = Reader {
        state,
        max_depth,
        path: Vec::new(),
    };
    reader.read(ffi::lua_absindex(state, idx), 0)
}

/// Pushes `value` onto the stack of `state`.
///
/// # Safety
/// `state` must be a valid Lua thread.
pub unsafe fn push_value(state: *mut ffi::lua_State, value: &Value) {
    ffi::lua_checkstack(state, 3);
    match value {
        Value::Null => ffi::lua_pushnil(state),
        Value::Bool(b) => ffi::lua_pushboolean(state, c_int::from(*b)),
        Value::Number(n) => match exact_integer(*n) {
            Some(i) => ffi::lua_pushinteger(state, i),
            None => ffi::lua_pushnumber(state, *n),
        },
        Value::String(s) => push_str(state, s),
        Value::Array(items) => {
            ffi::lua_createtable(state, items.len().min(c_int::MAX as usize) as c_int, 0);
            for (i, item) in items.iter().enumerate() {
                push_value(state, item);
                ffi::lua_rawseti(state, -2, (i + 1) as ffi::lua_Integer);
            }
        }
        Value::Object(pairs) => {
            ffi::lua_createtable(state, 0, pairs.len().min(c_int::MAX as usize) as c_int);
            for (key, item) in pairs {
                push_str(state, key);
                push_value(state, item);
                ffi::lua_rawset(state, -3);
            }
        }
    }
}

/// Lua integers survive a round trip through [`Value::Number`].
fn exact_integer(n: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if n.fract() == 0.0 && n >= -LIMIT && n < LIMIT {
        Some(n as i64)
    } else {
        None
    }
}

enum Key {
    Index(i64),
    /// Float or boolean key rendered as text.
    Stringified(String),
    Name(String),
}

struct Reader {
    state: *mut ffi::lua_State,
    max_depth: usize,
    /// Tables on the current descent path, for cycle detection.
    path: Vec<*const c_void>,
}

impl Reader {
    unsafe fn read(&mut self, idx: c_int, depth: usize) -> Value {
        let state = self.state;
        match ffi::lua_type(state, idx) {
            ffi::LUA_TBOOLEAN => Value::Bool(ffi::lua_toboolean(state, idx) != 0),
            ffi::LUA_TNUMBER => Value::Number(ffi::lua_tonumberx(state, idx, std::ptr::null_mut())),
            ffi::LUA_TSTRING => Value::String(read_string(state, idx).unwrap_or_default()),
            ffi::LUA_TTABLE => self.read_table(idx, depth),
            ffi::LUA_TFUNCTION => Value::String(FUNCTION_MARKER.to_string()),
            ffi::LUA_TUSERDATA | ffi::LUA_TLIGHTUSERDATA => {
                Value::String(USERDATA_MARKER.to_string())
            }
            ffi::LUA_TTHREAD => Value::String(THREAD_MARKER.to_string()),
            _ => Value::Null,
        }
    }

    unsafe fn read_table(&mut self, idx: c_int, depth: usize) -> Value {
        let state = self.state;
        let identity = ffi::lua_topointer(state, idx);
        if self.path.contains(&identity) {
            return Value::String(CYCLE_MARKER.to_string());
        }
        if depth >= self.max_depth {
            return Value::String(DEPTH_MARKER.to_string());
        }
        if ffi::lua_checkstack(state, 3) == 0 {
            return Value::String(DEPTH_MARKER.to_string());
        }

        self.path.push(identity);
        let mut entries: Vec<(Key, Value)> = Vec::new();
        ffi::lua_pushnil(state);
        while ffi::lua_next(state, idx) != 0 {
            // key at -2, value at -1
            if let Some(key) = self.read_key(-2) {
                let value = self.read(ffi::lua_absindex(state, -1), depth + 1);
                entries.push((key, value));
            }
            ffi::lua_pop(state, 1);
        }
        self.path.pop();

        into_container(entries)
    }

    unsafe fn read_key(&self, idx: c_int) -> Option<Key> {
        let state = self.state;
        match ffi::lua_type(state, idx) {
            ffi::LUA_TSTRING => read_string(state, idx).map(Key::Name),
            ffi::LUA_TNUMBER => {
                let mut is_int: c_int = 0;
                let i = ffi::lua_tointegerx(state, idx, &mut is_int);
                if is_int != 0 {
                    Some(Key::Index(i))
                } else {
                    let f = ffi::lua_tonumberx(state, idx, std::ptr::null_mut());
                    Some(Key::Stringified(f.to_string()))
                }
            }
            ffi::LUA_TBOOLEAN => Some(Key::Stringified(
                (ffi::lua_toboolean(state, idx) != 0).to_string(),
            )),
            _ => None,
        }
    }
}

fn into_container(mut entries: Vec<(Key, Value)>) -> Value {
    let n = entries.len() as i64;
    let is_sequence = n > 0
        && entries
            .iter()
            .all(|(key, _)| matches!(key, Key::Index(i) if (1..=n).contains(i)));

    if is_sequence {
        // keys are distinct, so 1..=n each appear exactly once
        entries.sort_by_key(|(key, _)| match key {
            Key::Index(i) => *i,
            Key::Stringified(_) | Key::Name(_) => 0,
        });
        return Value::Array(entries.into_iter().map(|(_, v)| v).collect());
    }

    let names: HashSet<String> = entries
        .iter()
        .filter_map(|(key, _)| match key {
            Key::Name(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    Value::Object(
        entries
            .into_iter()
            .filter_map(|(key, v)| {
                let name = match key {
                    Key::Name(s) => return Some((s, v)),
                    Key::Index(i) => i.to_string(),
                    Key::Stringified(s) => s,
                };
                (!names.contains(&name)).then_some((name, v))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::LuaHost;

    /// Runs `chunk` (which must return one value) and marshals the result.
    fn eval_to_value(chunk: &str) -> Value {
        let host = LuaHost::new().unwrap();
        let state = host.as_ptr();
        unsafe {
            let top = ffi::lua_gettop(state);
            host.load_string(chunk, "marshal").unwrap();
            assert_eq!(ffi::lua_pcall(state, 0, 1, 0), ffi::LUA_OK);
            let value = to_value(state, -1, 16);
            ffi::lua_settop(state, top);
            value
        }
    }

    #[test]
    fn test_scalars() {
        assert_eq!(eval_to_value("return nil"), Value::Null);
        assert_eq!(eval_to_value("return true"), Value::Bool(true));
        assert_eq!(eval_to_value("return 3"), Value::Number(3.0));
        assert_eq!(eval_to_value("return 2.5"), Value::Number(2.5));
        assert_eq!(eval_to_value("return 'abc'"), Value::from("abc"));
        assert_eq!(eval_to_value("return print"), Value::from(FUNCTION_MARKER));
        assert_eq!(
            eval_to_value("return coroutine.create(function() end)"),
            Value::from(THREAD_MARKER)
        );
    }

    #[test]
    fn test_sequence_becomes_array() {
        assert_eq!(
            eval_to_value("return {10, 'x', false}"),
            Value::Array(vec![Value::Number(10.0), Value::from("x"), Value::Bool(false)])
        );
    }

    #[test]
    fn test_empty_and_holey_tables_become_objects() {
        assert_eq!(eval_to_value("return {}"), Value::Object(vec![]));

        let value = eval_to_value("return {[1] = 'a', [3] = 'c'}");
        let mut pairs = value.as_object().unwrap().to_vec();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            pairs,
            vec![
                ("1".to_string(), Value::from("a")),
                ("3".to_string(), Value::from("c")),
            ]
        );
    }

    #[test]
    fn test_non_string_keys() {
        let value = eval_to_value(
            "return {name = 'n', [2.5] = 'f', [true] = 't', [{}] = 'dropped', [print] = 'dropped'}",
        );
        let mut keys: Vec<_> = value
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["2.5", "name", "true"]);
        assert_eq!(value.get("true"), Some(&Value::from("t")));
    }

    #[test]
    fn test_string_key_wins_over_stringified_key() {
        let value = eval_to_value("return {[1] = 'a', ['1'] = 'b', [true] = 'c', ['true'] = 'd', k = 1}");
        let mut pairs = value.as_object().unwrap().to_vec();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            pairs,
            vec![
                ("1".to_string(), Value::from("b")),
                ("k".to_string(), Value::Number(1.0)),
                ("true".to_string(), Value::from("d")),
            ]
        );
    }

    #[test]
    fn test_cycles_and_depth_terminate() {
        let value = eval_to_value("local t = {name = 'root'}; t.self = t; return t");
        assert_eq!(value.get("self"), Some(&Value::from(CYCLE_MARKER)));

        let host = LuaHost::new().unwrap();
        let state = host.as_ptr();
        unsafe {
            host.load_string("return {a = {b = {c = 1}}}", "depth").unwrap();
            assert_eq!(ffi::lua_pcall(state, 0, 1, 0), ffi::LUA_OK);
            let value = to_value(state, -1, 2);
            ffi::lua_pop(state, 1);
            let b = value.get("a").and_then(|a| a.get("b"));
            assert_eq!(b, Some(&Value::from(DEPTH_MARKER)));
        }
    }

    #[test]
    fn test_push_value_roundtrip_keeps_integers() {
        let host = LuaHost::new().unwrap();
        let state = host.as_ptr();
        unsafe {
            push_value(state, &Value::Number(7.0));
            assert_eq!(ffi::lua_isinteger(state, -1), 1);
            push_value(state, &Value::Number(0.5));
            assert_eq!(ffi::lua_isinteger(state, -1), 0);
            ffi::lua_pop(state, 2);

            let nested = Value::Object(vec![
                ("list".to_string(), Value::Array(vec![Value::from("a"), Value::Null])),
                ("flag".to_string(), Value::Bool(true)),
            ]);
            push_value(state, &nested);
            let back = to_value(state, -1, 16);
            ffi::lua_pop(state, 1);
            // a trailing nil is not stored by Lua
            assert_eq!(back.get("list"), Some(&Value::Array(vec![Value::from("a")])));
            assert_eq!(back.get("flag"), Some(&Value::Bool(true)));
        }
    }
}
