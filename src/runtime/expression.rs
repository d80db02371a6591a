/// Embedded Lua for conditions, transforms and code nodes
///
/// Every evaluation gets a fresh sandboxed interpreter: `os`, `io`, `debug`,
/// `package` and the file/chunk loaders are removed, memory is capped and an
/// instruction hook aborts scripts that run past their time budget. The run
/// scope is exposed as globals (`input`, `lastOutput`, `variables`, and every
/// variable whose name is a Lua identifier).
///
/// `mlua::Lua` is not `Send`, so nothing here is async; callers evaluate and
/// drop the interpreter before their next `.await`.
use anyhow::Result;
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde_json::Value;
use std::time::{Duration, Instant};

const MEMORY_LIMIT: usize = 32 * 1024 * 1024;
const DEFAULT_BUDGET: Duration = Duration::from_secs(5);

/// Evaluate an expression (or a chunk ending in `return`) to JSON
pub fn eval_expression(expr: &str, scope: &Value) -> Result<Value> {
    eval_with_budget(expr, scope, DEFAULT_BUDGET)
}

/// Run a script under an explicit time budget
pub fn eval_with_budget(source: &str, scope: &Value, budget: Duration) -> Result<Value> {
    let lua = sandbox(budget)?;
    bind_scope(&lua, scope)?;

    let result = lua
        .load(source)
        .eval::<mlua::Value>()
        .map_err(|e| anyhow::anyhow!("Lua evaluation failed: {}", e))?;

    lua_to_json(result)
}

/// Evaluate a branch/loop/route condition
///
/// JSON booleans are taken as-is; strings are Lua expressions whose result
/// follows Lua truthiness (only `nil` and `false` are false, plus JSON null).
pub fn eval_condition(condition: &Value, scope: &Value) -> Result<bool> {
    match condition {
        Value::Bool(b) => Ok(*b),
        Value::String(expr) if expr.trim().is_empty() => {
            Err(anyhow::anyhow!("Condition expression is empty"))
        }
        Value::String(expr) => Ok(truthy(&eval_expression(expr, scope)?)),
        Value::Null => Err(anyhow::anyhow!("Condition is missing")),
        other => Ok(truthy(other)),
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

fn sandbox(budget: Duration) -> Result<Lua> {
    let lua = Lua::new();
    lua.set_memory_limit(MEMORY_LIMIT)
        .map_err(|e| anyhow::anyhow!("Failed to set Lua memory limit: {}", e))?;

    let started = Instant::now();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if started.elapsed() > budget {
                Err(mlua::Error::runtime("script exceeded its time budget"))
            } else {
                Ok(VmState::Continue)
            }
        },
    )
    .map_err(|e| anyhow::anyhow!("Failed to install Lua time budget: {}", e))?;

    let globals = lua.globals();
    for name in ["os", "io", "debug", "package", "require", "dofile", "loadfile", "load", "collectgarbage"] {
        globals
            .set(name, mlua::Nil)
            .map_err(|e| anyhow::anyhow!("Failed to remove Lua global '{}': {}", name, e))?;
    }

    // Safe time helpers standing in for os.date / os.time
    let date = lua
        .create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))
        .map_err(|e| anyhow::anyhow!("Failed to create date function: {}", e))?;
    let time = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))
        .map_err(|e| anyhow::anyhow!("Failed to create time function: {}", e))?;
    let now = lua
        .create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))
        .map_err(|e| anyhow::anyhow!("Failed to create now function: {}", e))?;
    globals
        .set("date", date)
        .and_then(|_| globals.set("time", time))
        .and_then(|_| globals.set("now", now))
        .map_err(|e| anyhow::anyhow!("Failed to install time helpers: {}", e))?;

    drop(globals);
    Ok(lua)
}

fn bind_scope(lua: &Lua, scope: &Value) -> Result<()> {
    let globals = lua.globals();
    let Value::Object(map) = scope else {
        return Ok(());
    };

    for (name, value) in map {
        if !is_identifier(name) {
            continue;
        }
        let lua_value = lua
            .to_value(value)
            .map_err(|e| anyhow::anyhow!("Failed to expose '{}' to Lua: {}", name, e))?;
        globals
            .set(name.as_str(), lua_value)
            .map_err(|e| anyhow::anyhow!("Failed to expose '{}' to Lua: {}", name, e))?;
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Convert a Lua value back to JSON
///
/// Tables whose keys are exactly `1..=n` become arrays; any other table
/// becomes an object. Functions, userdata and JSON-null sentinels map to null.
fn lua_to_json(lua_value: mlua::Value) -> Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(if f.fract() == 0.0 && f.abs() < 9.0e15 {
            Value::Number(serde_json::Number::from(f as i64))
        } else {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }),
        mlua::Value::String(s) => {
            let s = s
                .to_str()
                .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua string: {}", e))?;
            Ok(Value::String(s.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut max_index = 0usize;
            let mut count = 0usize;
            let mut is_array = true;

            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(count);
                for i in 1..=max_index {
                    let item: mlua::Value = table
                        .get(i)
                        .map_err(|e| anyhow::anyhow!("Failed to read Lua table value: {}", e))?;
                    items.push(lua_to_json(item)?);
                }
                return Ok(Value::Array(items));
            }

            let mut object = serde_json::Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, value) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                let key = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua key: {}", e))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                object.insert(key, lua_to_json(value)?);
            }
            Ok(Value::Object(object))
        }
        _ => Ok(Value::Null),
    }
}
