//! Sandboxed module and file access.
//!
//! The stock `package.searchers` list can reach the real filesystem and
//! native libraries; it is replaced with just the preload searcher and a
//! project-resource searcher. `loadfile` and `dofile` are rebound to the
//! same resource loader, and every filename-accepting io entry (`io.open`,
//! `io.lines`, `io.input`) resolves its path through the host's sandbox
//! predicate before delegating to the original.

use std::sync::Arc;

use mlua::{Function, Lua, Table, Variadic};

use crate::error::to_lua_error;
use crate::host::ScriptHost;

pub(crate) fn install(lua: &Lua, host: &Arc<dyn ScriptHost>) -> mlua::Result<()> {
    restrict_searchers(lua, host)?;
    install_file_access(lua, host)?;
    Ok(())
}

/// Map a module name to its project resource path: `a.b` -> `/a/b.lua`.
fn module_resource_path(name: &str) -> String {
    format!("/{}.lua", name.replace('.', "/"))
}

/// Load a project resource as a chunk, if the host can find it.
fn load_resource(
    lua: &Lua,
    host: &Arc<dyn ScriptHost>,
    path: &str,
) -> mlua::Result<Option<Function>> {
    match host.find_resource(path) {
        Some(bytes) => lua
            .load(&bytes[..])
            .set_name(format!("@{path}"))
            .into_function()
            .map(Some),
        None => Ok(None),
    }
}

fn restrict_searchers(lua: &Lua, host: &Arc<dyn ScriptHost>) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let searchers: Table = package.get("searchers")?;
    let preload: Function = searchers.get(1)?;

    let host = host.clone();
    let resource_searcher = lua.create_function(move |lua, name: String| {
        let path = module_resource_path(&name);
        match load_resource(lua, &host, &path)? {
            Some(chunk) => Ok(mlua::Value::Function(chunk)),
            None => Ok(mlua::Value::String(
                lua.create_string(format!("no resource '{path}'"))?,
            )),
        }
    })?;

    let replacement = lua.create_table()?;
    replacement.raw_set(1, preload)?;
    replacement.raw_set(2, resource_searcher)?;
    package.set("searchers", replacement)?;
    Ok(())
}

/// Wrap an io function so a filename in its first argument is resolved
/// through the host predicate before the original sees it. Non-path first
/// arguments (an already-open file, nothing at all) delegate unchanged.
fn guard_path_argument(
    lua: &Lua,
    host: &Arc<dyn ScriptHost>,
    func: Function,
) -> mlua::Result<Function> {
    let resolver = host.clone();
    lua.create_function(move |lua, args: Variadic<mlua::Value>| {
        let mut args: Vec<mlua::Value> = args.into_iter().collect();
        let path = match args.first() {
            Some(mlua::Value::String(s)) => Some(s.to_string_lossy().to_string()),
            // the io library coerces numeric filenames to strings
            Some(mlua::Value::Integer(i)) => Some(i.to_string()),
            Some(mlua::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        if let Some(path) = path {
            let resolved = resolver.resolve_path(&path).map_err(to_lua_error)?;
            args[0] = mlua::Value::String(lua.create_string(resolved.to_string_lossy().as_ref())?);
        }
        func.call::<Variadic<mlua::Value>>(Variadic::from_iter(args))
    })
}

fn install_file_access(lua: &Lua, host: &Arc<dyn ScriptHost>) -> mlua::Result<()> {
    let globals = lua.globals();
    let io: Table = globals.get("io")?;

    // Every io entry that accepts a filename goes through the same choke
    // point; rebinding io.open alone would leave io.lines and io.input
    // opening files through the library's internal path.
    for name in ["open", "lines", "input"] {
        let original: Function = io.get(name)?;
        io.set(name, guard_path_argument(lua, host, original)?)?;
    }

    let loader = host.clone();
    let loadfile = lua.create_function(move |lua, path: String| {
        match load_resource(lua, &loader, &path)? {
            Some(chunk) => Ok((mlua::Value::Function(chunk), mlua::Value::Nil)),
            None => Ok((
                mlua::Value::Nil,
                mlua::Value::String(lua.create_string(format!("cannot open {path}"))?),
            )),
        }
    })?;
    globals.set("loadfile", loadfile.clone())?;

    let dofile = lua.create_function(move |_, path: String| {
        let (chunk, message): (mlua::Value, mlua::Value) = loadfile.call(path)?;
        match chunk {
            mlua::Value::Function(chunk) => chunk.call::<Variadic<mlua::Value>>(()),
            _ => Err(mlua::Error::RuntimeError(match message {
                mlua::Value::String(s) => s.to_string_lossy().to_string(),
                _ => "cannot open file".to_string(),
            })),
        }
    })?;
    globals.set("dofile", dofile)?;
    Ok(())
}
