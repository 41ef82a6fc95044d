//! Lua interpreter glue
//!
//! Everything that touches the Lua C API outside of the hook itself:
//! value marshaling, stack helpers and an owned state for hosts.

mod host;
pub mod marshal;
pub(crate) mod stack;

pub use host::LuaHost;
pub use mlua_sys::lua_State;
