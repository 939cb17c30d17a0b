pub mod lua_func;
pub mod lua_string;
pub mod lua_table;
pub mod lua_thread;
pub mod lua_upvalue;
pub mod lua_userdata;
#[allow(clippy::module_inception)]
pub mod lua_value;

pub use lua_func::{Chunk, FuncBody, LuaFunction, FF_C, FF_LUA};
pub use lua_string::LuaString;
pub use lua_table::{LuaTable, Node, Slot};
pub use lua_thread::{CoroTimeout, LuaThread};
pub use lua_upvalue::{UpvalState, Upvalue};
pub use lua_userdata::{Cdata, LuaUserdata};
pub use lua_value::{gct, LuaValue};
