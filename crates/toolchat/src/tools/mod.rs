//! Tools that run inside the client process.

mod time;

pub use time::CurrentTimeTool;
