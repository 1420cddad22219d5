pub mod defs;
#[macro_use]
pub mod util;
