mod table;

pub use table::{CompiledRoute, Router};
