pub mod gate;
pub mod path;
pub mod search;
