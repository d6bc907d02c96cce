pub mod alert;
pub mod rule;
pub mod span;
pub mod trace;
