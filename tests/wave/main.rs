#[path = "../support/mod.rs"]
mod support;

mod analyzer;
mod history;
