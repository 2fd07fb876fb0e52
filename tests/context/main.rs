#[path = "../support/mod.rs"]
mod support;

mod faults;
mod knowledge;
