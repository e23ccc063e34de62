// tests/property/main.rs

mod aggregation;
mod processing;
