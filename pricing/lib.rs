#![deny(dead_code)]
#![deny(unused_imports)]

pub mod artifact;
pub mod attribution;
pub mod data;
pub mod extrapolation;
pub mod metrics;
pub mod narrative;
pub mod pipeline;
pub mod predictor;
pub mod schema;
pub mod settings;
pub mod transform;

#[cfg(test)]
mod test_fixtures;
