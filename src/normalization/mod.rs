//! Normalization module: size factor estimation

mod size_factors;

pub use size_factors::{
    base_means, estimate_size_factors, normalized_counts, validate_size_factors, SizeFactorMethod,
};
