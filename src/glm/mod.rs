//! Generalized Linear Model fitting for negative binomial data

mod design;
mod fitting;
mod negative_binomial;

pub use design::{
    build_model_matrix, check_full_rank, contrast_name, DesignFormula, DesignPair, ModelMatrix,
    INTERCEPT,
};
pub use fitting::{fit_gene, fit_genes, irls_fitted_mu, FitMethod, GeneFit, GlmFitParams};
pub use negative_binomial::{
    nb_log_likelihood, nb_mean, nb_total_log_likelihood, nb_variance, nb_weight, MAX_LFC_BETA,
    MIN_MU,
};
