//! Input data structures: counts, sample attributes and gene annotation

mod annotation;
mod count_matrix;
mod sample_table;

pub use annotation::{AnnotationTable, GeneAnnotation};
pub use count_matrix::CountMatrix;
pub use sample_table::{Factor, SampleTable};
