//! Reading inputs and writing results

mod csv;
mod results;

pub use self::csv::{
    read_annotation, read_count_matrix, read_sample_table, write_gene_status, write_normalized_counts,
    write_results, write_summary,
};
pub use results::{DeResultRow, DeResultTable, GeneStatus, NonConvergence, RunSummary};
