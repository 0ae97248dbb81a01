//! Delimited-text reading and writing for counts, sample tables,
//! annotations and results

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim, Writer};
use ndarray::{Array1, Array2};

use super::results::{DeResultTable, RunSummary};
use crate::data::{AnnotationTable, CountMatrix, GeneAnnotation, SampleTable};
use crate::error::{NbLrtError, Result};
use crate::normalization::normalized_counts;

/// Tab if the header line contains one, comma otherwise
fn detect_delimiter(path: &Path) -> Result<u8> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = String::new();
    if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
        return Err(NbLrtError::EmptyData {
            reason: format!("{} is empty", path.display()),
        });
    }
    Ok(if header.contains('\t') { b'\t' } else { b',' })
}

fn open_table(path: &Path) -> Result<(csv::Reader<File>, StringRecord)> {
    let delimiter = detect_delimiter(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    Ok((reader, headers))
}

fn is_missing(field: &str) -> bool {
    field.is_empty() || field.eq_ignore_ascii_case("na")
}

/// Reads a count matrix: first column gene ids, header row sample ids
pub fn read_count_matrix<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    let path = path.as_ref();
    let (mut reader, headers) = open_table(path)?;
    if headers.len() < 2 {
        return Err(NbLrtError::InvalidCountMatrix {
            reason: "header needs a gene id column and at least one sample".to_string(),
        });
    }
    let sample_ids: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let n_samples = sample_ids.len();

    let mut gene_ids = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        let gene_id = record.get(0).unwrap_or_default().to_string();
        for field in record.iter().skip(1) {
            let value = field.parse::<f64>().map_err(|_| NbLrtError::InvalidCountMatrix {
                reason: format!("gene {}: invalid count value '{}'", gene_id, field),
            })?;
            values.push(value);
        }
        gene_ids.push(gene_id);
    }

    if gene_ids.is_empty() {
        return Err(NbLrtError::EmptyData {
            reason: format!("no genes in {}", path.display()),
        });
    }

    let counts = Array2::from_shape_vec((gene_ids.len(), n_samples), values).map_err(|e| {
        NbLrtError::InvalidCountMatrix {
            reason: e.to_string(),
        }
    })?;
    log::info!(
        "Read {} genes x {} samples from {}",
        gene_ids.len(),
        n_samples,
        path.display()
    );
    CountMatrix::new(counts, gene_ids, sample_ids)
}

/// Reads a sample table: first column sample ids, then one column per
/// variable. Only the columns named in `factor_names` are loaded; `levels`
/// may fix the level order (reference first) of any of them.
pub fn read_sample_table<P: AsRef<Path>>(
    path: P,
    factor_names: &[String],
    levels: &BTreeMap<String, Vec<String>>,
) -> Result<SampleTable> {
    let path = path.as_ref();
    let (mut reader, headers) = open_table(path)?;

    let columns: Vec<usize> = factor_names
        .iter()
        .map(|name| {
            headers
                .iter()
                .skip(1)
                .position(|h| h == name)
                .map(|i| i + 1)
                .ok_or_else(|| NbLrtError::InvalidSampleTable {
                    reason: format!("no column named '{}' in {}", name, path.display()),
                })
        })
        .collect::<Result<_>>()?;

    let mut sample_ids = Vec::new();
    let mut values: Vec<Vec<String>> = vec![Vec::new(); factor_names.len()];
    for record in reader.records() {
        let record = record?;
        sample_ids.push(record.get(0).unwrap_or_default().to_string());
        for (k, &col) in columns.iter().enumerate() {
            values[k].push(record.get(col).unwrap_or_default().to_string());
        }
    }

    if sample_ids.is_empty() {
        return Err(NbLrtError::EmptyData {
            reason: format!("no samples in {}", path.display()),
        });
    }

    let mut table = SampleTable::new(sample_ids)?;
    for (name, column) in factor_names.iter().zip(&values) {
        table.add_values(name, column, levels.get(name).map(Vec::as_slice))?;
    }
    Ok(table)
}

/// Reads a gene annotation with a `gene_id` column and optional `symbol`
/// and `entrez_id` columns
pub fn read_annotation<P: AsRef<Path>>(path: P) -> Result<AnnotationTable> {
    let path = path.as_ref();
    let (mut reader, headers) = open_table(path)?;
    let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let id_col = column("gene_id").ok_or_else(|| NbLrtError::InvalidAnnotation {
        reason: format!("{} has no gene_id column", path.display()),
    })?;
    let symbol_col = column("symbol");
    let entrez_col = column("entrez_id");

    let mut table = AnnotationTable::new();
    for record in reader.records() {
        let record = record?;
        let gene_id = record.get(id_col).unwrap_or_default();
        if gene_id.is_empty() {
            continue;
        }
        let symbol = symbol_col
            .and_then(|c| record.get(c))
            .filter(|s| !is_missing(s))
            .map(str::to_string);
        let entrez_id = match entrez_col.and_then(|c| record.get(c)) {
            Some(field) if !is_missing(field) => {
                Some(field.parse::<u64>().map_err(|_| NbLrtError::InvalidAnnotation {
                    reason: format!("gene {}: invalid entrez_id '{}'", gene_id, field),
                })?)
            }
            _ => None,
        };
        table.insert(gene_id, GeneAnnotation { symbol, entrez_id });
    }

    log::info!("Read annotation for {} genes", table.len());
    Ok(table)
}

/// Writes the result rows in table order. Missing symbols and entrez ids
/// are left as empty cells.
pub fn write_results<P: AsRef<Path>>(path: P, table: &DeResultTable) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    for row in table.rows() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes one `gene_id,status,reason` line per input gene
pub fn write_gene_status<P: AsRef<Path>>(path: P, table: &DeResultTable) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["gene_id", "status", "reason"])?;
    for (gene_id, status) in table.statuses() {
        writer.write_record([gene_id.as_str(), status.label(), status.reason().unwrap_or("")])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes counts divided by their sample's size factor
pub fn write_normalized_counts<P: AsRef<Path>>(
    path: P,
    counts: &CountMatrix,
    size_factors: &Array1<f64>,
) -> Result<()> {
    let normalized = normalized_counts(counts, size_factors);
    let mut writer = Writer::from_path(path)?;

    let mut header = vec!["gene_id".to_string()];
    header.extend(counts.sample_ids().iter().cloned());
    writer.write_record(&header)?;

    for (gene_id, row) in counts.gene_ids().iter().zip(normalized.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(gene_id.clone());
        record.extend(row.iter().map(|v| format!("{:.6}", v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the run summary as pretty-printed JSON
pub fn write_summary<P: AsRef<Path>>(path: P, summary: &RunSummary) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
