//! Module for handling I/O: the feature table, the sample sheet, draws and results.
use crate::layout::{Layout, LayoutError};
use crate::sampling::{condition_symbols, SampleIndexes, SamplingError};
use crate::AnalysisResults;
use csv::{ReaderBuilder, Writer};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Data alignment error: {0}")]
    Alignment(String),
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),
}

/// The feature table as read from disk.
#[derive(Debug, Clone)]
pub struct InputTable {
    /// Header of the first column.
    pub feature_id_column: String,
    pub feature_ids: Vec<String>,
    pub sample_names: Vec<String>,
    /// Features x samples.
    pub table: Array2<f64>,
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let file = File::open(path)?;
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Loads a tab-separated table with a header row. The first column holds
/// feature ids, every other column is a sample. `.gz` files are decompressed.
pub fn load_table(path: &Path) -> Result<InputTable, IoError> {
    log::info!("Loading feature table: {:?}", path);

    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_maybe_gz(path)?);

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(IoError::Parse(format!(
            "{:?} needs a feature id column and at least one sample column",
            path
        )));
    }
    let feature_id_column = headers[0].to_string();
    let sample_names: Vec<String> = headers.iter().skip(1).map(String::from).collect();
    let num_samples = sample_names.len();

    let mut feature_ids = Vec::new();
    let mut values = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != num_samples + 1 {
            return Err(IoError::Parse(format!(
                "row {} has {} fields, expected {}",
                line + 2,
                record.len(),
                num_samples + 1
            )));
        }
        feature_ids.push(record[0].to_string());
        for (j, field) in record.iter().skip(1).enumerate() {
            let v = field.trim().parse::<f64>().map_err(|_| {
                IoError::Parse(format!(
                    "row {}, sample '{}': '{}' is not a number",
                    line + 2,
                    sample_names[j],
                    field
                ))
            })?;
            if !v.is_finite() {
                return Err(IoError::Parse(format!(
                    "row {}, sample '{}': '{}' is not a finite number",
                    line + 2,
                    sample_names[j],
                    field
                )));
            }
            values.push(v);
        }
    }

    let table = Array2::from_shape_vec((feature_ids.len(), num_samples), values)
        .map_err(|e| IoError::Parse(e.to_string()))?;

    log::info!(
        "Loaded {} features x {} samples",
        table.nrows(),
        table.ncols()
    );
    Ok(InputTable {
        feature_id_column,
        feature_ids,
        sample_names,
        table,
    })
}

/// Reads only the header of a feature table.
pub fn read_sample_names(path: &Path) -> Result<Vec<String>, IoError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(open_maybe_gz(path)?);
    Ok(reader.headers()?.iter().skip(1).map(String::from).collect())
}

/// Assignment of factor values to samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSheet {
    pub factors: Vec<String>,
    pub samples: Vec<String>,
    /// `values[s][f]` is the value of factor `f` for sample `s`.
    pub values: Vec<Vec<String>>,
}

impl SampleSheet {
    pub fn factor_index(&self, factor: &str) -> Option<usize> {
        self.factors.iter().position(|f| f == factor)
    }

    /// Distinct values of a factor, sorted.
    pub fn factor_values(&self, factor: &str) -> Option<Vec<String>> {
        let f = self.factor_index(factor)?;
        let mut vals: Vec<String> = self.values.iter().map(|row| row[f].clone()).collect();
        vals.sort();
        vals.dedup();
        Some(vals)
    }
}

/// Loads a tab-separated sample sheet: a `sample` column followed by one
/// column per factor, one row per sample.
pub fn load_sample_sheet(path: &Path) -> Result<SampleSheet, IoError> {
    log::info!("Loading sample sheet: {:?}", path);

    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .comment(Some(b'#'))
        .from_reader(open_maybe_gz(path)?);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(IoError::Parse(format!("{:?} has no header", path)));
    }
    let factors: Vec<String> = headers.iter().skip(1).map(String::from).collect();

    let mut samples = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() != factors.len() + 1 {
            return Err(IoError::Parse(format!(
                "sample '{}' has {} factor values, expected {}",
                &record[0],
                record.len().saturating_sub(1),
                factors.len()
            )));
        }
        samples.push(record[0].to_string());
        values.push(record.iter().skip(1).map(|v| v.trim().to_string()).collect());
    }

    log::info!(
        "Sample sheet has {} samples and factors {:?}",
        samples.len(),
        factors
    );
    Ok(SampleSheet {
        factors,
        samples,
        values,
    })
}

/// Builds a layout over the table's sample columns: one group per distinct
/// combination of the factors' values, sorted by value, members in column
/// order. Returns the layout and a `factor=value` label per group.
///
/// With no factors every sample in the sheet goes into one group.
pub fn layout_for_factors(
    sheet: &SampleSheet,
    sample_names: &[String],
    factors: &[String],
) -> Result<(Layout, Vec<String>), IoError> {
    let factor_idxs = factors
        .iter()
        .map(|f| {
            sheet.factor_index(f).ok_or_else(|| {
                IoError::Alignment(format!(
                    "Factor '{}' is not in the sample sheet (known factors: {:?})",
                    f, sheet.factors
                ))
            })
        })
        .collect::<Result<Vec<usize>, IoError>>()?;

    let sheet_rows: HashMap<&str, usize> = sheet
        .samples
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    let mut groups: BTreeMap<Vec<String>, Vec<usize>> = BTreeMap::new();
    for (j, name) in sample_names.iter().enumerate() {
        match sheet_rows.get(name.as_str()) {
            Some(&row) => {
                let key: Vec<String> = factor_idxs
                    .iter()
                    .map(|&f| sheet.values[row][f].clone())
                    .collect();
                groups.entry(key).or_default().push(j);
            }
            None => log::debug!("Sample column '{}' is not in the sample sheet", name),
        }
    }

    if groups.is_empty() {
        return Err(IoError::Alignment(
            "None of the table's sample columns appear in the sample sheet".into(),
        ));
    }

    let labels: Vec<String> = groups
        .keys()
        .map(|key| {
            factors
                .iter()
                .zip(key)
                .map(|(f, v)| format!("{}={}", f, v))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect();
    let layout = Layout::new(groups.into_values().collect())?;
    Ok((layout, labels))
}

/// Writes draws as whitespace separated indexes, one draw per line. With a
/// condition layout each line ends with a `#` comment of condition symbols.
pub fn write_sample_indexes<W: Write>(
    writer: &mut W,
    indexes: &SampleIndexes,
    condition_layout: Option<&Layout>,
) -> Result<(), IoError> {
    for row in indexes.view().outer_iter() {
        for x in row.iter() {
            write!(writer, " {:3}", x)?;
        }
        if let Some(layout) = condition_layout {
            write!(writer, " # {}", condition_symbols(layout, row))?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

pub fn save_sample_indexes(path: &Path, indexes: &SampleIndexes) -> Result<(), IoError> {
    log::info!("Saving {} draws to {:?}", indexes.num_draws(), path);
    let mut writer = BufWriter::new(File::create(path)?);
    write_sample_indexes(&mut writer, indexes, None)?;
    writer.flush()?;
    Ok(())
}

/// Reads draws written by [`write_sample_indexes`]. Anything after `#` is
/// ignored, as are blank lines.
pub fn load_sample_indexes(path: &Path, num_samples: usize) -> Result<SampleIndexes, IoError> {
    log::info!("Loading sample indexes from {:?}", path);
    let reader = BufReader::new(open_maybe_gz(path)?);

    let mut values = Vec::new();
    let mut num_draws = 0;
    let mut width: Option<usize> = None;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let content = line.split('#').next().unwrap_or("");
        let row = content
            .split_whitespace()
            .map(|tok| {
                tok.parse::<usize>().map_err(|_| {
                    IoError::Parse(format!("line {}: '{}' is not an index", line_no + 1, tok))
                })
            })
            .collect::<Result<Vec<usize>, IoError>>()?;
        if row.is_empty() {
            continue;
        }
        match width {
            Some(w) if w != row.len() => {
                return Err(IoError::Parse(format!(
                    "line {} has {} indexes, expected {}",
                    line_no + 1,
                    row.len(),
                    w
                )))
            }
            _ => width = Some(row.len()),
        }
        values.extend(row);
        num_draws += 1;
    }

    let draws = Array2::from_shape_vec((num_draws, width.unwrap_or(num_samples)), values)
        .map_err(|e| IoError::Parse(e.to_string()))?;
    Ok(SampleIndexes::new(draws, num_samples)?)
}

/// Reads one feature id per line, skipping blank lines.
pub fn load_feature_ids(path: &Path) -> Result<Vec<String>, IoError> {
    let reader = BufReader::new(open_maybe_gz(path)?);
    let mut ids = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

/// Writes one row per feature: id, best statistic, statistic per tuning
/// param, best score, score per tuning param, condition means and the raw
/// values.
pub fn write_results(
    output_writer: &mut Writer<GzEncoder<impl Write>>,
    input: &InputTable,
    results: &AnalysisResults,
    condition_labels: &[String],
) -> Result<(), IoError> {
    let num_features = input.table.nrows();
    if results.num_features() != num_features {
        return Err(IoError::Alignment(format!(
            "Results cover {} features but the table has {}",
            results.num_features(),
            num_features
        )));
    }

    let mut header = vec![input.feature_id_column.clone(), "best_stat".to_string()];
    header.extend(results.tuning_params.iter().map(|a| format!("stat_{}", a)));
    header.push("best_score".to_string());
    header.extend(results.tuning_params.iter().map(|a| format!("score_{}", a)));
    for g in 0..results.group_means.ncols() {
        let label = condition_labels
            .get(g)
            .cloned()
            .unwrap_or_else(|| format!("group {}", g));
        header.push(format!("mean: {}", label));
    }
    header.extend(input.sample_names.iter().cloned());
    output_writer.write_record(&header)?;

    log::info!("Writing {} results to output file", num_features);
    let best = results.best_param_per_feature();
    for i in 0..num_features {
        let mut row = Vec::with_capacity(header.len());
        row.push(input.feature_ids[i].clone());
        row.push(results.raw_stats[[best[i], i]].to_string());
        row.extend(results.raw_stats.column(i).iter().map(f64::to_string));
        row.push(results.feature_to_score[[best[i], i]].to_string());
        row.extend(results.feature_to_score.column(i).iter().map(f64::to_string));
        row.extend(results.group_means.row(i).iter().map(f64::to_string));
        row.extend(input.table.row(i).iter().map(f64::to_string));
        output_writer.write_record(&row)?;
    }
    output_writer.flush()?;

    log::info!("Results written successfully");
    Ok(())
}

pub fn save_results(path: &Path, results: &AnalysisResults) -> Result<(), IoError> {
    log::info!("Saving results to {:?}", path);
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, results)?;
    writer.flush()?;
    Ok(())
}

pub fn load_results(path: &Path) -> Result<AnalysisResults, IoError> {
    log::info!("Loading results from {:?}", path);
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}
