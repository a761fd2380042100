use crate::data::{IdMap, LabeledTable, CELL_TYPE_COLUMN, ID_COLUMN, METADATA_COLUMNS, SM_NAME_COLUMN};
use crate::error::EnsembleError;
use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(EnsembleError::configuration(format!(
                        "cannot determine format of gzipped file {:?}",
                        path
                    ))
                    .into())
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            _ => Err(EnsembleError::configuration(format!("unsupported file format {:?}", path)).into()),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Csv | FileFormat::GzippedCsv => b',',
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// Prediction file contents: one row per id, one column per gene
#[derive(Debug, Clone)]
pub struct PredictionTable {
    pub ids: Vec<String>,
    pub genes: Vec<String>,
    pub values: Array2<f32>,
}

impl PredictionTable {
    /// Reorder columns to `genes`; every requested gene must be present
    pub fn select_genes(&self, genes: &[String]) -> Result<Array2<f32>> {
        let positions = genes
            .iter()
            .map(|g| {
                self.genes.iter().position(|h| h == g).ok_or_else(|| {
                    EnsembleError::configuration(format!("prediction has no column for gene '{}'", g))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.values.select(ndarray::Axis(1), &positions))
    }
}

fn open<P: AsRef<Path>>(path: P) -> Result<(Box<dyn Read>, FileFormat)> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path)?;
    debug!("Detected file format: {:?}", format);
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader: Box<dyn Read> = if format.is_gzipped() {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok((reader, format))
}

fn column(headers: &StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| EnsembleError::configuration(format!("missing required column '{}'", name)).into())
}

fn parse_value(field: &str, line: usize, column: &str) -> Result<f32> {
    field.trim().parse::<f32>().map_err(|_| {
        EnsembleError::configuration(format!(
            "non-numeric value '{}' in column '{}' at line {}",
            field, column, line
        ))
        .into()
    })
}

/// Load the labelled differential-expression table
///
/// `cell_type` and `sm_name` identify a row; metadata columns are skipped and
/// every remaining column is a gene.
pub fn load_labeled_table<P: AsRef<Path>>(path: P) -> Result<LabeledTable> {
    let path = path.as_ref();
    info!("Loading labelled table from {:?}", path);
    let (reader, format) = open(path)?;
    let table = parse_labeled_table(reader, format)
        .with_context(|| format!("Failed to parse labelled table {:?}", path))?;
    info!("Loaded {} samples x {} genes", table.n_samples(), table.n_genes());
    Ok(table)
}

pub(crate) fn parse_labeled_table<R: Read>(reader: R, format: FileFormat) -> Result<LabeledTable> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();

    let cell_col = column(&headers, CELL_TYPE_COLUMN)?;
    let sm_col = column(&headers, SM_NAME_COLUMN)?;
    let gene_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, h)| {
            *i != cell_col && *i != sm_col && !h.is_empty() && !METADATA_COLUMNS.contains(h)
        })
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    if gene_cols.is_empty() {
        return Err(EnsembleError::configuration("labelled table has no gene columns").into());
    }
    debug!("{} gene columns", gene_cols.len());

    let mut cell_types = Vec::new();
    let mut sm_names = Vec::new();
    let mut values = Vec::new();
    for (row, result) in csv_reader.records().enumerate() {
        let record = result.context("Failed to parse CSV record")?;
        let line = row + 2;
        cell_types.push(record.get(cell_col).unwrap_or_default().to_string());
        sm_names.push(record.get(sm_col).unwrap_or_default().to_string());
        for (i, gene) in &gene_cols {
            values.push(parse_value(record.get(*i).unwrap_or_default(), line, gene)?);
        }
    }

    let genes: Vec<String> = gene_cols.into_iter().map(|(_, g)| g).collect();
    let values = Array2::from_shape_vec((cell_types.len(), genes.len()), values)
        .context("Ragged labelled table")?;
    LabeledTable::new(cell_types, sm_names, genes, values)
}

/// Load the ordered identifiers of the unseen samples
pub fn load_id_map<P: AsRef<Path>>(path: P) -> Result<IdMap> {
    let path = path.as_ref();
    info!("Loading id map from {:?}", path);
    let (reader, format) = open(path)?;
    let id_map =
        parse_id_map(reader, format).with_context(|| format!("Failed to parse id map {:?}", path))?;
    info!("Loaded {} unseen samples", id_map.len());
    Ok(id_map)
}

pub(crate) fn parse_id_map<R: Read>(reader: R, format: FileFormat) -> Result<IdMap> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let id_col = column(&headers, ID_COLUMN)?;
    let cell_col = column(&headers, CELL_TYPE_COLUMN)?;
    let sm_col = column(&headers, SM_NAME_COLUMN)?;

    let mut ids = Vec::new();
    let mut cell_types = Vec::new();
    let mut sm_names = Vec::new();
    for result in csv_reader.records() {
        let record = result.context("Failed to parse CSV record")?;
        ids.push(record.get(id_col).unwrap_or_default().to_string());
        cell_types.push(record.get(cell_col).unwrap_or_default().to_string());
        sm_names.push(record.get(sm_col).unwrap_or_default().to_string());
    }
    IdMap::new(ids, cell_types, sm_names)
}

/// Load a prediction file written by [`write_prediction`]
pub fn load_prediction<P: AsRef<Path>>(path: P) -> Result<PredictionTable> {
    let path = path.as_ref();
    let (reader, format) = open(path)?;
    parse_prediction(reader, format).with_context(|| format!("Failed to parse prediction {:?}", path))
}

pub(crate) fn parse_prediction<R: Read>(reader: R, format: FileFormat) -> Result<PredictionTable> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let id_col = column(&headers, ID_COLUMN)?;
    let gene_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != id_col)
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut ids = Vec::new();
    let mut values = Vec::new();
    for (row, result) in csv_reader.records().enumerate() {
        let record = result.context("Failed to parse CSV record")?;
        ids.push(record.get(id_col).unwrap_or_default().to_string());
        for (i, gene) in &gene_cols {
            values.push(parse_value(record.get(*i).unwrap_or_default(), row + 2, gene)?);
        }
    }

    let genes: Vec<String> = gene_cols.into_iter().map(|(_, g)| g).collect();
    let values =
        Array2::from_shape_vec((ids.len(), genes.len()), values).context("Ragged prediction file")?;
    Ok(PredictionTable { ids, genes, values })
}

/// Write a prediction matrix with an `id` column followed by one column per gene
pub fn write_prediction<P: AsRef<Path>>(
    path: P,
    ids: &[String],
    genes: &[String],
    values: &Array2<f32>,
) -> Result<()> {
    let path = path.as_ref();
    if values.dim() != (ids.len(), genes.len()) {
        return Err(EnsembleError::configuration(format!(
            "prediction is {:?} but there are {} ids and {} genes",
            values.dim(),
            ids.len(),
            genes.len()
        ))
        .into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        crate::utils::ensure_dir(parent)?;
    }

    let format = FileFormat::from_path(path)?;
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    if format.is_gzipped() {
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let encoder = write_records(encoder, format, ids, genes, values)?;
        encoder.finish().context("Failed to finish gzip stream")?.flush()?;
    } else {
        write_records(BufWriter::new(file), format, ids, genes, values)?.flush()?;
    }

    info!("Wrote {} x {} prediction to {:?}", ids.len(), genes.len(), path);
    Ok(())
}

fn write_records<W: Write>(
    sink: W,
    format: FileFormat,
    ids: &[String],
    genes: &[String],
    values: &Array2<f32>,
) -> Result<W> {
    let mut writer = WriterBuilder::new().delimiter(format.delimiter()).from_writer(sink);

    let mut header = Vec::with_capacity(genes.len() + 1);
    header.push(ID_COLUMN.to_string());
    header.extend(genes.iter().cloned());
    writer.write_record(&header)?;

    for (id, row) in ids.iter().zip(values.rows()) {
        let mut record = Vec::with_capacity(genes.len() + 1);
        record.push(id.clone());
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush prediction: {}", e.error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Cursor;

    #[test]
    fn test_file_format_detection() {
        assert_eq!(FileFormat::from_path("data.csv").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_path("data.tsv").unwrap(), FileFormat::Tsv);
        assert_eq!(FileFormat::from_path("data.csv.gz").unwrap(), FileFormat::GzippedCsv);
        assert_eq!(FileFormat::from_path("data.tsv.gz").unwrap(), FileFormat::GzippedTsv);
        assert!(FileFormat::from_path("data.parquet").is_err());
    }

    #[test]
    fn test_parse_labeled_table_skips_metadata() {
        let csv_data = "cell_type,sm_name,sm_lincs_id,SMILES,control,A1BG,ZZZ3\n\
                        NK cells,Belinostat,LSM-1,CCO,False,0.5,-1.25\n\
                        T cells,Dabrafenib,LSM-2,CCN,True,2,0\n";
        let table = parse_labeled_table(Cursor::new(csv_data), FileFormat::Csv).unwrap();

        assert_eq!(table.genes, vec!["A1BG".to_string(), "ZZZ3".to_string()]);
        assert_eq!(table.cell_types[1], "T cells");
        assert_eq!(table.sm_names[0], "Belinostat");
        assert_eq!(table.values, array![[0.5f32, -1.25], [2.0, 0.0]]);
    }

    #[test]
    fn test_parse_labeled_table_rejects_text_in_gene_column() {
        let csv_data = "cell_type,sm_name,G1\nNK,a,high\n";
        let err = parse_labeled_table(Cursor::new(csv_data), FileFormat::Csv).unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn test_parse_id_map_tsv() {
        let tsv_data = "id\tcell_type\tsm_name\n0\tB cells\tIdelalisib\n1\tMyeloid cells\tCrizotinib\n";
        let id_map = parse_id_map(Cursor::new(tsv_data), FileFormat::Tsv).unwrap();
        assert_eq!(id_map.len(), 2);
        assert_eq!(id_map.ids, vec!["0".to_string(), "1".to_string()]);
        assert_eq!(id_map.cell_types[1], "Myeloid cells");
    }

    #[test]
    fn test_parse_id_map_missing_column() {
        let csv_data = "id,cell_type\n0,B cells\n";
        assert!(parse_id_map(Cursor::new(csv_data), FileFormat::Csv).is_err());
    }

    #[test]
    fn test_prediction_write_then_load_gzipped() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join("prediction.csv.gz");
        let ids = vec!["0".to_string(), "1".to_string()];
        let genes = vec!["G1".to_string(), "G2".to_string(), "G3".to_string()];
        let values = array![[1.5f32, -2.0, 0.0], [0.25, 3.0, -0.125]];

        write_prediction(&path, &ids, &genes, &values).unwrap();
        let loaded = load_prediction(&path).unwrap();

        assert_eq!(loaded.ids, ids);
        assert_eq!(loaded.genes, genes);
        assert_eq!(loaded.values, values);

        let reordered = loaded.select_genes(&["G3".to_string(), "G1".to_string()]).unwrap();
        assert_eq!(reordered, array![[0.0f32, 1.5], [-0.125, 0.25]]);
        assert!(loaded.select_genes(&["G9".to_string()]).is_err());
    }

    #[test]
    fn test_write_prediction_shape_mismatch() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("prediction.csv");
        let values = Array2::<f32>::zeros((2, 2));
        let err = write_prediction(&path, &["0".to_string()], &["G1".to_string(), "G2".to_string()], &values)
            .unwrap_err();
        assert!(err.downcast_ref::<EnsembleError>().is_some());
    }
}
