//! The three CSV tables: image status, ROI metadata and results.
//!
//! Status and ROI tables are read leniently (columns located by header
//! name, short rows tolerated, rows without a filename skipped) and
//! always rewritten whole. The results table is append-only.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{ImageStatus, RoiStatus, normalize_bregma};

/// Columns of the image status table.
pub const STATUS_HEADER: &[&str] = &["filename", "status"];
/// Columns of the ROI metadata table.
pub const ROI_HEADER: &[&str] = &["filename", "roi_name", "bregma", "status"];
/// Columns of the results table.
pub const RESULTS_HEADER: &[&str] = &[
    "filename",
    "roi_name",
    "roi_area",
    "bregma_value",
    "cell_count",
    "total_cell_area",
];

/// One row of the image status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    /// Image filename.
    pub filename: String,
    /// Image status.
    pub status: ImageStatus,
}

/// One row of the ROI metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiRow {
    /// Image filename.
    pub filename: String,
    /// ROI name; empty when the row only registers the image.
    pub roi_name: String,
    /// Bregma value.
    pub bregma: String,
    /// ROI status.
    pub status: RoiStatus,
}

/// One quantified ROI, as stored in the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Image filename.
    pub filename: String,
    /// ROI name.
    pub roi_name: String,
    /// Area of the ROI itself.
    pub roi_area: f64,
    /// Bregma value copied from the ROI record.
    pub bregma_value: String,
    /// Number of objects found.
    pub cell_count: u64,
    /// Summed object area.
    pub total_cell_area: f64,
}

fn csv_error(path: &Path, source: csv::Error) -> StoreError {
    StoreError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Column lookup by header name.
struct Columns(Vec<Option<usize>>);

impl Columns {
    fn locate(headers: &csv::StringRecord, wanted: &[&str]) -> Self {
        Self(
            wanted
                .iter()
                .map(|name| headers.iter().position(|h| h.trim() == *name))
                .collect(),
        )
    }

    fn get<'r>(&self, record: &'r csv::StringRecord, column: usize) -> &'r str {
        self.0
            .get(column)
            .copied()
            .flatten()
            .and_then(|i| record.get(i))
            .unwrap_or_default()
    }
}

/// Read every record of a table. A missing file reads as empty.
fn read_records(path: &Path, header: &[&str]) -> Result<Vec<Vec<String>>, StoreError> {
    if !path.exists() {
        log::debug!("{} does not exist; treating as empty", path.display());
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;
    let headers = reader.headers().map_err(|e| csv_error(path, e))?.clone();
    let columns = Columns::locate(&headers, header);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| csv_error(path, e))?;
        let row: Vec<String> = (0..header.len())
            .map(|c| columns.get(&record, c).to_owned())
            .collect();
        if row.first().is_none_or(String::is_empty) {
            log::debug!("{}: skipping row without filename", path.display());
            continue;
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Read the image status table.
///
/// # Errors
///
/// Returns [`StoreError::Csv`] if the file exists but cannot be parsed.
pub fn read_status_table(path: &Path) -> Result<Vec<StatusRow>, StoreError> {
    Ok(read_records(path, STATUS_HEADER)?
        .into_iter()
        .map(|row| {
            let [filename, status] = <[String; 2]>::try_from(row).unwrap_or_default();
            let status = status.parse().unwrap_or_else(|_| {
                log::warn!("{filename}: unknown image status {status:?}; using New");
                ImageStatus::New
            });
            StatusRow { filename, status }
        })
        .collect())
}

/// Read the ROI metadata table.
///
/// Missing bregma values read as `"N/A"`; unknown statuses read as
/// [`RoiStatus::Pending`].
///
/// # Errors
///
/// Returns [`StoreError::Csv`] if the file exists but cannot be parsed.
pub fn read_roi_table(path: &Path) -> Result<Vec<RoiRow>, StoreError> {
    Ok(read_records(path, ROI_HEADER)?
        .into_iter()
        .map(|row| {
            let [filename, roi_name, bregma, status] =
                <[String; 4]>::try_from(row).unwrap_or_default();
            let status = if status.is_empty() {
                RoiStatus::Pending
            } else {
                status.parse().unwrap_or_else(|_| {
                    log::warn!("{filename}/{roi_name}: unknown ROI status {status:?}; using Pending");
                    RoiStatus::Pending
                })
            };
            RoiRow {
                filename,
                roi_name,
                bregma: normalize_bregma(bregma),
                status,
            }
        })
        .collect())
}

/// Replace a table with `header` and `rows`.
///
/// The table is written to a sibling `.partial` file first and renamed
/// over the original, so a failed write leaves the old table intact.
fn write_table<I, R>(path: &Path, header: &[&str], rows: I) -> Result<(), StoreError>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    let partial = partial_path(path);
    let result = write_partial(&partial, header, rows)
        .and_then(|()| fs::rename(&partial, path).map_err(|e| io_error(path, e)));
    if result.is_err() && partial.exists() {
        if let Err(e) = fs::remove_file(&partial) {
            log::warn!("cannot remove {}: {e}", partial.display());
        }
    }
    result
}

fn write_partial<I, R>(partial: &Path, header: &[&str], rows: I) -> Result<(), StoreError>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    let mut writer = csv::Writer::from_path(partial).map_err(|e| csv_error(partial, e))?;
    writer
        .write_record(header)
        .map_err(|e| csv_error(partial, e))?;
    for row in rows {
        writer.write_record(row).map_err(|e| csv_error(partial, e))?;
    }
    writer.flush().map_err(|e| io_error(partial, e))
}

/// `path` with `.partial` appended to its file name.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Overwrite the image status table.
///
/// # Errors
///
/// Returns [`StoreError`] if the table cannot be written.
pub fn write_status_table(path: &Path, rows: &[StatusRow]) -> Result<(), StoreError> {
    write_table(
        path,
        STATUS_HEADER,
        rows.iter().map(|r| [r.filename.as_str(), r.status.as_str()]),
    )
}

/// Overwrite the ROI metadata table.
///
/// # Errors
///
/// Returns [`StoreError`] if the table cannot be written.
pub fn write_roi_table(path: &Path, rows: &[RoiRow]) -> Result<(), StoreError> {
    write_table(
        path,
        ROI_HEADER,
        rows.iter().map(|r| {
            [
                r.filename.as_str(),
                r.roi_name.as_str(),
                r.bregma.as_str(),
                r.status.as_str(),
            ]
        }),
    )
}

/// Append records to the results table in one write.
///
/// The header is written only when the file is new or empty. Appending
/// nothing leaves the file untouched.
///
/// # Errors
///
/// Returns [`StoreError`] if the table cannot be opened or written.
pub fn append_results(path: &Path, records: &[ResultRecord]) -> Result<(), StoreError> {
    if records.is_empty() {
        return Ok(());
    }
    let needs_header = fs::metadata(path).map_or(true, |m| m.len() == 0);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    for record in records {
        writer.serialize(record).map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| io_error(path, e))?;
    log::info!("appended {} result(s) to {}", records.len(), path.display());
    Ok(())
}

/// Read every record of the results table. A missing file reads as
/// empty.
///
/// # Errors
///
/// Returns [`StoreError::Csv`] if a row cannot be parsed.
pub fn read_results(path: &Path) -> Result<Vec<ResultRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    csv::Reader::from_reader(file)
        .deserialize()
        .collect::<Result<Vec<ResultRecord>, _>>()
        .map_err(|e| csv_error(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::UNKNOWN_BREGMA;

    fn result(name: &str, cells: u64) -> ResultRecord {
        ResultRecord {
            filename: "1_a.tif".to_owned(),
            roi_name: name.to_owned(),
            roi_area: 100.0,
            bregma_value: "-1.2".to_owned(),
            cell_count: cells,
            total_cell_area: 12.5,
        }
    }

    #[test]
    fn lenient_roi_reader_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rois.csv");
        fs::write(
            &path,
            "status,roi_name,filename\n\
             Defined,cortex,1_a.tif\n\
             ,,\n\
             Weird,hippo,1_a.tif\n\
             Pending,striatum\n",
        )
        .unwrap();
        let rows = read_roi_table(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].roi_name, "cortex");
        assert_eq!(rows[0].bregma, UNKNOWN_BREGMA);
        assert_eq!(rows[0].status, RoiStatus::Defined);
        assert_eq!(rows[1].status, RoiStatus::Pending);
    }

    #[test]
    fn roi_fields_read_back_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rois.csv");
        let rows = vec![RoiRow {
            filename: "1_a.tif".to_owned(),
            roi_name: "cortex".to_owned(),
            bregma: " -1.2 ".to_owned(),
            status: RoiStatus::Modified,
        }];
        write_roi_table(&path, &rows).unwrap();
        assert_eq!(read_roi_table(&path).unwrap(), rows);
    }

    #[test]
    fn missing_table_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_status_table(&dir.path().join("none.csv")).unwrap().is_empty());
        assert!(read_results(&dir.path().join("none.csv")).unwrap().is_empty());
    }

    #[test]
    fn status_table_rewrites_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.csv");
        fs::write(&path, "filename,status\nold.tif,New\n").unwrap();
        let rows = vec![StatusRow {
            filename: "a, b.tif".to_owned(),
            status: ImageStatus::Finalized,
        }];
        write_status_table(&path, &rows).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("filename,status"));
        assert!(text.contains("\"a, b.tif\",Finalized"));
        assert!(!text.contains("old.tif"));
        let back = read_status_table(&path).unwrap();
        assert_eq!(back, rows);
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        append_results(&path, &[result("cortex", 3)]).unwrap();
        append_results(&path, &[result("hippo", 0), result("striatum", 7)]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("filename,roi_name").count(), 1);
        let back = read_results(&path).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[2].cell_count, 7);
    }

    #[test]
    fn append_to_headered_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        fs::write(&path, format!("{}\n", RESULTS_HEADER.join(","))).unwrap();
        append_results(&path, &[result("cortex", 1)]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn appending_nothing_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        append_results(&path, &[]).unwrap();
        assert!(!path.exists());
    }
}
