//! Measurement store backed by a single `.xlsx` workbook.
//!
//! One worksheet per site, named by the site code. The header row is
//! `Date`, `Statut`, then the site's measurements. Reading goes through
//! calamine; writing rebuilds the whole workbook with rust_xlsxwriter and
//! swaps it in atomically, since xlsx files cannot be patched in place.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use calamine::{Data, Reader, Xlsx, open_workbook};
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use rust_xlsxwriter::{Workbook, Worksheet};
use tempfile::NamedTempFile;

use crate::cache::ReportCache;
use crate::error::{AppError, AppResult};
use crate::sites::Site;

pub const DATE_COLUMN: &str = "Date";
pub const STATUS_COLUMN: &str = "Statut";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Draft,
    Validated,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Draft => "Brouillon",
            Status::Validated => "Validé",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "Brouillon" => Some(Status::Draft),
            "Validé" | "Valide" => Some(Status::Validated),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One line of a site sheet. Values are kept as entered; numeric readings
/// are parsed on demand.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRow {
    pub date: NaiveDate,
    pub status: Status,
    pub values: BTreeMap<String, String>,
}

impl MeasurementRow {
    pub fn new(date: NaiveDate, status: Status) -> Self {
        MeasurementRow {
            date,
            status,
            values: BTreeMap::new(),
        }
    }

    pub fn value(&self, name: &str) -> &str {
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        parse_number(self.value(name))
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SiteSheet {
    pub site: Site,
    pub rows: Vec<MeasurementRow>,
    /// Lines whose date or status could not be read. They are not shown or
    /// charted but are written back untouched.
    pub unreadable: Vec<Vec<String>>,
}

impl SiteSheet {
    pub fn empty(site: Site) -> Self {
        SiteSheet {
            site,
            rows: Vec::new(),
            unreadable: Vec::new(),
        }
    }

    /// Workbook header for this site.
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec![DATE_COLUMN, STATUS_COLUMN];
        columns.extend_from_slice(self.site.measurements());
        columns
    }

    /// Rows of `date` with `status`, in sheet order.
    pub fn rows_on(&self, date: NaiveDate, status: Status) -> impl Iterator<Item = (usize, &MeasurementRow)> {
        self.rows
            .iter()
            .enumerate()
            .filter(move |(_, row)| row.date == date && row.status == status)
    }
}

/// Accepts both `12.5` and `12,5`.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.replace(',', ".").parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%d/%m/%Y"))
        .ok()
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Float(f) => format_number(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn cell_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime().map(|d: NaiveDateTime| d.date()),
        other => parse_date(&cell_text(other)),
    }
}

/// Integral floats are shown without a trailing `.0`.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

struct Memo {
    modified: SystemTime,
    sheet: Arc<SiteSheet>,
}

pub struct MeasurementStore {
    path: PathBuf,
    cache: ReportCache,
    memo: Mutex<HashMap<Site, Memo>>,
    write_lock: Mutex<()>,
}

impl MeasurementStore {
    pub fn new(path: impl Into<PathBuf>, cache: ReportCache) -> Self {
        MeasurementStore {
            path: path.into(),
            cache,
            memo: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the workbook with an empty sheet per site when missing.
    pub fn initialize(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        if self.path.exists() {
            return Ok(());
        }
        info!("Creating workbook {}", self.path.display());
        let sheets: Vec<SiteSheet> = Site::ALL.iter().map(|site| SiteSheet::empty(*site)).collect();
        self.write_workbook(&sheets)
    }

    /// Site sheet, memoized on the workbook modification time.
    ///
    /// A workbook that cannot be opened (truncated, half-written by another
    /// program) yields an empty sheet and a warning. [`save`](Self::save)
    /// still refuses to overwrite it.
    pub fn load(&self, site: Site) -> AppResult<Arc<SiteSheet>> {
        if !self.path.exists() {
            self.initialize()?;
        }
        let modified = fs::metadata(&self.path)?.modified()?;

        let mut memo = self.memo.lock().map_err(|_| poisoned())?;
        if let Some(entry) = memo.get(&site) {
            if entry.modified == modified {
                return Ok(entry.sheet.clone());
            }
        }

        let sheet = match self.read_sheet(site) {
            Ok(sheet) => sheet,
            Err(AppError::WorkbookRead(err)) => {
                warn!("Cannot open {} for {}, showing an empty sheet: {}", self.path.display(), site, err);
                SiteSheet::empty(site)
            }
            Err(err) => return Err(err),
        };
        let sheet = Arc::new(sheet);
        memo.insert(
            site,
            Memo {
                modified,
                sheet: sheet.clone(),
            },
        );
        Ok(sheet)
    }

    /// Replace one site's sheet in the workbook
    ///
    /// The workbook is rebuilt from `sheet` and the current sheets of the
    /// other sites, written to a temporary file and renamed over the old one.
    /// Afterwards the site's memo and every cached chart of the site are
    /// dropped, so the next page shows the new data.
    ///
    /// # Arguments
    /// * `sheet` - The full sheet of one site, as it should be stored
    ///
    /// # Returns
    /// * `AppResult<()>` - `AppError::WorkbookRead` when the existing workbook
    ///   cannot be opened; it is then left untouched
    ///
    /// # Examples
    /// ```no_run
    /// use releves_ste::{MeasurementStore, Site};
    /// use releves_ste::cache::ReportCache;
    /// use std::time::Duration;
    ///
    /// let cache = ReportCache::new("data/cache", Duration::from_secs(3600));
    /// let store = MeasurementStore::new("data/mesures.xlsx", cache);
    /// let mut sheet = (*store.load(Site::Smp)?).clone();
    /// sheet.rows.retain(|row| row.date.to_string() != "2025-01-01");
    /// store.save(&sheet)?;
    /// # Ok::<(), releves_ste::AppError>(())
    /// ```
    pub fn save(&self, sheet: &SiteSheet) -> AppResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;

        if self.path.exists() {
            // Also rejects a workbook that `load` only showed as empty.
            let _: Xlsx<_> = open_workbook(&self.path)?;
        }
        let mut sheets = Vec::with_capacity(Site::ALL.len());
        for site in Site::ALL {
            if site == sheet.site {
                sheets.push(sheet.clone());
            } else if self.path.exists() {
                sheets.push(self.read_sheet(site)?);
            } else {
                sheets.push(SiteSheet::empty(site));
            }
        }
        self.write_workbook(&sheets)?;

        self.memo.lock().map_err(|_| poisoned())?.remove(&sheet.site);
        let removed = self.cache.invalidate_site(sheet.site)?;
        debug!("Saved {} ({} rows), {} cached charts dropped", sheet.site, sheet.rows.len(), removed);
        Ok(())
    }

    /// Runs `store` only while `sheet` is still the site's current data, with
    /// saves held off. Returns false, without running it, when the workbook
    /// changed since `sheet` was loaded.
    pub fn store_if_current(&self, sheet: &Arc<SiteSheet>, store: impl FnOnce() -> AppResult<()>) -> AppResult<bool> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(_) => return Ok(false),
        };
        let current = self
            .memo
            .lock()
            .map_err(|_| poisoned())?
            .get(&sheet.site)
            .is_some_and(|entry| entry.modified == modified && Arc::ptr_eq(&entry.sheet, sheet));
        if current {
            store()?;
        }
        Ok(current)
    }

    pub fn workbook_bytes(&self) -> AppResult<Vec<u8>> {
        if !self.path.exists() {
            return Err(AppError::NotFound("Fichier".to_string()));
        }
        Ok(fs::read(&self.path)?)
    }

    fn read_sheet(&self, site: Site) -> AppResult<SiteSheet> {
        let mut workbook: Xlsx<_> = open_workbook(&self.path)?;
        let range = match workbook.worksheet_range(site.code()) {
            Ok(range) => range,
            Err(err) => {
                warn!("No readable sheet for {} in {}: {}", site, self.path.display(), err);
                return Ok(SiteSheet::empty(site));
            }
        };

        let mut lines = range.rows();
        let header: Vec<String> = match lines.next() {
            Some(cells) => cells.iter().map(|c| cell_text(c).trim().to_string()).collect(),
            None => return Ok(SiteSheet::empty(site)),
        };
        let column = |name: &str| header.iter().position(|h| h == name);
        let date_col = column(DATE_COLUMN);
        let status_col = column(STATUS_COLUMN);

        let mut sheet = SiteSheet::empty(site);
        for cells in lines {
            if cells.iter().all(|c| matches!(c, Data::Empty)) {
                continue;
            }
            let date = date_col.and_then(|i| cells.get(i)).and_then(cell_date);
            let status = status_col
                .and_then(|i| cells.get(i))
                .and_then(|c| Status::parse(&cell_text(c)));

            match (date, status) {
                (Some(date), Some(status)) => {
                    let mut row = MeasurementRow::new(date, status);
                    for name in site.measurements() {
                        if let Some(cell) = column(name).and_then(|i| cells.get(i)) {
                            let text = cell_text(cell);
                            if !text.is_empty() {
                                row.set(name, text);
                            }
                        }
                    }
                    sheet.rows.push(row);
                }
                _ => {
                    warn!("Skipping unreadable {} row: {:?}", site, cells);
                    // Realign to our column order so the line survives a rewrite.
                    let raw = sheet
                        .columns()
                        .iter()
                        .map(|name| column(name).and_then(|i| cells.get(i)).map(cell_text).unwrap_or_default())
                        .collect();
                    sheet.unreadable.push(raw);
                }
            }
        }
        Ok(sheet)
    }

    fn write_workbook(&self, sheets: &[SiteSheet]) -> AppResult<()> {
        let mut workbook = Workbook::new();

        for sheet in sheets {
            let mut worksheet = Worksheet::new();
            worksheet.set_name(sheet.site.code())?;

            let columns = sheet.columns();
            for (c, name) in columns.iter().enumerate() {
                worksheet.write_string(0, c as u16, *name)?;
            }

            let mut r: u32 = 1;
            for row in &sheet.rows {
                worksheet.write_string(r, 0, row.date.format("%Y-%m-%d").to_string().as_str())?;
                worksheet.write_string(r, 1, row.status.label())?;
                for (c, name) in columns.iter().enumerate().skip(2) {
                    write_cell(&mut worksheet, r, c as u16, row.value(name))?;
                }
                r += 1;
            }
            for raw in &sheet.unreadable {
                for (c, text) in raw.iter().enumerate() {
                    write_cell(&mut worksheet, r, c as u16, text)?;
                }
                r += 1;
            }

            workbook.push_worksheet(worksheet);
        }

        let buffer = workbook.save_to_buffer()?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(&buffer)?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, text: &str) -> AppResult<()> {
    if text.is_empty() {
        return Ok(());
    }
    match parse_number(text) {
        Some(number) if !text.contains(',') => {
            worksheet.write_number(row, col, number)?;
        }
        _ => {
            worksheet.write_string(row, col, text)?;
        }
    }
    Ok(())
}

fn poisoned() -> AppError {
    AppError::Io(std::io::Error::other("measurement store lock poisoned"))
}
