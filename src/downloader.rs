//! Workbook download, CSV export and in-browser editing of a site sheet.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::store::{DATE_COLUMN, STATUS_COLUMN, SiteSheet, Status, parse_date};

pub const WORKBOOK_DOWNLOAD_NAME: &str = "mesures_export.xlsx";
pub const SAVED_MESSAGE: &str = "Modifications enregistrées !";

/// Convert a site sheet to CSV format
///
/// The header is the workbook header (`Date`, `Statut`, measurements).
/// Readable rows come first in sheet order, then the lines that could not
/// be read, as stored. Values containing commas, quotes or newlines are
/// quoted.
pub fn to_csv(sheet: &SiteSheet) -> String {
    let columns = sheet.columns();
    let mut csv_content = String::new();
    push_line(&mut csv_content, columns.iter().copied());

    for row in &sheet.rows {
        let date = row.date.format("%Y-%m-%d").to_string();
        let cells = [date.as_str(), row.status.label()]
            .into_iter()
            .chain(columns.iter().skip(2).map(|name| row.value(name)));
        push_line(&mut csv_content, cells);
    }
    for raw in &sheet.unreadable {
        push_line(&mut csv_content, raw.iter().map(String::as_str));
    }

    csv_content
}

fn push_line<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    for (c, value) in cells.enumerate() {
        if c > 0 {
            out.push(',');
        }
        if value.contains(',') || value.contains('"') || value.contains('\n') {
            out.push_str(&format!("\"{}\"", value.replace('"', "\"\"")));
        } else {
            out.push_str(value);
        }
    }
    out.push('\n');
}

fn field_name(row: usize, column: &str) -> String {
    format!("cell_{}_{}", row, column)
}

#[derive(Debug, Serialize)]
pub struct GridCell {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct GridRow {
    pub cells: Vec<GridCell>,
}

/// Editable grid of the readable rows, one `cell_{row}_{column}` field per
/// cell.
pub fn grid(sheet: &SiteSheet) -> Vec<GridRow> {
    let columns = sheet.columns();
    sheet
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| GridRow {
            cells: columns
                .iter()
                .map(|column| {
                    let value = match *column {
                        DATE_COLUMN => row.date.format("%Y-%m-%d").to_string(),
                        STATUS_COLUMN => row.status.label().to_string(),
                        name => row.value(name).to_string(),
                    };
                    GridCell {
                        field: field_name(i, column),
                        value,
                    }
                })
                .collect(),
        })
        .collect()
}

/// Applies the submitted `cell_{row}_{column}` fields to `sheet`. Fields for
/// unknown rows or columns are ignored. A date or status that does not
/// parse rejects the whole submission. Returns how many cells changed.
pub fn edit_cells(sheet: &mut SiteSheet, form: &HashMap<String, String>) -> AppResult<usize> {
    let columns = sheet.columns();
    let mut changed = 0;

    for (i, row) in sheet.rows.iter_mut().enumerate() {
        for column in &columns {
            let Some(submitted) = form.get(&field_name(i, column)) else {
                continue;
            };
            let submitted = submitted.trim();
            match *column {
                DATE_COLUMN => {
                    let date = parse_date(submitted).ok_or_else(|| {
                        AppError::Validation(format!("Ligne {} : date invalide « {} »", i + 1, submitted))
                    })?;
                    if date != row.date {
                        row.date = date;
                        changed += 1;
                    }
                }
                STATUS_COLUMN => {
                    let status = Status::parse(submitted).ok_or_else(|| {
                        AppError::Validation(format!("Ligne {} : statut invalide « {} »", i + 1, submitted))
                    })?;
                    if status != row.status {
                        row.status = status;
                        changed += 1;
                    }
                }
                name => {
                    if row.value(name) == submitted {
                        continue;
                    }
                    if submitted.is_empty() {
                        row.values.remove(name);
                    } else {
                        row.set(name, submitted);
                    }
                    changed += 1;
                }
            }
        }
    }
    Ok(changed)
}

#[cfg(feature = "web")]
pub use self::web::*;

#[cfg(feature = "web")]
mod web {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::Form;
    use axum::extract::{Extension, Query, State};
    use axum::http::header;
    use axum::response::{Html, IntoResponse, Response};
    use log::info;
    use serde::{Deserialize, Serialize};
    use tokio::task;

    use super::{GridRow, SAVED_MESSAGE, WORKBOOK_DOWNLOAD_NAME, edit_cells, grid, to_csv};
    use crate::app::AppState;
    use crate::error::{AppError, AppResult};
    use crate::login::Role;
    use crate::sites::Site;
    use crate::store::SiteSheet;

    #[derive(Debug, Deserialize)]
    pub struct SiteQuery {
        pub site: Option<String>,
    }

    impl SiteQuery {
        fn site_or_first(&self) -> AppResult<Site> {
            match self.site.as_deref() {
                Some(code) if !code.trim().is_empty() => code.parse(),
                _ => Ok(Site::ALL[0]),
            }
        }
    }

    #[derive(Serialize)]
    struct EditorPage<'a> {
        sites: Vec<&'static str>,
        site: Site,
        columns: Vec<&'static str>,
        rows: Vec<GridRow>,
        message: Option<&'a str>,
        error: Option<String>,
    }

    /// `GET /telecharger_mesures`
    pub async fn download_workbook(State(state): State<Arc<AppState>>) -> AppResult<Response> {
        let bytes = task::spawn_blocking(move || state.store.workbook_bytes()).await??;
        let disposition = format!("attachment; filename=\"{}\"", WORKBOOK_DOWNLOAD_NAME);
        Ok((
            [
                (
                    header::CONTENT_TYPE,
                    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
                ),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response())
    }

    /// `GET /export_csv?site=`
    pub async fn export_csv(State(state): State<Arc<AppState>>, Query(query): Query<SiteQuery>) -> AppResult<Response> {
        let site = query.site_or_first()?;
        let sheet = task::spawn_blocking(move || state.store.load(site)).await??;
        let disposition = format!("attachment; filename=\"mesures_{}.csv\"", site);
        Ok((
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            to_csv(&sheet),
        )
            .into_response())
    }

    fn editor_page(
        state: &AppState,
        role: Role,
        sheet: &SiteSheet,
        message: Option<&str>,
        error: Option<String>,
    ) -> AppResult<Html<String>> {
        let body = EditorPage {
            sites: Site::ALL.iter().map(|s| s.code()).collect(),
            site: sheet.site,
            columns: sheet.columns(),
            rows: grid(sheet),
            message,
            error,
        };
        state.templates.render("gestion_excel", "Gestion du fichier Excel", Some(role), &body)
    }

    /// `GET /gestion_excel?site=`
    pub async fn show_editor(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
        Query(query): Query<SiteQuery>,
    ) -> AppResult<Html<String>> {
        let site = query.site_or_first()?;
        let sheet = {
            let state = state.clone();
            task::spawn_blocking(move || state.store.load(site)).await??
        };
        editor_page(&state, role, &sheet, None, None)
    }

    /// `POST /gestion_excel?site=`
    pub async fn save_editor(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
        Query(query): Query<SiteQuery>,
        Form(form): Form<HashMap<String, String>>,
    ) -> AppResult<Html<String>> {
        let site = query.site_or_first()?;
        let outcome = {
            let state = state.clone();
            task::spawn_blocking(move || -> AppResult<(Arc<SiteSheet>, AppResult<usize>)> {
                let mut sheet = (*state.store.load(site)?).clone();
                match edit_cells(&mut sheet, &form) {
                    Ok(changed) => {
                        state.store.save(&sheet)?;
                        Ok((state.store.load(site)?, Ok(changed)))
                    }
                    Err(err) => Ok((state.store.load(site)?, Err(err))),
                }
            })
            .await??
        };
        match outcome {
            (sheet, Ok(changed)) => {
                info!("Workbook editor saved {} ({} cells changed)", site, changed);
                editor_page(&state, role, &sheet, Some(SAVED_MESSAGE), None)
            }
            (sheet, Err(AppError::Validation(message))) => editor_page(&state, role, &sheet, None, Some(message)),
            (_, Err(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::Site;
    use crate::store::MeasurementRow;
    use chrono::NaiveDate;

    fn sheet() -> SiteSheet {
        let mut sheet = SiteSheet::empty(Site::Lpz);
        let mut row = MeasurementRow::new(NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(), Status::Validated);
        row.set("Exhaure 1", "1500");
        row.set("pH entrée", "7,2");
        sheet.rows.push(row);
        sheet
    }

    #[test]
    fn csv_has_header_and_quotes_commas() {
        let mut sheet = sheet();
        sheet.unreadable.push(vec!["hier".to_string(), "?".to_string()]);
        let csv = to_csv(&sheet);
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[0].starts_with("Date,Statut,Exhaure 1,Exhaure 2,"));
        assert!(lines[1].starts_with("2025-01-06,Validé,1500,,"));
        assert!(lines[1].contains("\"7,2\""));
        assert_eq!(lines[2], "hier,?");
        assert_eq!(lines[1].split(',').count(), sheet.columns().len() + 1);
    }

    #[test]
    fn grid_fields_follow_row_and_column() {
        let rows = grid(&sheet());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cells[0].field, "cell_0_Date");
        assert_eq!(rows[0].cells[0].value, "2025-01-06");
        assert_eq!(rows[0].cells[1].value, "Validé");
        assert_eq!(rows[0].cells[2].field, "cell_0_Exhaure 1");
    }

    #[test]
    fn edits_apply_and_count_changes() {
        let mut sheet = sheet();
        let form: HashMap<String, String> = [
            ("cell_0_Statut", "Brouillon"),
            ("cell_0_Exhaure 1", "1500"),
            ("cell_0_pH entrée", ""),
            ("cell_0_CO2", "3"),
            ("cell_7_CO2", "9"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(edit_cells(&mut sheet, &form).unwrap(), 3);
        assert_eq!(sheet.rows[0].status, Status::Draft);
        assert_eq!(sheet.rows[0].value("pH entrée"), "");
        assert_eq!(sheet.rows[0].value("CO2"), "3");
    }

    #[test]
    fn bad_date_is_rejected() {
        let mut sheet = sheet();
        let form = HashMap::from([("cell_0_Date".to_string(), "demain".to_string())]);
        let err = edit_cells(&mut sheet, &form).unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("Ligne 1")));
    }
}
