//! Weekly reports: one cached chart per parameter of a site.
//!
//! Charts are rendered on a cache miss only. The report page references
//! them by file name and the browser fetches them from `/graphique/{file}`.

use serde::Serialize;

use crate::cache::{CacheKey, ReportCache, ReportKind};
use crate::chart::{self, GraphOptions};
use crate::error::{AppError, AppResult};
use crate::pdf;
use crate::sites::{ChartShape, Site};
use crate::store::MeasurementStore;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportChart {
    pub parameter: String,
    pub file: String,
}

/// What to draw and under which cache entry.
pub struct ChartRequest<'a> {
    pub site: Site,
    pub parameter: &'a str,
    pub shape: ChartShape,
    pub kind: ReportKind,
    /// Week and year as requested, used for the cache key.
    pub week: Option<u32>,
    pub year: Option<i32>,
    /// Year the series is drawn for.
    pub chart_year: i32,
}

/// Attempts at drawing a chart while the site's data keeps changing.
const RENDER_ATTEMPTS: usize = 3;

/// Cache key of the requested chart, rendering and storing it on a miss.
///
/// A chart drawn from data that was saved over in the meantime is not
/// cached; it is drawn again from the new data.
pub fn render_or_reuse(store: &MeasurementStore, cache: &ReportCache, request: &ChartRequest) -> AppResult<CacheKey> {
    let key = cache.key(request.site, request.parameter, request.week, request.year, request.kind);
    if cache.contains(&key) {
        log::debug!("Chart cache hit for {} {}", request.site, request.parameter);
        return Ok(key);
    }

    // Weekly shapes always cover the whole year.
    let week = if request.shape.is_weekly() { None } else { request.week };
    let options = GraphOptions::for_parameter(
        request.site,
        request.parameter,
        request.shape,
        request.kind,
        request.chart_year,
    );
    for _ in 0..RENDER_ATTEMPTS {
        let sheet = store.load(request.site)?;
        let data = chart::prepare(&sheet, request.parameter, request.shape, request.chart_year, week);
        let png = chart::render_png(&data, &options)?;
        if store.store_if_current(&sheet, || cache.put(&key, &png))? {
            return Ok(key);
        }
        log::debug!("{} changed while drawing {}, drawing again", request.site, request.parameter);
    }
    Err(AppError::Chart(format!(
        "{} kept changing while drawing {}",
        request.site, request.parameter
    )))
}

/// Render (or reuse) every chart of a weekly report
///
/// One chart is produced per parameter of `site` that has a report shape,
/// in catalogue order. Charts already in the cache for this
/// (site, parameter, week, year) are reused as they are.
///
/// # Arguments
/// * `store` - Measurement store the series are read from
/// * `cache` - Chart cache the PNG files are stored in
/// * `site` - Site of the report
/// * `week` - ISO week of the report, used by the daily charts
/// * `year` - Year of the report
///
/// # Returns
/// * `AppResult<Vec<ReportChart>>` - Parameter names with the cache file
///   name of their chart, servable from `/graphique/{file}`
pub fn weekly_charts(
    store: &MeasurementStore,
    cache: &ReportCache,
    site: Site,
    week: u32,
    year: i32,
) -> AppResult<Vec<ReportChart>> {
    let mut charts = Vec::new();
    for parameter in site.measurements() {
        let Some(shape) = site.report_shape(parameter) else {
            continue;
        };
        let request = ChartRequest {
            site,
            parameter,
            shape,
            kind: ReportKind::Report,
            week: Some(week),
            year: Some(year),
            chart_year: year,
        };
        let key = render_or_reuse(store, cache, &request)?;
        charts.push(ReportChart {
            parameter: parameter.to_string(),
            file: key.file_name(),
        });
    }
    Ok(charts)
}

pub fn pdf_title(site: Site, week: u32, year: i32) -> String {
    format!("Rapport {} - semaine {} / {}", site, week, year)
}

/// The weekly report laid out as a PDF.
pub fn weekly_pdf(
    store: &MeasurementStore,
    cache: &ReportCache,
    site: Site,
    week: u32,
    year: i32,
) -> AppResult<Vec<u8>> {
    let charts = weekly_charts(store, cache, site, week, year)?
        .into_iter()
        .map(|c| Ok((c.parameter, cache.read_file(&c.file)?)))
        .collect::<AppResult<Vec<_>>>()?;
    pdf::chart_grid(&pdf_title(site, week, year), &charts)
}

#[cfg(feature = "web")]
pub use self::web::*;

#[cfg(feature = "web")]
mod web {
    use std::sync::Arc;

    use axum::Form;
    use axum::extract::{Extension, Query, State};
    use axum::http::header;
    use axum::response::{Html, IntoResponse, Redirect, Response};
    use chrono::{Datelike, Local};
    use log::{info, warn};
    use serde::{Deserialize, Serialize};
    use tokio::task;

    use super::{ReportChart, pdf_title, weekly_charts, weekly_pdf};
    use crate::app::AppState;
    use crate::error::{AppError, AppResult};
    use crate::login::Role;
    use crate::params;
    use crate::report_log::{ReportEntry, ReportRow};
    use crate::sites::Site;

    #[derive(Debug, Default, Deserialize)]
    pub struct ReportQuery {
        pub site: Option<String>,
        pub semaine: Option<String>,
        pub annee: Option<String>,
    }

    impl ReportQuery {
        /// The requested report when all three fields are present and valid.
        fn period(&self) -> Option<AppResult<(Site, u32, i32)>> {
            let (site, week, year) = (self.site.as_deref()?, self.semaine.as_deref()?, self.annee.as_deref()?);
            Some(parse_period(site, week, year))
        }
    }

    #[derive(Debug, Deserialize)]
    pub struct ReportForm {
        pub site: String,
        pub semaine: String,
        pub annee: String,
    }

    fn parse_period(site: &str, week: &str, year: &str) -> AppResult<(Site, u32, i32)> {
        Ok((site.parse()?, params::week(week)?, params::year(year)?))
    }

    #[derive(Serialize)]
    struct FormPage<'a> {
        sites: Vec<&'static str>,
        site: &'a str,
        week: u32,
        year: i32,
        rows: Vec<ReportRow>,
        just_generated: bool,
        error: Option<String>,
    }

    #[derive(Serialize)]
    struct ResultPage {
        site: Site,
        week: u32,
        year: i32,
        charts: Vec<ReportChart>,
    }

    #[derive(Serialize)]
    struct ListPage {
        entries: Vec<ReportEntry>,
    }

    fn form_page(
        state: &AppState,
        role: Role,
        site: Option<&str>,
        period: Option<(u32, i32)>,
        just_generated: bool,
        error: Option<String>,
    ) -> AppResult<Html<String>> {
        let today = Local::now().date_naive();
        let (week, year) = period.unwrap_or((today.iso_week().week(), today.year()));
        let body = FormPage {
            sites: Site::ALL.iter().map(|s| s.code()).collect(),
            site: site.unwrap_or(Site::ALL[0].code()),
            week,
            year,
            rows: state.reports.table()?,
            just_generated,
            error,
        };
        state.templates.render("rapport_form", "Rapports hebdomadaires", Some(role), &body)
    }

    async fn charts_in_background(state: Arc<AppState>, site: Site, week: u32, year: i32) -> AppResult<Vec<ReportChart>> {
        task::spawn_blocking(move || weekly_charts(&state.store, &state.cache, site, week, year)).await?
    }

    /// `GET /rapport`: the form, or a report's chart grid when `site`,
    /// `semaine` and `annee` are given.
    pub async fn show_report(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
        Query(query): Query<ReportQuery>,
    ) -> AppResult<Response> {
        match query.period() {
            None => Ok(form_page(&state, role, query.site.as_deref(), None, false, None)?.into_response()),
            Some(Err(err)) => {
                warn!("Invalid report request: {}", err);
                Ok(Redirect::to("/rapport").into_response())
            }
            Some(Ok((site, week, year))) => {
                let charts = charts_in_background(state.clone(), site, week, year).await?;
                let title = pdf_title(site, week, year);
                let body = ResultPage {
                    site,
                    week,
                    year,
                    charts,
                };
                Ok(state.templates.render("rapport_resultat", &title, Some(role), &body)?.into_response())
            }
        }
    }

    /// `POST /rapport`: renders the report and logs it.
    pub async fn generate_report(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
        Form(form): Form<ReportForm>,
    ) -> AppResult<Html<String>> {
        let (site, week, year) = match parse_period(&form.site, &form.semaine, &form.annee) {
            Ok(period) => period,
            Err(err @ (AppError::Validation(_) | AppError::UnknownSite(_))) => {
                return form_page(&state, role, Some(&form.site), None, false, Some(err.to_string()));
            }
            Err(err) => return Err(err),
        };

        let charts = charts_in_background(state.clone(), site, week, year).await?;
        if state.reports.record(site, week, year)? {
            info!("Report {} S{} {} generated ({} charts)", site, week, year, charts.len());
        }
        form_page(&state, role, Some(site.code()), Some((week, year)), true, None)
    }

    /// `GET /rapport/pdf`
    pub async fn report_pdf(State(state): State<Arc<AppState>>, Query(query): Query<ReportQuery>) -> AppResult<Response> {
        let (site, week, year) = query
            .period()
            .ok_or_else(|| AppError::Validation("Site, semaine et année requis".to_string()))??;

        let bytes = {
            let state = state.clone();
            task::spawn_blocking(move || weekly_pdf(&state.store, &state.cache, site, week, year)).await??
        };
        let disposition = format!("attachment; filename=\"rapport_{}_S{}_{}.pdf\"", site, week, year);
        Ok((
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response())
    }

    /// `GET /rapports`
    pub async fn list_reports(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
    ) -> AppResult<Html<String>> {
        let body = ListPage {
            entries: state.reports.list()?,
        };
        state.templates.render("rapports", "Bibliothèque des rapports", Some(role), &body)
    }

    /// `GET /supprimer_rapport`
    pub async fn delete_report(State(state): State<Arc<AppState>>, Query(query): Query<ReportQuery>) -> AppResult<Redirect> {
        let Some(period) = query.period() else {
            return Ok(Redirect::to("/rapport"));
        };
        let (site, week, year) = period?;
        if state.reports.delete(site, week, year)? {
            info!("Report {} S{} {} removed from the log", site, week, year);
        }
        Ok(Redirect::to(&format!("/rapport?site={}", urlencoding::encode(site.code()))))
    }
}
