use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Form, Router,
    extract::{DefaultBodyLimit, Extension, Path, Request, State},
    http::header,
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use chrono::{Datelike, Local};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task;
use tower_http::services::ServeDir;

use crate::cache::{ReportCache, ReportKind};
use crate::config::Config;
use crate::downloader;
use crate::entry::{self, AlertChoice, EntryPage};
use crate::error::{AppError, AppResult};
use crate::login::{self, Role};
use crate::params;
use crate::photo_log::{self, PhotoLog};
use crate::report::{self, ChartRequest};
use crate::report_log::ReportLog;
use crate::sites::{MONDAY_ONLY, Site};
use crate::store::{MeasurementStore, SiteSheet, format_number};
use crate::templates::Templates;

/// Everything the handlers share.
pub struct AppState {
    pub config: Config,
    pub store: MeasurementStore,
    pub cache: ReportCache,
    pub reports: ReportLog,
    pub photos: PhotoLog,
    pub templates: Templates,
}

impl AppState {
    pub fn new(config: Config) -> AppResult<Self> {
        let cache = ReportCache::new(&config.cache_dir, config.cache_ttl);
        Ok(AppState {
            store: MeasurementStore::new(&config.workbook_path, cache.clone()),
            reports: ReportLog::new(&config.reports_log_path),
            photos: PhotoLog::new(&config.photo_log_path, &config.photos_dir),
            templates: Templates::new()?,
            cache,
            config,
        })
    }
}

/// All routes, each group behind the minimum role it needs.
pub fn router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        .route("/", get(index))
        .route("/saisie/:site", get(show_entry).post(submit_entry))
        .route("/visualisation", get(show_visualisation).post(draw_visualisation))
        .route("/graphique/:file", get(serve_chart))
        .route_layer(middleware::from_fn_with_state(Role::Operator, login::require_role));

    let reader = Router::new()
        .route("/releve_20", get(photo_log::show_photo_log).post(photo_log::upload_photos))
        .route("/voir_photos", get(photo_log::show_photos))
        .route("/supprimer_releve", get(photo_log::delete_photos))
        .nest_service("/photos_releves", ServeDir::new(&state.config.photos_dir))
        .route_layer(middleware::from_fn_with_state(Role::Reader, login::require_role));

    let manager = Router::new()
        .route("/rapport", get(report::show_report).post(report::generate_report))
        .route("/rapport/pdf", get(report::report_pdf))
        .route("/rapports", get(report::list_reports))
        .route("/supprimer_rapport", get(report::delete_report))
        .route("/telecharger_mesures", get(downloader::download_workbook))
        .route("/export_csv", get(downloader::export_csv))
        .route("/gestion_excel", get(downloader::show_editor).post(downloader::save_editor))
        .route_layer(middleware::from_fn_with_state(Role::Manager, login::require_role));

    Router::new()
        .route("/login", get(login::serve_login_page).post(login::handle_login))
        .route("/logout", get(login::handle_logout))
        .merge(operator)
        .merge(reader)
        .merge(manager)
        .layer(DefaultBodyLimit::max(state.config.upload_limit))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Prepares the data directory, then serves until the process stops.
#[cfg(not(tarpaulin_include))]
pub async fn run(config: Config) -> AppResult<()> {
    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::create_dir_all(&config.photos_dir)?;

    let state = Arc::new(AppState::new(config)?);
    state.store.initialize()?;
    let purged = state.cache.purge_expired()?;
    info!("Removed {} expired charts from {}", purged, state.cache.dir().display());

    let bind = state.config.bind;
    let app = router(state);
    let listener = TcpListener::bind(bind).await?;
    info!("Listening on http://{}", bind);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

fn site_codes() -> Vec<&'static str> {
    Site::ALL.iter().map(|s| s.code()).collect()
}

/// Loads `site`, applies `change` and saves when it reports a change, off the
/// async executor.
async fn update_sheet<R: Send + 'static>(
    state: Arc<AppState>,
    site: Site,
    change: impl FnOnce(&mut SiteSheet) -> (bool, R) + Send + 'static,
) -> AppResult<R> {
    task::spawn_blocking(move || {
        let mut sheet = (*state.store.load(site)?).clone();
        let (changed, result) = change(&mut sheet);
        if changed {
            state.store.save(&sheet)?;
        }
        Ok(result)
    })
    .await?
}

async fn index(State(state): State<Arc<AppState>>, Extension(role): Extension<Role>) -> AppResult<Html<String>> {
    #[derive(Serialize)]
    struct IndexPage {
        sites: Vec<&'static str>,
    }
    state
        .templates
        .render("index", "Relevés des stations", Some(role), &IndexPage { sites: site_codes() })
}

#[derive(Serialize)]
struct EntryField {
    name: &'static str,
    value: String,
    previous: String,
    difference: String,
    disabled: bool,
}

#[derive(Serialize)]
struct EntryFormPage {
    site: Site,
    date: String,
    is_monday: bool,
    fields: Vec<EntryField>,
}

/// `GET /saisie/{site}`: today's form, or the alert when today is already
/// validated.
async fn show_entry(
    State(state): State<Arc<AppState>>,
    Extension(role): Extension<Role>,
    Path(site): Path<String>,
) -> AppResult<Html<String>> {
    let site: Site = site.parse()?;
    let today = Local::now().date_naive();
    let sheet = {
        let state = state.clone();
        task::spawn_blocking(move || state.store.load(site)).await??
    };

    match entry::prepare(&sheet, today) {
        EntryPage::AlreadyValidated { reading } => state.templates.render(
            "alerte",
            &format!("Saisie {}", site),
            Some(role),
            &serde_json::json!({ "site": site, "reading": reading }),
        ),
        EntryPage::Form(view) => {
            let fields = site
                .measurements()
                .iter()
                .map(|name| EntryField {
                    name: *name,
                    value: view.values.get(*name).cloned().unwrap_or_default(),
                    previous: view.previous.get(*name).cloned().unwrap_or_default(),
                    difference: view
                        .differences
                        .get(*name)
                        .copied()
                        .flatten()
                        .map(format_number)
                        .unwrap_or_default(),
                    disabled: MONDAY_ONLY.contains(name) && !view.is_monday,
                })
                .collect();
            let body = EntryFormPage {
                site,
                date: today.format("%d/%m/%Y").to_string(),
                is_monday: view.is_monday,
                fields,
            };
            state.templates.render("saisie", &format!("Saisie {}", site), Some(role), &body)
        }
    }
}

/// `POST /saisie/{site}`: an alert choice (`choix`) or the entry form.
async fn submit_entry(
    State(state): State<Arc<AppState>>,
    Extension(role): Extension<Role>,
    Path(site): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> AppResult<Response> {
    let site: Site = site.parse()?;
    let today = Local::now().date_naive();

    if let Some(choice) = form.get("choix") {
        let choice: AlertChoice = choice.parse()?;
        if choice == AlertChoice::Cancel {
            return Ok(Redirect::to("/").into_response());
        }
        let changed = update_sheet(state.clone(), site, move |sheet| {
            let changed = entry::apply_choice(sheet, choice, today);
            (changed, changed)
        })
        .await?;
        if changed {
            info!("{} entry alert: {:?}", site, choice);
        }
        return Ok(Redirect::to(&format!("/saisie/{}", site)).into_response());
    }

    let finalize = form.contains_key("finaliser");
    let message = update_sheet(state.clone(), site, move |sheet| {
        (true, entry::submit(sheet, today, &form, finalize))
    })
    .await?;
    info!("{} entry for {}: {}", site, today, message);

    Ok(state
        .templates
        .render(
            "confirmation",
            &format!("Saisie {}", site),
            Some(role),
            &serde_json::json!({ "site": site, "message": message }),
        )?
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct VisualisationForm {
    #[serde(default)]
    site: String,
    #[serde(default)]
    parametre: String,
    semaine: Option<String>,
    annee: Option<String>,
}

#[derive(Serialize)]
struct SiteParameters {
    code: &'static str,
    measurements: &'static [&'static str],
}

#[derive(Serialize, Default)]
struct VisualisationPage {
    sites: Vec<SiteParameters>,
    site: String,
    parameter: String,
    week: String,
    year: String,
    chart: Option<String>,
    error: Option<String>,
}

fn visualisation_page(state: &AppState, role: Role, mut body: VisualisationPage) -> AppResult<Html<String>> {
    body.sites = Site::ALL
        .iter()
        .map(|site| SiteParameters {
            code: site.code(),
            measurements: site.measurements(),
        })
        .collect();
    state.templates.render("visualisation", "Visualisation", Some(role), &body)
}

async fn show_visualisation(
    State(state): State<Arc<AppState>>,
    Extension(role): Extension<Role>,
) -> AppResult<Html<String>> {
    visualisation_page(&state, role, VisualisationPage::default())
}

/// `POST /visualisation`: draws one parameter, reusing the cached chart when
/// there is one. Without a year the current one is drawn.
async fn draw_visualisation(
    State(state): State<Arc<AppState>>,
    Extension(role): Extension<Role>,
    Form(form): Form<VisualisationForm>,
) -> AppResult<Html<String>> {
    let mut body = VisualisationPage {
        site: form.site.clone(),
        parameter: form.parametre.clone(),
        week: form.semaine.clone().unwrap_or_default(),
        year: form.annee.clone().unwrap_or_default(),
        ..Default::default()
    };

    match chart_for(state.clone(), form).await {
        Ok(file) => body.chart = Some(file),
        Err(err @ (AppError::Validation(_) | AppError::UnknownSite(_))) => body.error = Some(err.to_string()),
        Err(err) => return Err(err),
    }
    visualisation_page(&state, role, body)
}

async fn chart_for(state: Arc<AppState>, form: VisualisationForm) -> AppResult<String> {
    let site: Site = form.site.parse()?;
    if !site.has_measurement(&form.parametre) {
        return Err(AppError::Validation(format!(
            "Paramètre inconnu pour {} : {}",
            site, form.parametre
        )));
    }
    let week = params::optional(form.semaine.as_deref(), params::week)?;
    let year = params::optional(form.annee.as_deref(), params::year)?;
    let chart_year = year.unwrap_or_else(|| Local::now().year());

    task::spawn_blocking(move || {
        let request = ChartRequest {
            site,
            parameter: &form.parametre,
            shape: site.chart_shape(&form.parametre),
            kind: ReportKind::Visualisation,
            week,
            year,
            chart_year,
        };
        report::render_or_reuse(&state.store, &state.cache, &request).map(|key| key.file_name())
    })
    .await?
}

/// `GET /graphique/{file}`
async fn serve_chart(State(state): State<Arc<AppState>>, Path(file): Path<String>) -> AppResult<Response> {
    let png = state.cache.read_file(&file)?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "private, max-age=3600"),
        ],
        png,
    )
        .into_response())
}
