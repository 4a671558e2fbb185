//! Monthly flow-meter photo log ("relevé du 20").
//!
//! Photos live under the photo directory in a `{site}_{month}_{year}`
//! folder; the log (`releves_20.json`) keeps their paths relative to that
//! directory. There is at most one photo set per (site, month, year).

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::journal::Journal;
use crate::sites::{Site, slug};

pub const DUPLICATE_MESSAGE: &str = "Un relevé existe déjà pour ce site/mois/année";
pub const NO_PHOTO_MESSAGE: &str = "Veuillez sélectionner au moins une photo";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhotoSet {
    pub site: Site,
    #[serde(rename = "mois")]
    pub month: u32,
    #[serde(rename = "annee")]
    pub year: i32,
    /// Flow meter name → path relative to the photo directory.
    pub photos: BTreeMap<String, String>,
    pub timestamp: String,
}

impl PhotoSet {
    fn is(&self, site: Site, month: u32, year: i32) -> bool {
        self.site == site && self.month == month && self.year == year
    }
}

/// One uploaded photo, already read from the request.
#[derive(Clone, Debug)]
pub struct Upload {
    pub meter: String,
    pub bytes: Vec<u8>,
}

pub struct PhotoLog {
    journal: Journal<PhotoSet>,
    dir: PathBuf,
}

impl PhotoLog {
    pub fn new(log_path: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        PhotoLog {
            journal: Journal::new(log_path),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Photo sets, newest (year, month) first.
    pub fn list(&self) -> AppResult<Vec<PhotoSet>> {
        let mut sets = self.journal.read()?;
        sets.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
        Ok(sets)
    }

    pub fn find(&self, site: Site, month: u32, year: i32) -> AppResult<Option<PhotoSet>> {
        Ok(self.journal.read()?.into_iter().find(|s| s.is(site, month, year)))
    }

    /// Stores the uploads and logs the set. Nothing is written when a set
    /// already exists for the period or when there is no photo.
    pub fn record(&self, site: Site, month: u32, year: i32, uploads: Vec<Upload>) -> AppResult<PhotoSet> {
        if !(1..=12).contains(&month) {
            return Err(AppError::Validation(format!("Mois invalide : {}", month)));
        }
        let uploads: Vec<Upload> = uploads.into_iter().filter(|u| !u.bytes.is_empty()).collect();

        let outcome = self.journal.update(|sets| {
            if sets.iter().any(|s| s.is(site, month, year)) {
                return (false, Err(AppError::Validation(DUPLICATE_MESSAGE.to_string())));
            }
            if uploads.is_empty() {
                return (false, Err(AppError::Validation(NO_PHOTO_MESSAGE.to_string())));
            }

            let now = Local::now().naive_local();
            let mut photos = BTreeMap::new();
            for upload in &uploads {
                match self.store_photo(site, month, year, upload, now) {
                    Ok(path) => {
                        photos.insert(upload.meter.clone(), path);
                    }
                    Err(err) => {
                        self.remove_photos(photos.values());
                        return (false, Err(err));
                    }
                }
            }

            let set = PhotoSet {
                site,
                month,
                year,
                photos,
                timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            };
            sets.push(set.clone());
            (true, Ok(set))
        })?;

        let set = outcome?;
        info!("Recorded {} photos for {} {:02}/{}", set.photos.len(), site, month, year);
        Ok(set)
    }

    /// Deletes a set with its files and, once empty, its folder.
    pub fn delete(&self, site: Site, month: u32, year: i32) -> AppResult<bool> {
        self.journal.update(|sets| {
            let Some(index) = sets.iter().position(|s| s.is(site, month, year)) else {
                return (false, false);
            };
            let set = sets.remove(index);
            self.remove_photos(set.photos.values());

            let folder = self.dir.join(folder_name(site, month, year));
            let empty = fs::read_dir(&folder).map(|mut d| d.next().is_none()).unwrap_or(false);
            if empty {
                if let Err(err) = fs::remove_dir(&folder) {
                    warn!("Could not remove {}: {}", folder.display(), err);
                }
            }
            (true, true)
        })
    }

    fn store_photo(
        &self,
        site: Site,
        month: u32,
        year: i32,
        upload: &Upload,
        now: NaiveDateTime,
    ) -> AppResult<String> {
        let stamp = now.format("%Y%m%d_%H%M%S");
        let folder = folder_name(site, month, year);
        let file_name = format!("{}_{}.jpg", slug(&upload.meter), stamp);

        let in_folder = fs::create_dir_all(self.dir.join(&folder))
            .and_then(|_| fs::write(self.dir.join(&folder).join(&file_name), &upload.bytes));
        match in_folder {
            Ok(()) => Ok(format!("{}/{}", folder, file_name)),
            Err(err) => {
                warn!("Could not store photo in {}: {}, falling back to {}", folder, err, self.dir.display());
                let fallback = format!(
                    "{}_{}_{}_{}_{}.jpg",
                    slug(site.code()),
                    slug(&upload.meter),
                    month,
                    year,
                    stamp
                );
                fs::create_dir_all(&self.dir)?;
                fs::write(self.dir.join(&fallback), &upload.bytes)?;
                Ok(fallback)
            }
        }
    }

    fn remove_photos<'a>(&self, paths: impl Iterator<Item = &'a String>) {
        for relative in paths {
            let Some(path) = self.resolve(relative) else {
                warn!("Refusing to delete photo outside {}: {}", self.dir.display(), relative);
                continue;
            };
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("Could not delete {}: {}", path.display(), err),
            }
        }
    }

    /// Absolute path of a stored photo; none for paths leaving the photo
    /// directory.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| self.dir.join(relative))
    }
}

fn folder_name(site: Site, month: u32, year: i32) -> String {
    format!("{}_{}_{}", slug(site.code()), month, year)
}

#[cfg(feature = "web")]
pub use self::web::*;

#[cfg(feature = "web")]
mod web {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::{Extension, Multipart, Query, State};
    use axum::response::{Html, IntoResponse, Redirect, Response};
    use chrono::{Datelike, Local};
    use serde::{Deserialize, Serialize};

    use super::{PhotoSet, Upload};
    use crate::app::AppState;
    use crate::error::{AppError, AppResult};
    use crate::login::Role;
    use crate::params;
    use crate::sites::{Site, slug};

    #[derive(Debug, Deserialize)]
    pub struct PeriodQuery {
        pub site: Option<String>,
        pub mois: Option<String>,
        pub annee: Option<String>,
    }

    impl PeriodQuery {
        fn period(&self) -> Option<AppResult<(Site, u32, i32)>> {
            let (site, month, year) = (self.site.as_deref()?, self.mois.as_deref()?, self.annee.as_deref()?);
            Some(parse_period(site, month, year))
        }
    }

    fn parse_period(site: &str, month: &str, year: &str) -> AppResult<(Site, u32, i32)> {
        Ok((site.parse()?, params::month(month)?, params::year(year)?))
    }

    fn text<'a>(texts: &'a HashMap<String, String>, name: &str) -> &'a str {
        texts.get(name).map(String::as_str).unwrap_or_default()
    }

    #[derive(Serialize)]
    struct MeterField {
        name: &'static str,
        field: String,
    }

    #[derive(Serialize)]
    struct SiteForm {
        code: &'static str,
        meters: Vec<MeterField>,
    }

    #[derive(Serialize)]
    struct SetRow {
        site: Site,
        mois: u32,
        annee: i32,
        count: usize,
    }

    #[derive(Serialize)]
    struct LogPage {
        sites: Vec<SiteForm>,
        sets: Vec<SetRow>,
        site: Option<Site>,
        month: u32,
        year: i32,
        just_saved: bool,
        error: Option<String>,
    }

    #[derive(Serialize)]
    struct PhotoView {
        meter: String,
        path: String,
    }

    #[derive(Serialize)]
    struct PhotosPage {
        photos: Vec<PhotoView>,
    }

    fn log_page(
        state: &AppState,
        role: Role,
        saved: Option<&PhotoSet>,
        error: Option<String>,
    ) -> AppResult<Html<String>> {
        let today = Local::now().date_naive();
        let body = LogPage {
            sites: Site::ALL
                .iter()
                .map(|site| SiteForm {
                    code: site.code(),
                    meters: site
                        .flow_meters()
                        .iter()
                        .map(|name| MeterField {
                            name: *name,
                            field: slug(name),
                        })
                        .collect(),
                })
                .collect(),
            sets: state
                .photos
                .list()?
                .into_iter()
                .map(|set| SetRow {
                    site: set.site,
                    mois: set.month,
                    annee: set.year,
                    count: set.photos.len(),
                })
                .collect(),
            site: saved.map(|s| s.site),
            month: saved.map_or(today.month(), |s| s.month),
            year: saved.map_or(today.year(), |s| s.year),
            just_saved: saved.is_some(),
            error,
        };
        state.templates.render("releve_20", "Relevé du 20", Some(role), &body)
    }

    /// `GET /releve_20`
    pub async fn show_photo_log(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
    ) -> AppResult<Html<String>> {
        log_page(&state, role, None, None)
    }

    /// Text fields and non-empty files of the upload form.
    async fn read_form(mut multipart: Multipart) -> AppResult<(HashMap<String, String>, HashMap<String, Vec<u8>>)> {
        let mut texts = HashMap::new();
        let mut files = HashMap::new();
        let invalid = |err: axum::extract::multipart::MultipartError| AppError::Validation(err.to_string());

        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if field.file_name().is_some() {
                let bytes = field.bytes().await.map_err(invalid)?;
                if !bytes.is_empty() {
                    files.insert(name, bytes.to_vec());
                }
            } else {
                texts.insert(name, field.text().await.map_err(invalid)?);
            }
        }
        Ok((texts, files))
    }

    /// `POST /releve_20`: one photo per flow meter, from the file picker or
    /// the camera input.
    pub async fn upload_photos(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
        multipart: Multipart,
    ) -> AppResult<Html<String>> {
        let (texts, mut files) = read_form(multipart).await?;
        let parsed = parse_period(text(&texts, "site"), text(&texts, "mois"), text(&texts, "annee"));
        let (site, month, year) = match parsed {
            Ok(period) => period,
            Err(err) => return log_page(&state, role, None, Some(err.to_string())),
        };

        let uploads: Vec<Upload> = site
            .flow_meters()
            .iter()
            .filter_map(|meter| {
                let key = format!("photo_{}", slug(meter));
                let bytes = files.remove(&key).or_else(|| files.remove(&format!("{}_camera", key)))?;
                Some(Upload {
                    meter: meter.to_string(),
                    bytes,
                })
            })
            .collect();

        let outcome = {
            let state = state.clone();
            tokio::task::spawn_blocking(move || state.photos.record(site, month, year, uploads)).await?
        };
        match outcome {
            Ok(set) => log_page(&state, role, Some(&set), None),
            Err(AppError::Validation(message)) => log_page(&state, role, None, Some(message)),
            Err(err) => Err(err),
        }
    }

    /// `GET /voir_photos`
    pub async fn show_photos(
        State(state): State<Arc<AppState>>,
        Extension(role): Extension<Role>,
        Query(query): Query<PeriodQuery>,
    ) -> AppResult<Response> {
        let Some(Ok((site, month, year))) = query.period() else {
            return Ok(Redirect::to("/releve_20").into_response());
        };
        let Some(set) = state.photos.find(site, month, year)? else {
            return Ok(Redirect::to("/releve_20").into_response());
        };

        let photos = set
            .photos
            .iter()
            .map(|(meter, path)| PhotoView {
                meter: meter.clone(),
                path: path.split('/').map(|part| urlencoding::encode(part).into_owned()).collect::<Vec<_>>().join("/"),
            })
            .collect();
        let title = format!("Relevé {} {:02}/{}", site, month, year);
        Ok(state
            .templates
            .render("voir_photos", &title, Some(role), &PhotosPage { photos })?
            .into_response())
    }

    /// `GET /supprimer_releve`
    pub async fn delete_photos(State(state): State<Arc<AppState>>, Query(query): Query<PeriodQuery>) -> AppResult<Redirect> {
        if let Some(Ok((site, month, year))) = query.period() {
            let deleted = {
                let state = state.clone();
                tokio::task::spawn_blocking(move || state.photos.delete(site, month, year)).await??
            };
            if deleted {
                log::info!("Deleted photo set {} {:02}/{}", site, month, year);
            }
        }
        Ok(Redirect::to("/releve_20"))
    }
}
