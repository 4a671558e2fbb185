//! On-disk cache of rendered chart images.
//!
//! A chart is identified by (site, parameter, week, year, kind). Its PNG is
//! stored as `{SITE}_{digest}.png` so that every chart of a site can be
//! dropped by a directory scan when that site's measurements are saved.
//! Entries older than the TTL are ignored and purged at startup.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::sites::Site;

/// Page a chart was rendered for; both pages draw the same parameter
/// differently, so they never share an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportKind {
    Visualisation,
    Report,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Visualisation => "visualisation",
            ReportKind::Report => "rapport",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKey {
    site: Site,
    digest: String,
}

impl CacheKey {
    pub fn file_name(&self) -> String {
        format!("{}_{}.png", self.site.code(), self.digest)
    }
}

#[derive(Clone, Debug)]
pub struct ReportCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ReportCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        ReportCache { dir: dir.into(), ttl }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Builds the cache key of one chart.
    ///
    /// The key hashes the request fields as submitted, so a missing week or
    /// year is a different entry from an explicit one.
    ///
    /// # Arguments
    /// * `site` - Site the chart belongs to, also the file name prefix
    /// * `parameter` - Measurement name as listed for the site
    /// * `week` - ISO week, if the request named one
    /// * `year` - Year, if the request named one
    /// * `kind` - Visualisation or report chart
    ///
    /// # Returns
    /// * `CacheKey` - Key whose file name is `{SITE}_{32 hex chars}.png`
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use releves_ste::Site;
    /// use releves_ste::cache::{ReportCache, ReportKind};
    ///
    /// let cache = ReportCache::new("cache", Duration::from_secs(3600));
    /// let key = cache.key(Site::Lpz, "pH entrée", Some(10), Some(2025), ReportKind::Report);
    /// assert!(key.file_name().starts_with("LPZ_"));
    /// assert_eq!(key.file_name().len(), "LPZ_".len() + 32 + ".png".len());
    /// ```
    pub fn key(
        &self,
        site: Site,
        parameter: &str,
        week: Option<u32>,
        year: Option<i32>,
        kind: ReportKind,
    ) -> CacheKey {
        let week = week.map(|w| w.to_string()).unwrap_or_default();
        let year = year.map(|y| y.to_string()).unwrap_or_default();
        let material = format!("{}|{}|{}|{}|{}", site.code(), parameter, week, year, kind.as_str());
        let digest = blake3::hash(material.as_bytes()).to_hex();
        CacheKey {
            site,
            digest: digest[..32].to_string(),
        }
    }

    pub fn path_of(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Cached bytes, unless missing or expired.
    pub fn get(&self, key: &CacheKey) -> AppResult<Option<Vec<u8>>> {
        let path = self.path_of(key);
        if !self.is_fresh(&path) {
            return Ok(None);
        }
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.is_fresh(&self.path_of(key))
    }

    pub fn put(&self, key: &CacheKey, png: &[u8]) -> AppResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_of(key), png)?;
        Ok(())
    }

    /// Reads a stored chart by file name, whatever its age. Used to serve the
    /// images a page has just referenced.
    pub fn read_file(&self, file_name: &str) -> AppResult<Vec<u8>> {
        let well_formed = file_name.ends_with(".png")
            && file_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !well_formed || file_name.contains("..") {
            return Err(AppError::NotFound(file_name.to_string()));
        }
        match fs::read(self.dir.join(file_name)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(AppError::NotFound(file_name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Drops every chart of `site`. Returns how many files were removed.
    pub fn invalidate_site(&self, site: Site) -> AppResult<usize> {
        let prefix = format!("{}_", site.code());
        self.remove_where(|name, _| name.starts_with(&prefix))
    }

    /// Drops expired charts. Returns how many files were removed.
    pub fn purge_expired(&self) -> AppResult<usize> {
        self.remove_where(|_, path| !self.is_fresh(path))
    }

    fn is_fresh(&self, path: &Path) -> bool {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        age < self.ttl
    }

    fn remove_where(&self, doomed: impl Fn(&str, &Path) -> bool) -> AppResult<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_file() && doomed(name, &path) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => warn!("Could not remove cached chart {}: {}", path.display(), err),
                }
            }
        }
        debug!("Removed {} cached charts from {}", removed, self.dir.display());
        Ok(removed)
    }
}
