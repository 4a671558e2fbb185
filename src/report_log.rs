//! Log of generated weekly reports (`rapports.json`).

use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::journal::Journal;
use crate::sites::Site;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    #[serde(rename = "semaine")]
    pub week: u32,
    #[serde(rename = "annee")]
    pub year: i32,
    pub site: Site,
    pub timestamp: String,
}

impl ReportEntry {
    fn is(&self, site: Site, week: u32, year: i32) -> bool {
        self.site == site && self.week == week && self.year == year
    }
}

/// One line of the year/week × site table on the report page.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportRow {
    pub year: i32,
    pub week: u32,
    pub cells: Vec<ReportCell>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportCell {
    pub site: Site,
    pub timestamp: Option<String>,
}

pub struct ReportLog {
    journal: Journal<ReportEntry>,
}

impl ReportLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ReportLog {
            journal: Journal::new(path),
        }
    }

    /// Records a report. Returns false when (site, week, year) was already
    /// logged; the first timestamp is kept.
    pub fn record(&self, site: Site, week: u32, year: i32) -> AppResult<bool> {
        self.journal.update(|entries| {
            if entries.iter().any(|e| e.is(site, week, year)) {
                return (false, false);
            }
            entries.push(ReportEntry {
                week,
                year,
                site,
                timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            });
            (true, true)
        })
    }

    /// Entries sorted by (year, week, site).
    pub fn list(&self) -> AppResult<Vec<ReportEntry>> {
        let mut entries = self.journal.read()?;
        entries.sort_by_key(|e| (e.year, e.week, e.site));
        Ok(entries)
    }

    pub fn delete(&self, site: Site, week: u32, year: i32) -> AppResult<bool> {
        self.journal.update(|entries| {
            let before = entries.len();
            entries.retain(|e| !e.is(site, week, year));
            let removed = entries.len() != before;
            (removed, removed)
        })
    }

    /// Every logged (year, week), newest first, with one cell per site.
    pub fn table(&self) -> AppResult<Vec<ReportRow>> {
        let entries = self.journal.read()?;
        let mut periods: Vec<(i32, u32)> = entries.iter().map(|e| (e.year, e.week)).collect();
        periods.sort_unstable_by(|a, b| b.cmp(a));
        periods.dedup();

        Ok(periods
            .into_iter()
            .map(|(year, week)| ReportRow {
                year,
                week,
                cells: Site::ALL
                    .iter()
                    .map(|site| ReportCell {
                        site: *site,
                        timestamp: entries
                            .iter()
                            .find(|e| e.is(*site, week, year))
                            .map(|e| e.timestamp.clone()),
                    })
                    .collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_deduplicates() {
        let dir = TempDir::new().unwrap();
        let log = ReportLog::new(dir.path().join("rapports.json"));
        assert!(log.record(Site::Smp, 12, 2024).unwrap());
        assert!(!log.record(Site::Smp, 12, 2024).unwrap());
        assert!(log.record(Site::Lpz, 12, 2024).unwrap());
        assert_eq!(log.list().unwrap().len(), 2);
    }

    #[test]
    fn list_is_sorted_and_table_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = ReportLog::new(dir.path().join("rapports.json"));
        log.record(Site::Lpz, 3, 2025).unwrap();
        log.record(Site::Smp, 50, 2024).unwrap();
        log.record(Site::Smp, 3, 2025).unwrap();

        let listed: Vec<_> = log.list().unwrap().iter().map(|e| (e.year, e.week, e.site)).collect();
        assert_eq!(listed, vec![(2024, 50, Site::Smp), (2025, 3, Site::Smp), (2025, 3, Site::Lpz)]);

        let table = log.table().unwrap();
        assert_eq!((table[0].year, table[0].week), (2025, 3));
        assert!(table[0].cells.iter().all(|c| c.timestamp.is_some()));
        assert_eq!((table[1].year, table[1].week), (2024, 50));
        assert_eq!(table[1].cells[1].site, Site::Lpz);
        assert!(table[1].cells[1].timestamp.is_none());
    }

    #[test]
    fn delete_matches_all_three_fields() {
        let dir = TempDir::new().unwrap();
        let log = ReportLog::new(dir.path().join("rapports.json"));
        log.record(Site::Smp, 12, 2024).unwrap();
        assert!(!log.delete(Site::Smp, 12, 2023).unwrap());
        assert!(log.delete(Site::Smp, 12, 2024).unwrap());
        assert!(log.list().unwrap().is_empty());
    }

    #[test]
    fn reads_existing_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rapports.json");
        std::fs::write(
            &path,
            r#"[{"semaine": 7, "annee": 2025, "site": "LPZ", "timestamp": "2025-02-14T08:00:00"}]"#,
        )
        .unwrap();
        let log = ReportLog::new(&path);
        assert_eq!(log.list().unwrap()[0].site, Site::Lpz);
    }

    #[test]
    fn mistyped_entry_does_not_wipe_the_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rapports.json");
        std::fs::write(
            &path,
            r#"[
                {"semaine": 7, "annee": 2025, "site": "LPZ", "timestamp": "2025-02-14T08:00:00"},
                {"semaine": 8, "annee": 2025, "site": "SMP", "timestamp": "2025-02-21T08:00:00"},
                {"semaine": "9", "annee": 2025, "site": "SMP", "timestamp": "2025-02-28T08:00:00"}
            ]"#,
        )
        .unwrap();
        let log = ReportLog::new(&path);
        assert!(log.record(Site::Smp, 10, 2025).unwrap());

        let weeks: Vec<_> = log.list().unwrap().iter().map(|e| (e.week, e.site)).collect();
        assert_eq!(weeks, vec![(7, Site::Lpz), (8, Site::Smp), (10, Site::Smp)]);
        let backup = std::fs::read_to_string(dir.path().join("rapports.json.bak")).unwrap();
        assert!(backup.contains(r#""semaine": "9""#));
    }
}
