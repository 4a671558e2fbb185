/*!
# Relevés STE

Daily readings, charts and weekly reports for the SMP and LPZ wastewater
treatment plants, served as a small web application.

## Overview

Operators enter the day's readings for a site, first as a draft and then as
a validated row. Validated rows feed the charts shown on the visualisation
page and the weekly reports. Once a month the flow-meter displays are
photographed and filed in the "relevé du 20" log.

## Architecture

### Web layer (`web` feature)
- **Technologies**: axum, handlebars templates, tokio
- Access codes open a session whose role gates each group of routes
- Chart and PDF rendering run on the blocking pool

### Domain layer
- **sites**: the two plants, their measurements and how each one is charted
- **entry**: daily entry workflow (draft, validation, alert choices)
- **chart**: series preparation and PNG rendering with plotters
- **report**, **pdf**: weekly chart grids and their PDF export
- **photo_log**, **report_log**: JSON logs of photos and generated reports

### Data persistence layer
- **store**: one workbook sheet per site, read with calamine and written
  with rust_xlsxwriter
- **cache**: rendered charts on disk, keyed by a blake3 hash of the request
- **journal**: locked, atomically rewritten JSON files

## Roles

| Role        | Code | Pages                                        |
|-------------|------|----------------------------------------------|
| Opérateur   | 12   | entry, visualisation                         |
| Releveur    | 13   | the above plus the monthly photo log         |
| Responsable | 14   | everything, including reports and the workbook |
*/

pub mod cache;
pub mod chart;
pub mod config;
pub mod downloader;
pub mod entry;
pub mod error;
pub mod journal;
pub mod logging;
pub mod login;
pub mod params;
pub mod pdf;
pub mod photo_log;
pub mod report;
pub mod report_log;
pub mod sites;
pub mod store;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod templates;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use sites::Site;
pub use store::{MeasurementStore, SiteSheet, Status};
