//! Static schema of the two treatment plants.
//!
//! Each site has its own ordered list of measurements (the workbook columns
//! after `Date` and `Statut`), a subset of cumulative counters, a subset of
//! directly read parameters and the flow meters photographed every month.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const SMP_MEASUREMENTS: &[&str] = &[
    "Exhaure 1",
    "Exhaure 2",
    "Exhaure 3",
    "Exhaure 4",
    "Retour dessableur",
    "Retour Orage",
    "Rejet à l'Arc",
    "Surpresseur 4 pompes",
    "Surpresseur 7 pompes",
    "Entrée STE CAB",
    "Alimentation CAB",
    "Eau potable",
    "Forage",
    "Boue STE",
    "Boue STE CAB",
    "pH entrée",
    "pH sortie",
    "Température entrée",
    "Température sortie",
    "Conductivité sortie",
    "MES entrée",
    "MES sortie",
    "Coagulant",
    "Floculant",
    "CO2",
];

const LPZ_MEASUREMENTS: &[&str] = &[
    "Exhaure 1",
    "Exhaure 2",
    "Retour dessableur",
    "Surpresseur BP",
    "Surpresseur HP",
    "Rejet à l'Arc",
    "Entrée STE CAB",
    "Alimentation CAB",
    "Eau de montagne",
    "Boue STE",
    "Boue STE CAB",
    "pH entrée",
    "pH sortie",
    "Température entrée",
    "Température sortie",
    "Conductivité sortie",
    "MES entrée",
    "MES sortie",
    "Coagulant",
    "Floculant",
    "CO2",
];

const DIRECT_PARAMETERS: &[&str] = &[
    "Boue STE",
    "Boue STE CAB",
    "pH entrée",
    "pH sortie",
    "Température entrée",
    "Température sortie",
    "Conductivité sortie",
    "MES entrée",
    "MES sortie",
    "CO2",
];

const SMP_FLOW_METERS: &[&str] = &[
    "Exhaure 1",
    "Exhaure 2",
    "Exhaure 3",
    "Exhaure 4",
    "Retour dessableur",
    "Retour Orage",
];

const LPZ_FLOW_METERS: &[&str] = &["Exhaure 1", "Retour dessableur"];

/// Fields only read on Mondays; any other day they are stored empty.
pub const MONDAY_ONLY: &[&str] = &["Coagulant", "Eau potable"];

/// Parameters charted as one Monday reading per week.
const WEEKLY_DOSAGE: &[&str] = &["Coagulant", "Eau potable"];

/// Parameters charted as a weekly sum of daily readings.
const WEEKLY_AGGREGATE: &[&str] = &["Floculant"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Site {
    #[serde(rename = "SMP")]
    Smp,
    #[serde(rename = "LPZ")]
    Lpz,
}

/// The four plot shapes a parameter can be drawn with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartShape {
    /// Monday value per ISO week.
    WeeklyDosage,
    /// Sum of the daily values per ISO week.
    WeeklyAggregate,
    /// Day-to-day difference of a cumulative counter.
    DailyDelta,
    /// Daily value as read.
    DailyRaw,
}

impl ChartShape {
    pub fn is_weekly(self) -> bool {
        matches!(self, ChartShape::WeeklyDosage | ChartShape::WeeklyAggregate)
    }
}

impl Site {
    pub const ALL: [Site; 2] = [Site::Smp, Site::Lpz];

    pub fn code(self) -> &'static str {
        match self {
            Site::Smp => "SMP",
            Site::Lpz => "LPZ",
        }
    }

    /// Workbook columns after `Date` and `Statut`, in order.
    pub fn measurements(self) -> &'static [&'static str] {
        match self {
            Site::Smp => SMP_MEASUREMENTS,
            Site::Lpz => LPZ_MEASUREMENTS,
        }
    }

    /// Cumulative index counters, charted as daily deltas.
    pub fn counters(self) -> &'static [&'static str] {
        match self {
            Site::Smp => &SMP_MEASUREMENTS[..13],
            Site::Lpz => &LPZ_MEASUREMENTS[..9],
        }
    }

    pub fn direct_parameters(self) -> &'static [&'static str] {
        DIRECT_PARAMETERS
    }

    pub fn flow_meters(self) -> &'static [&'static str] {
        match self {
            Site::Smp => SMP_FLOW_METERS,
            Site::Lpz => LPZ_FLOW_METERS,
        }
    }

    pub fn has_measurement(self, name: &str) -> bool {
        self.measurements().contains(&name)
    }

    /// Shape used on the visualisation page. Anything that is not a weekly
    /// parameter or a counter is drawn as read.
    pub fn chart_shape(self, parameter: &str) -> ChartShape {
        if WEEKLY_DOSAGE.contains(&parameter) {
            ChartShape::WeeklyDosage
        } else if WEEKLY_AGGREGATE.contains(&parameter) {
            ChartShape::WeeklyAggregate
        } else if self.counters().contains(&parameter) {
            ChartShape::DailyDelta
        } else {
            ChartShape::DailyRaw
        }
    }

    /// Shape used in weekly reports, where only direct parameters are drawn
    /// as read and anything unclassified is left out.
    pub fn report_shape(self, parameter: &str) -> Option<ChartShape> {
        match self.chart_shape(parameter) {
            ChartShape::DailyRaw if !self.direct_parameters().contains(&parameter) => None,
            shape => Some(shape),
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Site {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "SMP" => Ok(Site::Smp),
            "LPZ" => Ok(Site::Lpz),
            other => Err(AppError::UnknownSite(other.to_string())),
        }
    }
}

/// Form-field and file-name friendly version of a name (`Exhaure 1` →
/// `Exhaure_1`).
pub fn slug(name: &str) -> String {
    name.replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_site_codes() {
        assert_eq!("SMP".parse::<Site>().unwrap(), Site::Smp);
        assert_eq!(" LPZ ".parse::<Site>().unwrap(), Site::Lpz);
        assert!(matches!("XYZ".parse::<Site>(), Err(AppError::UnknownSite(_))));
    }

    #[test]
    fn counters_stop_before_sludge() {
        assert_eq!(Site::Smp.counters().last(), Some(&"Forage"));
        assert_eq!(Site::Lpz.counters().last(), Some(&"Eau de montagne"));
        assert_eq!(Site::Smp.measurements().len(), 25);
        assert_eq!(Site::Lpz.measurements().len(), 21);
    }

    #[test]
    fn weekly_parameters_win_over_counters() {
        // "Eau potable" is also an SMP counter.
        assert_eq!(Site::Smp.chart_shape("Eau potable"), ChartShape::WeeklyDosage);
        assert_eq!(Site::Lpz.chart_shape("Coagulant"), ChartShape::WeeklyDosage);
        assert_eq!(Site::Smp.chart_shape("Floculant"), ChartShape::WeeklyAggregate);
        assert_eq!(Site::Smp.chart_shape("Exhaure 3"), ChartShape::DailyDelta);
        assert_eq!(Site::Lpz.chart_shape("pH sortie"), ChartShape::DailyRaw);
    }

    #[test]
    fn reports_skip_unclassified_parameters() {
        assert_eq!(Site::Lpz.report_shape("MES entrée"), Some(ChartShape::DailyRaw));
        assert_eq!(Site::Lpz.report_shape("Forage"), None);
        for site in Site::ALL {
            for name in site.measurements() {
                assert!(site.report_shape(name).is_some(), "{site} {name}");
            }
        }
    }

    #[test]
    fn slugs_replace_spaces() {
        assert_eq!(slug("Retour dessableur"), "Retour_dessableur");
    }
}
