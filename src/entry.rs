//! Daily entry workflow.
//!
//! An operator fills today's Draft row for a site, possibly over several
//! visits, then validates it. These functions work on an in-memory
//! [`SiteSheet`]; the caller loads and saves it around them.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{Datelike, Days, NaiveDate, Weekday};

use crate::error::AppError;
use crate::sites::MONDAY_ONLY;
use crate::store::{MeasurementRow, SiteSheet, Status, parse_number};

pub const VALIDATED_MESSAGE: &str = "Mesure validée.";
pub const DRAFT_MESSAGE: &str = "Brouillon sauvegardé.";

/// Choices offered when today's reading is already validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertChoice {
    /// Leave everything as is.
    Cancel,
    /// Delete the last validated reading of today.
    Overwrite,
    /// Start a new empty draft for today, unless one exists.
    New,
    /// Turn the last validated reading back into a draft.
    Modify,
}

impl FromStr for AlertChoice {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "annuler" => Ok(AlertChoice::Cancel),
            "ecraser" => Ok(AlertChoice::Overwrite),
            "nouveau" => Ok(AlertChoice::New),
            "modifier" => Ok(AlertChoice::Modify),
            other => Err(AppError::Validation(format!("Choix inconnu : {}", other))),
        }
    }
}

/// Everything the entry form shows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntryView {
    /// Yesterday's validated values.
    pub previous: BTreeMap<String, String>,
    /// Today's draft values.
    pub values: BTreeMap<String, String>,
    /// Today minus yesterday, where computable.
    pub differences: BTreeMap<String, Option<f64>>,
    pub is_monday: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryPage {
    Form(EntryView),
    /// Today is already validated; `reading` is the number the next reading
    /// would get.
    AlreadyValidated { reading: usize },
}

pub fn is_monday(date: NaiveDate) -> bool {
    date.weekday() == Weekday::Mon
}

/// Decides what `/saisie/{site}` shows for `today`.
pub fn prepare(sheet: &SiteSheet, today: NaiveDate) -> EntryPage {
    let measurements = sheet.site.measurements();

    let previous_row = today
        .checked_sub_days(Days::new(1))
        .and_then(|yesterday| sheet.rows_on(yesterday, Status::Validated).last())
        .map(|(_, row)| row);
    let previous: BTreeMap<String, String> = measurements
        .iter()
        .map(|m| {
            let value = previous_row.map(|row| row.value(m).to_string()).unwrap_or_default();
            (m.to_string(), value)
        })
        .collect();

    let values = match sheet.rows_on(today, Status::Draft).next() {
        Some((_, draft)) => draft.values.clone(),
        None => {
            let validated = sheet.rows_on(today, Status::Validated).count();
            if validated > 0 {
                return EntryPage::AlreadyValidated {
                    reading: validated + 1,
                };
            }
            BTreeMap::new()
        }
    };

    let differences = measurements
        .iter()
        .map(|m| {
            let diff = difference(values.get(*m).map(String::as_str), &previous[*m]);
            (m.to_string(), diff)
        })
        .collect();

    EntryPage::Form(EntryView {
        previous,
        values,
        differences,
        is_monday: is_monday(today),
    })
}

/// Today's value minus yesterday's. An empty entry counts as zero; no
/// difference when either side is not a number.
fn difference(today: Option<&str>, yesterday: &str) -> Option<f64> {
    let yesterday = parse_number(yesterday)?;
    let today = match today.map(str::trim) {
        None | Some("") => 0.0,
        Some(text) => parse_number(text)?,
    };
    Some(today - yesterday)
}

/// Applies an alert choice. Returns whether the sheet must be saved.
pub fn apply_choice(sheet: &mut SiteSheet, choice: AlertChoice, today: NaiveDate) -> bool {
    let last_validated = sheet.rows_on(today, Status::Validated).last().map(|(i, _)| i);
    match choice {
        AlertChoice::Cancel => false,
        AlertChoice::Overwrite => {
            if let Some(i) = last_validated {
                sheet.rows.remove(i);
            }
            true
        }
        AlertChoice::New => {
            if sheet.rows_on(today, Status::Draft).next().is_some() {
                return false;
            }
            sheet.rows.push(MeasurementRow::new(today, Status::Draft));
            true
        }
        AlertChoice::Modify => match last_validated {
            Some(i) => {
                sheet.rows[i].status = Status::Draft;
                true
            }
            None => false,
        },
    }
}

/// Stores the submitted form as today's draft and, when `finalize` is set,
/// validates it. Returns the confirmation message.
pub fn submit(
    sheet: &mut SiteSheet,
    today: NaiveDate,
    form: &HashMap<String, String>,
    finalize: bool,
) -> &'static str {
    let monday = is_monday(today);
    let mut values = BTreeMap::new();
    for m in sheet.site.measurements() {
        if MONDAY_ONLY.contains(m) && !monday {
            continue;
        }
        if let Some(value) = form.get(*m).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            values.insert(m.to_string(), value.to_string());
        }
    }

    let existing = sheet.rows_on(today, Status::Draft).next().map(|(i, _)| i);
    let draft = match existing {
        Some(i) => i,
        None => {
            sheet.rows.push(MeasurementRow::new(today, Status::Draft));
            sheet.rows.len() - 1
        }
    };
    sheet.rows[draft].values = values;

    if !finalize {
        return DRAFT_MESSAGE;
    }

    // One validated row per date: the new one replaces earlier readings and
    // stray drafts of the day.
    let mut index = 0;
    sheet.rows.retain(|row| {
        let keep = index == draft || row.date != today;
        index += 1;
        keep
    });
    if let Some(row) = sheet.rows.iter_mut().find(|row| row.date == today) {
        row.status = Status::Validated;
    }
    VALIDATED_MESSAGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::Site;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(date: NaiveDate, status: Status, values: &[(&str, &str)]) -> MeasurementRow {
        let mut row = MeasurementRow::new(date, status);
        for (k, v) in values {
            row.set(k, *v);
        }
        row
    }

    fn form(values: &[(&str, &str)]) -> HashMap<String, String> {
        values.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    // 2024-03-04 is a Monday.
    fn tuesday() -> NaiveDate {
        day(2024, 3, 5)
    }

    #[test]
    fn empty_form_shows_yesterday_and_differences() {
        let mut sheet = SiteSheet::empty(Site::Lpz);
        sheet.rows.push(row(day(2024, 3, 4), Status::Validated, &[("Exhaure 1", "100"), ("CO2", "x")]));
        sheet.rows.push(row(day(2024, 3, 4), Status::Draft, &[("Exhaure 1", "999")]));

        let EntryPage::Form(view) = prepare(&sheet, tuesday()) else {
            panic!("expected the entry form");
        };
        assert_eq!(view.previous["Exhaure 1"], "100");
        assert_eq!(view.previous["Exhaure 2"], "");
        assert_eq!(view.differences["Exhaure 1"], Some(-100.0));
        assert_eq!(view.differences["CO2"], None);
        assert_eq!(view.differences["Exhaure 2"], None);
        assert!(!view.is_monday);
    }

    #[test]
    fn draft_prefills_form() {
        let mut sheet = SiteSheet::empty(Site::Lpz);
        sheet.rows.push(row(day(2024, 3, 4), Status::Validated, &[("Exhaure 1", "100")]));
        sheet.rows.push(row(tuesday(), Status::Draft, &[("Exhaure 1", "130,5")]));

        let EntryPage::Form(view) = prepare(&sheet, tuesday()) else {
            panic!("expected the entry form");
        };
        assert_eq!(view.values["Exhaure 1"], "130,5");
        assert_eq!(view.differences["Exhaure 1"], Some(30.5));
    }

    #[test]
    fn validated_day_raises_alert() {
        let mut sheet = SiteSheet::empty(Site::Smp);
        sheet.rows.push(row(tuesday(), Status::Validated, &[]));
        assert_eq!(prepare(&sheet, tuesday()), EntryPage::AlreadyValidated { reading: 2 });
    }

    #[test]
    fn submit_creates_then_updates_draft() {
        let mut sheet = SiteSheet::empty(Site::Smp);
        let msg = submit(&mut sheet, tuesday(), &form(&[("Exhaure 1", "10"), ("pH entrée", "7.1")]), false);
        assert_eq!(msg, DRAFT_MESSAGE);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].status, Status::Draft);

        submit(&mut sheet, tuesday(), &form(&[("Exhaure 1", "11")]), false);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0].value("Exhaure 1"), "11");
        assert_eq!(sheet.rows[0].value("pH entrée"), "");
    }

    #[test]
    fn monday_only_fields_are_dropped_other_days() {
        let mut sheet = SiteSheet::empty(Site::Smp);
        let fields = form(&[("Coagulant", "4"), ("Eau potable", "12"), ("Floculant", "2")]);

        submit(&mut sheet, tuesday(), &fields, false);
        assert_eq!(sheet.rows[0].value("Coagulant"), "");
        assert_eq!(sheet.rows[0].value("Eau potable"), "");
        assert_eq!(sheet.rows[0].value("Floculant"), "2");

        submit(&mut sheet, day(2024, 3, 4), &fields, false);
        assert_eq!(sheet.rows[1].value("Coagulant"), "4");
    }

    #[test]
    fn finalize_keeps_one_validated_row() {
        let mut sheet = SiteSheet::empty(Site::Smp);
        sheet.rows.push(row(day(2024, 3, 4), Status::Validated, &[("Forage", "1")]));
        sheet.rows.push(row(tuesday(), Status::Validated, &[("Forage", "2")]));
        apply_choice(&mut sheet, AlertChoice::New, tuesday());

        let msg = submit(&mut sheet, tuesday(), &form(&[("Forage", "3")]), true);
        assert_eq!(msg, VALIDATED_MESSAGE);
        let today: Vec<_> = sheet.rows.iter().filter(|r| r.date == tuesday()).collect();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].status, Status::Validated);
        assert_eq!(today[0].value("Forage"), "3");
        assert_eq!(sheet.rows.len(), 2);
    }

    #[test]
    fn alert_choices() {
        let mut sheet = SiteSheet::empty(Site::Lpz);
        sheet.rows.push(row(tuesday(), Status::Validated, &[("CO2", "5")]));

        assert!(!apply_choice(&mut sheet, AlertChoice::Cancel, tuesday()));

        assert!(apply_choice(&mut sheet, AlertChoice::Modify, tuesday()));
        assert_eq!(sheet.rows[0].status, Status::Draft);
        assert!(!apply_choice(&mut sheet, AlertChoice::Modify, tuesday()));

        sheet.rows[0].status = Status::Validated;
        assert!(apply_choice(&mut sheet, AlertChoice::Overwrite, tuesday()));
        assert!(sheet.rows.is_empty());

        assert_eq!("ecraser".parse::<AlertChoice>().unwrap(), AlertChoice::Overwrite);
        assert!("supprimer".parse::<AlertChoice>().is_err());
    }

    #[test]
    fn new_draft_is_added_once() {
        let mut sheet = SiteSheet::empty(Site::Smp);
        sheet.rows.push(row(tuesday(), Status::Validated, &[("Forage", "3")]));

        assert!(apply_choice(&mut sheet, AlertChoice::New, tuesday()));
        assert!(!apply_choice(&mut sheet, AlertChoice::New, tuesday()));
        assert_eq!(sheet.rows_on(tuesday(), Status::Draft).count(), 1);
        assert_eq!(sheet.rows.len(), 2);
    }
}
