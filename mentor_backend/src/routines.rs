use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::database::CoachDatabase;

/// Trailing window for the "repeatedly missed" flag.
const MISS_WINDOW_DAYS: i64 = 35;
const MISS_THRESHOLD: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RoutineError {
    #[error("Routine nicht gefunden")]
    NotFound,
    #[error("Routine gehört weder zu heute noch zu gestern")]
    DayMismatch,
    #[error("Unbekannter Wochentag: {0}")]
    InvalidDay(String),
    #[error("Aufgabe darf nicht leer sein")]
    EmptyTask,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Routine {
    pub id: String,
    pub user_id: String,
    pub task: String,
    /// Canonical English weekday name.
    pub day: String,
    pub time: String,
    pub checked: bool,
    pub last_checked_date: Option<NaiveDate>,
    pub missed_count: i64,
    pub missed_dates: Vec<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Routine {
    pub fn new(user_id: &str, task: &str, day: Weekday, time: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            task: task.to_string(),
            day: weekday_name(day).to_string(),
            time: time.to_string(),
            checked: false,
            last_checked_date: None,
            missed_count: 0,
            missed_dates: Vec::new(),
            created_at: now,
        }
    }

    pub fn weekday(&self) -> Option<Weekday> {
        parse_weekday(&self.day)
    }
}

/// A routine as shown for one concrete day.
#[derive(Debug, Clone, Serialize)]
pub struct RoutineView {
    #[serde(flatten)]
    pub routine: Routine,
    pub date: NaiveDate,
    /// "heute" or "gestern".
    pub display_date: &'static str,
}

/// Body of `POST /routines/{user_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRoutine {
    pub task: String,
    pub day: String,
    #[serde(default)]
    pub time: String,
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn german_weekday(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Montag",
        Weekday::Tue => "Dienstag",
        Weekday::Wed => "Mittwoch",
        Weekday::Thu => "Donnerstag",
        Weekday::Fri => "Freitag",
        Weekday::Sat => "Samstag",
        Weekday::Sun => "Sonntag",
    }
}

/// English or German weekday name, case-insensitive.
pub fn parse_weekday(raw: &str) -> Option<Weekday> {
    let day = match raw.trim().to_lowercase().as_str() {
        "monday" | "montag" => Weekday::Mon,
        "tuesday" | "dienstag" => Weekday::Tue,
        "wednesday" | "mittwoch" => Weekday::Wed,
        "thursday" | "donnerstag" => Weekday::Thu,
        "friday" | "freitag" => Weekday::Fri,
        "saturday" | "samstag" | "sonnabend" => Weekday::Sat,
        "sunday" | "sonntag" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}

/// The most recent slot date of `day` that is at least two days old.
fn latest_closed_slot(day: Weekday, today: NaiveDate) -> NaiveDate {
    let start = today - Duration::days(2);
    let back = (start.weekday().num_days_from_monday() + 7 - day.num_days_from_monday()) % 7;
    start - Duration::days(back as i64)
}

/// The slot date that should now be recorded as missed, if any.
/// Once 48 hours have passed a slot can no longer be checked, so an
/// unchecked slot is final.
pub fn grace_slot(routine: &Routine, today: NaiveDate) -> Option<NaiveDate> {
    let day = routine.weekday()?;
    let slot = latest_closed_slot(day, today);

    let checked_on_slot = routine.checked && routine.last_checked_date == Some(slot);
    let existed = routine.created_at.date_naive() <= slot;
    let untouched_since = routine.last_checked_date.map_or(true, |last| last <= slot);
    let already_recorded = routine.missed_dates.contains(&slot);

    (!checked_on_slot && existed && untouched_since && !already_recorded).then_some(slot)
}

/// Three or more misses within the trailing five weeks.
pub fn repeatedly_missed(routine: &Routine, today: NaiveDate) -> bool {
    let window_start = today - Duration::days(MISS_WINDOW_DAYS);
    routine
        .missed_dates
        .iter()
        .filter(|d| **d > window_start && **d <= today)
        .count()
        >= MISS_THRESHOLD
}

pub fn render_routines_for_chat(views: &[RoutineView]) -> String {
    if views.is_empty() {
        return "Keine Routinen für heute.".to_string();
    }
    views
        .iter()
        .map(|v| {
            let mark = if v.routine.checked { "x" } else { " " };
            let time = if v.routine.time.trim().is_empty() {
                String::new()
            } else {
                format!(", {}", v.routine.time)
            };
            format!("- [{}] {} ({}{})", mark, v.routine.task, v.display_date, time)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_routine_overview(routines: &[Routine]) -> String {
    if routines.is_empty() {
        return "Keine Routinen angelegt.".to_string();
    }
    routines
        .iter()
        .map(|r| {
            let day = r.weekday().map(german_weekday).unwrap_or(r.day.as_str());
            format!(
                "- {}: {} {} (verpasst: {})",
                r.task, day, r.time, r.missed_count
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct RoutineTracker {
    db: Arc<CoachDatabase>,
}

impl RoutineTracker {
    pub fn new(db: Arc<CoachDatabase>) -> Self {
        Self { db }
    }

    /// Today's routines followed by yesterday's unresolved ones.
    /// Falls back to a side-effect-free read of today's routines when the
    /// full read fails.
    pub fn list_routines(&self, user_id: &str, now: DateTime<Utc>) -> anyhow::Result<Vec<RoutineView>> {
        match self.read_and_maintain(user_id, now) {
            Ok(views) => Ok(views),
            Err(e) => {
                tracing::warn!(
                    "Full routine read for {} failed, falling back to today's routines: {:#}",
                    user_id,
                    e
                );
                let today = now.date_naive();
                let routines = self
                    .db
                    .list_routines_for_day(user_id, weekday_name(today.weekday()))?;
                Ok(routines
                    .into_iter()
                    .map(|mut routine| {
                        if routine.last_checked_date != Some(today) {
                            routine.checked = false;
                        }
                        RoutineView {
                            routine,
                            date: today,
                            display_date: "heute",
                        }
                    })
                    .collect())
            }
        }
    }

    fn read_and_maintain(&self, user_id: &str, now: DateTime<Utc>) -> anyhow::Result<Vec<RoutineView>> {
        let today = now.date_naive();
        let yesterday = today - Duration::days(1);
        let mut today_views = Vec::new();
        let mut yesterday_views = Vec::new();

        for mut routine in self.db.list_routines(user_id)? {
            self.record_grace_miss(&mut routine, today)?;

            let Some(day) = routine.weekday() else {
                tracing::warn!("Routine {} has unknown weekday '{}'", routine.id, routine.day);
                continue;
            };

            if day == today.weekday() {
                if routine.last_checked_date != Some(today) {
                    self.db.reset_routine(&routine.id, today)?;
                    routine.checked = false;
                    routine.last_checked_date = Some(today);
                }
                today_views.push(RoutineView {
                    routine,
                    date: today,
                    display_date: "heute",
                });
            } else if day == yesterday.weekday() {
                if routine.checked && routine.last_checked_date == Some(yesterday) {
                    continue;
                }
                routine.checked = false;
                yesterday_views.push(RoutineView {
                    routine,
                    date: yesterday,
                    display_date: "gestern",
                });
            }
        }

        today_views.sort_by(|a, b| a.routine.time.cmp(&b.routine.time));
        yesterday_views.sort_by(|a, b| a.routine.time.cmp(&b.routine.time));
        today_views.extend(yesterday_views);
        Ok(today_views)
    }

    fn record_grace_miss(&self, routine: &mut Routine, today: NaiveDate) -> anyhow::Result<()> {
        if let Some(slot) = grace_slot(routine, today) {
            routine.missed_dates.push(slot);
            routine.missed_dates.sort();
            routine.missed_count += 1;
            self.db
                .set_routine_misses(&routine.id, &routine.missed_dates, routine.missed_count)?;
            tracing::info!("Routine {} missed on {}", routine.id, slot);
        }
        Ok(())
    }

    /// Check or uncheck a routine for today or yesterday.
    pub fn update_routine_status(
        &self,
        user_id: &str,
        routine_id: &str,
        checked: bool,
        now: DateTime<Utc>,
    ) -> Result<Routine, RoutineError> {
        let mut routine = self
            .db
            .get_routine(user_id, routine_id)?
            .ok_or(RoutineError::NotFound)?;

        let day = routine
            .weekday()
            .ok_or_else(|| RoutineError::InvalidDay(routine.day.clone()))?;
        let today = now.date_naive();
        let yesterday = today - Duration::days(1);
        let target = if day == today.weekday() {
            today
        } else if day == yesterday.weekday() {
            yesterday
        } else {
            return Err(RoutineError::DayMismatch);
        };

        self.record_grace_miss(&mut routine, today)?;
        self.db
            .set_routine_checked(user_id, routine_id, checked, target)?;
        routine.checked = checked;
        routine.last_checked_date = Some(target);
        tracing::debug!("Routine {} set checked={} for {}", routine_id, checked, target);
        Ok(routine)
    }

    pub fn create_routine(
        &self,
        user_id: &str,
        new_routine: &NewRoutine,
        now: DateTime<Utc>,
    ) -> Result<Routine, RoutineError> {
        let task = new_routine.task.trim();
        if task.is_empty() {
            return Err(RoutineError::EmptyTask);
        }
        let day = parse_weekday(&new_routine.day)
            .ok_or_else(|| RoutineError::InvalidDay(new_routine.day.clone()))?;
        let routine = Routine::new(user_id, task, day, new_routine.time.trim(), now);
        self.db.insert_routine(&routine)?;
        Ok(routine)
    }

    pub fn delete_routine(&self, user_id: &str, routine_id: &str) -> Result<(), RoutineError> {
        if self.db.delete_routine(user_id, routine_id)? {
            Ok(())
        } else {
            Err(RoutineError::NotFound)
        }
    }

    /// All routines without side effects, for overviews and reviews.
    pub fn all_routines(&self, user_id: &str) -> anyhow::Result<Vec<Routine>> {
        self.db.list_routines(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::shared_database;
    use chrono::TimeZone;

    // Wednesday
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 11, 10, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seeded(day: Weekday, created: DateTime<Utc>) -> (tempfile::TempDir, Arc<CoachDatabase>, Routine) {
        let (dir, db) = shared_database();
        let routine = Routine::new("u1", "Meditieren", day, "07:00", created);
        db.insert_routine(&routine).expect("insert");
        (dir, db, routine)
    }

    #[test]
    fn weekday_names_accept_german_aliases() {
        assert_eq!(parse_weekday("Mittwoch"), Some(Weekday::Wed));
        assert_eq!(parse_weekday("  SUNDAY "), Some(Weekday::Sun));
        assert_eq!(parse_weekday("Funday"), None);
    }

    #[test]
    fn closed_slot_is_at_least_two_days_back() {
        let today = date(2026, 3, 11);
        assert_eq!(latest_closed_slot(Weekday::Mon, today), date(2026, 3, 9));
        assert_eq!(latest_closed_slot(Weekday::Tue, today), date(2026, 3, 3));
        assert_eq!(latest_closed_slot(Weekday::Wed, today), date(2026, 3, 4));
    }

    #[test]
    fn today_read_resets_once_and_is_idempotent() {
        let (_dir, db, routine) = seeded(Weekday::Wed, now() - Duration::days(30));
        db.set_routine_checked("u1", &routine.id, true, date(2026, 3, 4))
            .expect("stale check");
        let tracker = RoutineTracker::new(db.clone());

        let first = tracker.list_routines("u1", now()).expect("first read");
        assert_eq!(first.len(), 1);
        assert!(!first[0].routine.checked);
        assert_eq!(first[0].display_date, "heute");
        let after_first = db.get_routine("u1", &routine.id).expect("get").expect("row");

        let second = tracker.list_routines("u1", now()).expect("second read");
        let after_second = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.last_checked_date, Some(date(2026, 3, 11)));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn checked_today_survives_reads() {
        let (_dir, db, routine) = seeded(Weekday::Wed, now() - Duration::days(1));
        let tracker = RoutineTracker::new(db.clone());
        tracker
            .update_routine_status("u1", &routine.id, true, now())
            .expect("check");
        let views = tracker.list_routines("u1", now()).expect("read");
        assert!(views[0].routine.checked);
    }

    #[test]
    fn yesterday_is_listed_until_checked() {
        let (_dir, db, routine) = seeded(Weekday::Tue, now() - Duration::days(10));
        let tracker = RoutineTracker::new(db.clone());

        let views = tracker.list_routines("u1", now()).expect("read");
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].display_date, "gestern");
        assert_eq!(views[0].date, date(2026, 3, 10));

        tracker
            .update_routine_status("u1", &routine.id, true, now())
            .expect("check yesterday");
        assert!(tracker.list_routines("u1", now()).expect("read").is_empty());
    }

    #[test]
    fn today_comes_before_yesterday() {
        let (_dir, db, _) = seeded(Weekday::Tue, now() - Duration::days(10));
        db.insert_routine(&Routine::new("u1", "Joggen", Weekday::Wed, "18:00", now() - Duration::days(10)))
            .expect("insert");
        let views = RoutineTracker::new(db).list_routines("u1", now()).expect("read");
        let labels: Vec<_> = views.iter().map(|v| v.display_date).collect();
        assert_eq!(labels, vec!["heute", "gestern"]);
    }

    #[test]
    fn cross_day_update_is_rejected_without_mutation() {
        let (_dir, db, routine) = seeded(Weekday::Fri, now() - Duration::days(10));
        let tracker = RoutineTracker::new(db.clone());
        let before = db.get_routine("u1", &routine.id).expect("get").expect("row");

        let err = tracker
            .update_routine_status("u1", &routine.id, true, now())
            .unwrap_err();
        assert!(matches!(err, RoutineError::DayMismatch));
        assert_eq!(err.to_string(), "Routine gehört weder zu heute noch zu gestern");

        let after = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert_eq!(before, after);
    }

    #[test]
    fn unknown_routine_is_not_found() {
        let (_dir, db) = shared_database();
        let err = RoutineTracker::new(db)
            .update_routine_status("u1", "missing", true, now())
            .unwrap_err();
        assert_eq!(err.to_string(), "Routine nicht gefunden");
    }

    #[test]
    fn grace_period_records_one_miss_per_date() {
        let (_dir, db, routine) = seeded(Weekday::Mon, now() - Duration::days(20));
        db.reset_routine(&routine.id, date(2026, 3, 9)).expect("monday read");
        let tracker = RoutineTracker::new(db.clone());

        tracker.list_routines("u1", now()).expect("read");
        tracker.list_routines("u1", now()).expect("read again");
        tracker
            .list_routines("u1", now() + Duration::hours(5))
            .expect("later read");

        let row = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert_eq!(row.missed_dates, vec![date(2026, 3, 9)]);
        assert_eq!(row.missed_count, 1);
    }

    #[test]
    fn checked_slot_is_not_a_miss() {
        let (_dir, db, routine) = seeded(Weekday::Mon, now() - Duration::days(20));
        db.set_routine_checked("u1", &routine.id, true, date(2026, 3, 9))
            .expect("checked monday");
        RoutineTracker::new(db.clone())
            .list_routines("u1", now())
            .expect("read");
        let row = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert!(row.missed_dates.is_empty());
        assert_eq!(row.missed_count, 0);
    }

    #[test]
    fn routine_created_after_slot_is_not_a_miss() {
        let (_dir, db, routine) = seeded(Weekday::Mon, now() - Duration::hours(2));
        RoutineTracker::new(db.clone())
            .list_routines("u1", now())
            .expect("read");
        let row = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert_eq!(row.missed_count, 0);
    }

    #[test]
    fn update_resolves_pending_slot_first() {
        // Tuesday routine, checked today is Tuesday next week: previous Tuesday is closed.
        let tuesday = Utc.with_ymd_and_hms(2026, 3, 17, 9, 0, 0).unwrap();
        let (_dir, db, routine) = seeded(Weekday::Tue, tuesday - Duration::days(30));
        db.reset_routine(&routine.id, date(2026, 3, 10)).expect("last tuesday read");
        let tracker = RoutineTracker::new(db.clone());

        let updated = tracker
            .update_routine_status("u1", &routine.id, true, tuesday)
            .expect("check");
        assert_eq!(updated.missed_dates, vec![date(2026, 3, 10)]);
        let row = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert!(row.checked);
        assert_eq!(row.last_checked_date, Some(date(2026, 3, 17)));
        assert_eq!(row.missed_count, 1);
    }

    #[test]
    fn corrupted_row_falls_back_to_plain_today_read() {
        let (_dir, db, routine) = seeded(Weekday::Wed, now() - Duration::days(3));
        db.insert_routine(&Routine::new("u1", "Lesen", Weekday::Fri, "", now()))
            .expect("insert");
        db.execute_raw("UPDATE routines SET missed_dates = 'kaputt' WHERE day = 'Friday'")
            .expect("corrupt");

        let views = RoutineTracker::new(db.clone())
            .list_routines("u1", now())
            .expect("fallback read");
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].routine.id, routine.id);
        let row = db.get_routine("u1", &routine.id).expect("get").expect("row");
        assert_eq!(row.last_checked_date, None);
    }

    #[test]
    fn create_validates_day_and_task() {
        let (_dir, db) = shared_database();
        let tracker = RoutineTracker::new(db);
        let created = tracker
            .create_routine(
                "u1",
                &NewRoutine {
                    task: " Yoga ".into(),
                    day: "donnerstag".into(),
                    time: "06:30".into(),
                },
                now(),
            )
            .expect("create");
        assert_eq!(created.day, "Thursday");
        assert_eq!(created.task, "Yoga");

        let err = tracker
            .create_routine(
                "u1",
                &NewRoutine {
                    task: "Yoga".into(),
                    day: "Someday".into(),
                    time: String::new(),
                },
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, RoutineError::InvalidDay(_)));
        assert!(matches!(tracker.delete_routine("u1", "nope"), Err(RoutineError::NotFound)));
    }

    #[test]
    fn three_recent_misses_flag_a_routine() {
        let mut routine = Routine::new("u1", "Joggen", Weekday::Mon, "", now());
        routine.missed_dates = vec![date(2026, 1, 5), date(2026, 2, 23), date(2026, 3, 2)];
        assert!(!repeatedly_missed(&routine, date(2026, 3, 11)));
        routine.missed_dates.push(date(2026, 3, 9));
        assert!(repeatedly_missed(&routine, date(2026, 3, 11)));
    }
}
