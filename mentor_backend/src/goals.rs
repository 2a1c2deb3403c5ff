use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_GOAL_STATUS: &str = "offen";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub id: i64,
    pub user_id: String,
    pub titel: String,
    pub status: String,
    pub deadline: String,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /goals/{user_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewGoal {
    pub titel: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub deadline: String,
}

fn default_status() -> String {
    DEFAULT_GOAL_STATUS.to_string()
}

impl NewGoal {
    pub fn titled(titel: &str) -> Self {
        Self {
            titel: titel.to_string(),
            status: default_status(),
            deadline: String::new(),
        }
    }

    /// Trimmed copy, or None when the title is blank.
    pub fn normalized(&self) -> Option<Self> {
        let titel = self.titel.trim();
        if titel.is_empty() {
            return None;
        }
        let status = self.status.trim();
        Some(Self {
            titel: titel.to_string(),
            status: if status.is_empty() {
                default_status()
            } else {
                status.to_string()
            },
            deadline: self.deadline.trim().to_string(),
        })
    }
}

pub fn render_goals(goals: &[Goal]) -> String {
    if goals.is_empty() {
        return "Keine offenen Ziele.".to_string();
    }
    goals
        .iter()
        .map(|g| {
            if g.deadline.trim().is_empty() {
                format!("- {} ({})", g.titel, g.status)
            } else {
                format!("- {} ({}, bis {})", g.titel, g.status, g.deadline)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_goal_defaults_status_and_trims() {
        let goal: NewGoal = serde_json::from_str(r#"{"titel": "  10 km laufen "}"#).expect("parse");
        let goal = goal.normalized().expect("valid");
        assert_eq!(goal.titel, "10 km laufen");
        assert_eq!(goal.status, "offen");
        assert!(NewGoal::titled("   ").normalized().is_none());
    }

    #[test]
    fn goals_render_with_optional_deadline() {
        let now = Utc::now();
        let goals = vec![
            Goal {
                id: 1,
                user_id: "u1".into(),
                titel: "Spanisch lernen".into(),
                status: "offen".into(),
                deadline: "31.12.2026".into(),
                created_at: now,
            },
            Goal {
                id: 2,
                user_id: "u1".into(),
                titel: "Mehr schlafen".into(),
                status: "in Arbeit".into(),
                deadline: String::new(),
                created_at: now,
            },
        ];
        assert_eq!(
            render_goals(&goals),
            "- Spanisch lernen (offen, bis 31.12.2026)\n- Mehr schlafen (in Arbeit)"
        );
        assert_eq!(render_goals(&[]), "Keine offenen Ziele.");
    }
}
