//! Statement checks applied before anything reaches the LRS.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::xapi::{Cmi5Verb, Statement, CMI5_CATEGORY};

static IRI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:[^\s]+$").unwrap()
});

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^P(?:\d+Y)?(?:\d+M)?(?:\d+W)?(?:\d+D)?(?:T(?:\d+H)?(?:\d+M)?(?:\d+(?:\.\d+)?S)?)?$")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("actor has no identifier")]
    MissingActorIdentifier,
    #[error("'{field}' is not an IRI: {value}")]
    NotAnIri { field: &'static str, value: String },
    #[error("scaled score {0} outside [-1, 1]")]
    ScaledOutOfRange(f64),
    #[error("raw score {raw} outside [{min}, {max}]")]
    RawOutOfRange { raw: f64, min: f64, max: f64 },
    #[error("score min {min} is not below max {max}")]
    InvalidScoreBounds { min: f64, max: f64 },
    #[error("duration '{0}' is not ISO 8601")]
    InvalidDuration(String),
    #[error("timestamp {0} is in the future")]
    FutureTimestamp(DateTime<Utc>),
    #[error("cmi5 statement has no registration")]
    MissingRegistration,
    #[error("cmi5 statement lacks the cmi5 category")]
    MissingCmi5Category,
    #[error("verb {0} is not a cmi5 verb")]
    VerbNotAllowed(String),
}

/// Structural xAPI checks. Returns every problem found, not just the first.
pub fn validate_statement(s: &Statement) -> Vec<Violation> {
    let mut out = Vec::new();

    let a = &s.actor;
    if a.account.is_none() && a.mbox.is_none() {
        out.push(Violation::MissingActorIdentifier);
    }
    iri(&mut out, "verb.id", &s.verb.id);
    iri(&mut out, "object.id", &s.object.id);
    if s.timestamp > Utc::now() {
        out.push(Violation::FutureTimestamp(s.timestamp));
    }

    if let Some(result) = &s.result {
        if let Some(score) = &result.score {
            if let Some(scaled) = score.scaled {
                if !(-1.0..=1.0).contains(&scaled) {
                    out.push(Violation::ScaledOutOfRange(scaled));
                }
            }
            if let (Some(min), Some(max)) = (score.min, score.max) {
                if min >= max {
                    out.push(Violation::InvalidScoreBounds { min, max });
                }
            }
            if let Some(raw) = score.raw {
                let min = score.min.unwrap_or(f64::NEG_INFINITY);
                let max = score.max.unwrap_or(f64::INFINITY);
                if raw < min || raw > max {
                    out.push(Violation::RawOutOfRange { raw, min, max });
                }
            }
        }
        if let Some(d) = &result.duration {
            if d == "P" || d.ends_with('T') || !DURATION.is_match(d) {
                out.push(Violation::InvalidDuration(d.clone()));
            }
        }
    }
    out
}

/// xAPI checks plus the cmi5 profile: a registration, the cmi5 category and a
/// cmi5-defined verb.
pub fn validate_cmi5(s: &Statement) -> Vec<Violation> {
    let mut out = validate_statement(s);
    if s.registration().is_none() {
        out.push(Violation::MissingRegistration);
    }
    let categorized = s
        .context
        .as_ref()
        .and_then(|c| c.context_activities.as_ref())
        .and_then(|ca| ca.category.as_ref())
        .is_some_and(|cats| cats.iter().any(|c| c.id == CMI5_CATEGORY));
    if !categorized {
        out.push(Violation::MissingCmi5Category);
    }
    if !Cmi5Verb::from_iri(&s.verb.id).is_some_and(Cmi5Verb::is_cmi5_defined) {
        out.push(Violation::VerbNotAllowed(s.verb.id.clone()));
    }
    out
}

fn iri(out: &mut Vec<Violation>, field: &'static str, value: &str) {
    if !IRI.is_match(value) {
        out.push(Violation::NotAnIri { field, value: value.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::*;
    use crate::xapi::Score;
    use uuid::Uuid;

    const AU: &str = "https://example.com/au/1";

    #[test]
    fn lifecycle_statements_are_valid_cmi5() {
        let reg = Uuid::new_v4();
        let stmts = [
            launched_statement("u", AU, "s", reg).unwrap(),
            initialized_statement("u", AU, "s", reg).unwrap(),
            passed_statement("u", AU, "s", reg, 85.0, "PT30M").unwrap(),
            terminated_statement("u", AU, "s", reg, "PT30M").unwrap(),
        ];
        for s in &stmts {
            assert_eq!(validate_cmi5(s), vec![], "{}", s.verb.id);
        }
    }

    #[test]
    fn score_and_duration_problems_are_all_reported() {
        let mut s = StatementBuilder::new()
            .actor("u")
            .verb(Cmi5Verb::Passed)
            .activity(AU)
            .duration("PT")
            .build()
            .unwrap();
        s.result.get_or_insert_with(Default::default).score =
            Some(Score { scaled: Some(1.5), raw: Some(120.0), min: Some(0.0), max: Some(100.0) });
        let v = validate_statement(&s);
        assert!(v.contains(&Violation::ScaledOutOfRange(1.5)));
        assert!(v.contains(&Violation::RawOutOfRange { raw: 120.0, min: 0.0, max: 100.0 }));
        assert!(v.contains(&Violation::InvalidDuration("PT".into())));
    }

    #[test]
    fn inverted_bounds_and_bad_iris() {
        let mut s = StatementBuilder::new().actor("u").verb(Cmi5Verb::Completed).activity("not an iri").build().unwrap();
        s.result = Some(crate::xapi::StatementResult {
            score: Some(Score { min: Some(10.0), max: Some(10.0), ..Default::default() }),
            ..Default::default()
        });
        let v = validate_statement(&s);
        assert!(v.contains(&Violation::InvalidScoreBounds { min: 10.0, max: 10.0 }));
        assert!(matches!(v.iter().find(|x| matches!(x, Violation::NotAnIri { .. })), Some(Violation::NotAnIri { field: "object.id", .. })));
    }

    #[test]
    fn cmi5_profile_needs_context_and_defined_verb() {
        let s = StatementBuilder::new().actor("u").verb(Cmi5Verb::Progressed).activity(AU).build().unwrap();
        let v = validate_cmi5(&s);
        assert!(v.contains(&Violation::MissingRegistration));
        assert!(v.contains(&Violation::MissingCmi5Category));
        assert!(v.contains(&Violation::VerbNotAllowed(Cmi5Verb::Progressed.iri().into())));
        // still well-formed xAPI
        assert!(validate_statement(&s).is_empty());
    }

    #[test]
    fn future_timestamps_are_rejected() {
        let ahead = Utc::now() + chrono::Duration::minutes(5);
        let s = StatementBuilder::new()
            .actor("u")
            .verb(Cmi5Verb::Completed)
            .activity(AU)
            .timestamp(ahead)
            .build()
            .unwrap();
        assert_eq!(validate_statement(&s), vec![Violation::FutureTimestamp(ahead)]);

        let past = StatementBuilder::new()
            .actor("u")
            .verb(Cmi5Verb::Completed)
            .activity(AU)
            .timestamp(Utc::now() - chrono::Duration::minutes(5))
            .build()
            .unwrap();
        assert!(validate_statement(&past).is_empty());
    }

    #[test]
    fn actor_needs_an_identifier() {
        let mut s = StatementBuilder::new().actor("u").verb(Cmi5Verb::Launched).activity(AU).build().unwrap();
        s.actor.account = None;
        assert_eq!(validate_statement(&s), vec![Violation::MissingActorIdentifier]);
    }
}
