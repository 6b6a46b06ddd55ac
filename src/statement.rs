use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{BuildError, StatementField};
use crate::models::DEFAULT_ACTIVITY_TYPE;
use crate::xapi::*;

pub const DEFAULT_HOME_PAGE: &str = "https://lms.example.com";

/// Accumulates the parts of a statement; `build` checks the required ones.
#[derive(Debug, Clone, Default)]
pub struct StatementBuilder {
    actor: Option<Actor>,
    verb: Option<Verb>,
    object: Option<ActivityObject>,
    result: Option<StatementResult>,
    context: Option<Context>,
    timestamp: Option<DateTime<Utc>>,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learner identified by an account on the default home page.
    pub fn actor(self, user_id: &str) -> Self {
        self.actor_with(Actor::account(user_id, DEFAULT_HOME_PAGE))
    }

    pub fn actor_with(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn verb(mut self, verb: Cmi5Verb) -> Self {
        self.verb = Some(verb.to_verb());
        self
    }

    /// Any verb outside the known vocabulary, e.g. a profile-specific progress verb.
    pub fn custom_verb(mut self, iri: &str, label: &str) -> Self {
        self.verb = Some(Verb {
            id: iri.to_string(),
            display: LanguageMap::from([(DEFAULT_LANG.to_string(), label.to_string())]),
        });
        self
    }

    /// Bare activity reference by id.
    pub fn activity(mut self, id: &str) -> Self {
        self.object = Some(ActivityObject::reference(id));
        self
    }

    pub fn activity_with(mut self, id: &str, name: Option<&str>, description: Option<&str>) -> Self {
        let lang = |s: &str| LanguageMap::from([(DEFAULT_LANG.to_string(), s.to_string())]);
        self.object = Some(ActivityObject {
            id: id.to_string(),
            object_type: "Activity".into(),
            definition: Some(ActivityDefinition {
                activity_type: Some(DEFAULT_ACTIVITY_TYPE.to_string()),
                name: name.map(lang),
                description: description.map(lang),
            }),
        });
        self
    }

    pub fn object(mut self, object: ActivityObject) -> Self {
        self.object = Some(object);
        self
    }

    pub fn result(mut self, result: StatementResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.result.get_or_insert_with(Default::default).success = Some(success);
        self
    }

    pub fn completion(mut self, completion: bool) -> Self {
        self.result.get_or_insert_with(Default::default).completion = Some(completion);
        self
    }

    pub fn duration(mut self, duration: &str) -> Self {
        self.result.get_or_insert_with(Default::default).duration = Some(duration.to_string());
        self
    }

    pub fn response(mut self, response: &str) -> Self {
        self.result.get_or_insert_with(Default::default).response = Some(response.to_string());
        self
    }

    pub fn result_extension(mut self, key: &str, value: Value) -> Self {
        self.result
            .get_or_insert_with(Default::default)
            .extensions
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value);
        self
    }

    /// Raw score on `[min, max]`; `scaled` is derived when the range is non-empty.
    pub fn score(mut self, raw: f64, min: f64, max: f64) -> Self {
        let scaled = (max > min).then(|| (raw - min) / (max - min));
        self.result.get_or_insert_with(Default::default).score =
            Some(Score { scaled, raw: Some(raw), min: Some(min), max: Some(max) });
        self
    }

    /// Registration, session id extension and the cmi5 category.
    pub fn cmi5_context(mut self, session_id: &str, registration: Uuid) -> Self {
        let ctx = self.context.get_or_insert_with(Default::default);
        ctx.registration = Some(registration);
        ctx.extensions
            .get_or_insert_with(Default::default)
            .insert(SESSION_ID_EXTENSION.to_string(), json!(session_id));
        ctx.context_activities
            .get_or_insert_with(Default::default)
            .category = Some(vec![ActivityObject::reference(CMI5_CATEGORY)]);
        self
    }

    /// Groups the statement under its owning course.
    pub fn grouping(mut self, course_id: &str) -> Self {
        let ctx = self.context.get_or_insert_with(Default::default);
        ctx.context_activities
            .get_or_insert_with(Default::default)
            .grouping
            .get_or_insert_with(Vec::new)
            .push(ActivityObject::reference(course_id));
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Fails before any I/O if actor, verb or object is unset. The statement
    /// id is assigned here so that resending the result is idempotent.
    pub fn build(self) -> Result<Statement, BuildError> {
        let mut missing = Vec::new();
        if self.actor.is_none() {
            missing.push(StatementField::Actor);
        }
        if self.verb.is_none() {
            missing.push(StatementField::Verb);
        }
        if self.object.is_none() {
            missing.push(StatementField::Object);
        }
        match (self.actor, self.verb, self.object) {
            (Some(actor), Some(verb), Some(object)) => Ok(Statement {
                id: Uuid::new_v4(),
                actor,
                verb,
                object,
                result: self.result,
                context: self.context,
                timestamp: self.timestamp.unwrap_or_else(Utc::now),
                stored: None,
                version: Some(XAPI_VERSION.to_string()),
            }),
            _ => Err(BuildError::IncompleteStatement { missing }),
        }
    }
}

fn lifecycle(verb: Cmi5Verb, user_id: &str, activity_id: &str, session_id: &str, registration: Uuid) -> StatementBuilder {
    StatementBuilder::new()
        .actor(user_id)
        .verb(verb)
        .activity(activity_id)
        .cmi5_context(session_id, registration)
}

pub fn launched_statement(user_id: &str, activity_id: &str, session_id: &str, registration: Uuid) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Launched, user_id, activity_id, session_id, registration).build()
}

pub fn initialized_statement(user_id: &str, activity_id: &str, session_id: &str, registration: Uuid) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Initialized, user_id, activity_id, session_id, registration).build()
}

pub fn completed_statement(
    user_id: &str,
    activity_id: &str,
    session_id: &str,
    registration: Uuid,
    duration: &str,
) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Completed, user_id, activity_id, session_id, registration)
        .completion(true)
        .duration(duration)
        .build()
}

/// `score` is a raw score out of 100.
pub fn passed_statement(
    user_id: &str,
    activity_id: &str,
    session_id: &str,
    registration: Uuid,
    score: f64,
    duration: &str,
) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Passed, user_id, activity_id, session_id, registration)
        .score(score, 0.0, 100.0)
        .success(true)
        .completion(true)
        .duration(duration)
        .build()
}

pub fn failed_statement(
    user_id: &str,
    activity_id: &str,
    session_id: &str,
    registration: Uuid,
    score: f64,
    duration: &str,
) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Failed, user_id, activity_id, session_id, registration)
        .score(score, 0.0, 100.0)
        .success(false)
        .duration(duration)
        .build()
}

pub fn terminated_statement(
    user_id: &str,
    activity_id: &str,
    session_id: &str,
    registration: Uuid,
    duration: &str,
) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Terminated, user_id, activity_id, session_id, registration)
        .duration(duration)
        .build()
}

pub fn progressed_statement(
    user_id: &str,
    activity_id: &str,
    session_id: &str,
    registration: Uuid,
    percent: u8,
) -> Result<Statement, BuildError> {
    lifecycle(Cmi5Verb::Progressed, user_id, activity_id, session_id, registration)
        .result_extension(PROGRESS_EXTENSION, json!(percent.min(100)))
        .build()
}

/// Whole seconds as an ISO-8601 duration, e.g. `PT1H2M5S`.
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, seconds % 3600 / 60, seconds % 60);
    let mut out = String::from("PT");
    if h > 0 {
        out.push_str(&format!("{h}H"));
    }
    if m > 0 {
        out.push_str(&format!("{m}M"));
    }
    if s > 0 || (h == 0 && m == 0) {
        out.push_str(&format!("{s}S"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const AU: &str = "https://example.com/au/intro";

    #[test]
    fn build_reports_every_missing_part() {
        let err = StatementBuilder::new().verb(Cmi5Verb::Launched).build().unwrap_err();
        assert_eq!(
            err,
            BuildError::IncompleteStatement { missing: vec![StatementField::Actor, StatementField::Object] }
        );
        assert_eq!(err.to_string(), "incomplete statement, missing: actor, object");
    }

    #[test]
    fn each_build_gets_a_fresh_id() {
        let b = StatementBuilder::new().actor("u").verb(Cmi5Verb::Initialized).activity(AU);
        let a = b.clone().build().unwrap();
        let c = b.build().unwrap();
        assert_ne!(a.id, c.id);
        assert_eq!(a.version.as_deref(), Some(XAPI_VERSION));
    }

    #[test]
    fn lifecycle_constructors_fill_required_result_fields() {
        let reg = Uuid::new_v4();

        let launched = launched_statement("u", AU, "s", reg).unwrap();
        assert!(launched.result.is_none());
        assert_eq!(launched.registration(), Some(reg));
        assert_eq!(launched.session_id(), Some("s"));
        let cats = launched.context.as_ref().unwrap().context_activities.as_ref().unwrap();
        assert_eq!(cats.category.as_ref().unwrap()[0].id, CMI5_CATEGORY);

        let completed = completed_statement("u", AU, "s", reg, "PT30M").unwrap();
        let r = completed.result.unwrap();
        assert_eq!((r.completion, r.duration.as_deref()), (Some(true), Some("PT30M")));

        let passed = passed_statement("u", AU, "s", reg, 85.0, "PT30M").unwrap();
        let r = passed.result.unwrap();
        assert_eq!(r.success, Some(true));
        assert_eq!(r.completion, Some(true));
        assert_eq!(r.score.unwrap().scaled, Some(0.85));

        let failed = failed_statement("u", AU, "s", reg, 40.0, "PT10M").unwrap();
        assert_eq!(failed.result.unwrap().success, Some(false));

        let terminated = terminated_statement("u", AU, "s", reg, "PT31M").unwrap();
        assert_eq!(terminated.result.unwrap().duration.as_deref(), Some("PT31M"));
    }

    #[test]
    fn grouping_and_progress_extension() {
        let s = StatementBuilder::new()
            .actor("u")
            .custom_verb("http://adlnet.gov/expapi/verbs/progressed", "progressed")
            .activity_with(AU, Some("Intro"), None)
            .result_extension(PROGRESS_EXTENSION, json!(50))
            .cmi5_context("s", Uuid::new_v4())
            .grouping("https://example.com/course")
            .build()
            .unwrap();
        let ctx = s.context.unwrap().context_activities.unwrap();
        assert_eq!(ctx.grouping.unwrap()[0].id, "https://example.com/course");
        assert_eq!(s.result.unwrap().extensions.unwrap()[PROGRESS_EXTENSION], json!(50));
        assert_eq!(s.object.definition.unwrap().name.unwrap()["en-US"], "Intro");
    }

    #[test]
    fn durations_format_like_iso8601() {
        assert_eq!(format_duration(0), "PT0S");
        assert_eq!(format_duration(1800), "PT30M");
        assert_eq!(format_duration(3725), "PT1H2M5S");
        assert_eq!(format_duration(7200), "PT2H");
    }
}
