use uuid::Uuid;

use crate::error::LrsError;
use crate::lrs::{Lrs, StatementQuery};
use crate::models::{Activity, MoveOn};
use crate::xapi::{Cmi5Verb, Statement};

/// Verbs that can change a [`Progress`]; everything else is skipped at read time.
const PROGRESS_VERBS: [Cmi5Verb; 6] = [
    Cmi5Verb::Launched,
    Cmi5Verb::Completed,
    Cmi5Verb::Passed,
    Cmi5Verb::Failed,
    Cmi5Verb::Waived,
    Cmi5Verb::Terminated,
];

impl MoveOn {
    pub fn is_satisfied(self, completed: bool, passed: bool) -> bool {
        match self {
            MoveOn::Passed => passed,
            MoveOn::Completed => completed,
            MoveOn::CompletedAndPassed => completed && passed,
            MoveOn::CompletedOrPassed => completed || passed,
            MoveOn::NotApplicable => true,
        }
    }
}

/// What a learner's statement history says about one activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Progress {
    pub launched: bool,
    pub completed: bool,
    pub passed: bool,
    pub failed: bool,
    pub waived: bool,
    pub terminated: bool,
}

impl Progress {
    /// Fold a statement history. Flags only ever turn on, so a later `failed`
    /// does not take back an earlier `passed`. A `passed` whose scaled score is
    /// below `mastery_score` is not counted.
    pub fn from_statements<'a>(
        statements: impl IntoIterator<Item = &'a Statement>,
        registration: Option<Uuid>,
        mastery_score: Option<f64>,
    ) -> Self {
        let mut p = Progress::default();
        for s in statements {
            if registration.is_some() && s.registration() != registration {
                continue;
            }
            match Cmi5Verb::from_iri(&s.verb.id) {
                Some(Cmi5Verb::Launched) => p.launched = true,
                Some(Cmi5Verb::Completed) => p.completed = true,
                Some(Cmi5Verb::Passed) => {
                    let scaled = s.result.as_ref().and_then(|r| r.score.as_ref()).and_then(|sc| sc.scaled);
                    match (mastery_score, scaled) {
                        (Some(min), Some(got)) if got < min => {
                            tracing::debug!(statement = %s.id, got, min, "passed below mastery score ignored")
                        }
                        _ => p.passed = true,
                    }
                }
                Some(Cmi5Verb::Failed) => p.failed = true,
                Some(Cmi5Verb::Waived) => p.waived = true,
                Some(Cmi5Verb::Terminated) => p.terminated = true,
                _ => {}
            }
        }
        p
    }

    pub fn satisfies(&self, move_on: MoveOn) -> bool {
        self.waived || move_on.is_satisfied(self.completed, self.passed)
    }
}

/// Read a learner's whole history for `activity` from the LRS and fold it.
/// The read is unbounded so an old `passed` can never age out of view.
pub async fn load_progress(
    lrs: &dyn Lrs,
    activity: &Activity,
    learner_id: &str,
    registration: Option<Uuid>,
) -> Result<Progress, LrsError> {
    let query = StatementQuery {
        activity_id: Some(activity.activity_uri.clone()),
        user_id: Some(learner_id.to_string()),
        registration,
        verbs: PROGRESS_VERBS.iter().map(|v| v.iri().to_string()).collect(),
        limit: None,
    };
    let history = lrs.query_statements(&query).await?;
    Ok(Progress::from_statements(&history, registration, activity.mastery_score))
}
