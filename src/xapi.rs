//! xAPI statement wire model.
//!
//! Field names and nesting follow xAPI 1.0.3 so statements round-trip with any
//! conformant LRS. Open-ended parts (result/context extensions) stay as JSON maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const XAPI_VERSION: &str = "1.0.3";
pub const CMI5_CATEGORY: &str = "https://w3id.org/xapi/cmi5/context/categories/cmi5";
pub const SESSION_ID_EXTENSION: &str = "https://w3id.org/xapi/cmi5/context/extensions/sessionid";
pub const PROGRESS_EXTENSION: &str = "https://w3id.org/xapi/cmi5/result/extensions/progress";
pub const DEFAULT_LANG: &str = "en-US";

pub type LanguageMap = BTreeMap<String, String>;
pub type Extensions = Map<String, Value>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub actor: Actor,
    pub verb: Verb,
    pub object: ActivityObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StatementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Statement {
    pub fn verb_is(&self, verb: Cmi5Verb) -> bool {
        self.verb.id == verb.iri()
    }

    pub fn registration(&self) -> Option<Uuid> {
        self.context.as_ref().and_then(|c| c.registration)
    }

    pub fn actor_name(&self) -> Option<&str> {
        self.actor.account.as_ref().map(|a| a.name.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.extensions.as_ref())
            .and_then(|e| e.get(SESSION_ID_EXTENSION))
            .and_then(Value::as_str)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default = "agent_type")]
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
}

impl Actor {
    pub fn account(name: impl Into<String>, home_page: impl Into<String>) -> Self {
        Actor {
            object_type: agent_type(),
            name: None,
            mbox: None,
            account: Some(Account { name: name.into(), home_page: home_page.into() }),
        }
    }
}

fn agent_type() -> String {
    "Agent".into()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub name: String,
    pub home_page: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Verb {
    pub id: String,
    #[serde(default)]
    pub display: LanguageMap,
}

impl Verb {
    pub fn label(&self) -> Option<&str> {
        self.display
            .get(DEFAULT_LANG)
            .or_else(|| self.display.values().next())
            .map(String::as_str)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityObject {
    pub id: String,
    #[serde(default = "activity_type")]
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<ActivityDefinition>,
}

impl ActivityObject {
    pub fn reference(id: impl Into<String>) -> Self {
        ActivityObject { id: id.into(), object_type: activity_type(), definition: None }
    }
}

fn activity_type() -> String {
    "Activity".into()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ActivityDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<LanguageMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<LanguageMap>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StatementResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// ISO-8601 duration, e.g. `PT30M`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Score {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaled: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_activities: Option<ContextActivities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Extensions>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ContextActivities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Vec<ActivityObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping: Option<Vec<ActivityObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Vec<ActivityObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<Vec<ActivityObject>>,
}

/// Verbs the runtime knows how to build and interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmi5Verb {
    Launched,
    Initialized,
    Completed,
    Passed,
    Failed,
    Terminated,
    Progressed,
    Suspended,
    Resumed,
    Abandoned,
    Waived,
    Satisfied,
}

impl Cmi5Verb {
    pub const ALL: [Cmi5Verb; 12] = [
        Cmi5Verb::Launched,
        Cmi5Verb::Initialized,
        Cmi5Verb::Completed,
        Cmi5Verb::Passed,
        Cmi5Verb::Failed,
        Cmi5Verb::Terminated,
        Cmi5Verb::Progressed,
        Cmi5Verb::Suspended,
        Cmi5Verb::Resumed,
        Cmi5Verb::Abandoned,
        Cmi5Verb::Waived,
        Cmi5Verb::Satisfied,
    ];

    pub fn iri(self) -> &'static str {
        match self {
            Cmi5Verb::Launched => "http://adlnet.gov/expapi/verbs/launched",
            Cmi5Verb::Initialized => "http://adlnet.gov/expapi/verbs/initialized",
            Cmi5Verb::Completed => "http://adlnet.gov/expapi/verbs/completed",
            Cmi5Verb::Passed => "http://adlnet.gov/expapi/verbs/passed",
            Cmi5Verb::Failed => "http://adlnet.gov/expapi/verbs/failed",
            Cmi5Verb::Terminated => "http://adlnet.gov/expapi/verbs/terminated",
            Cmi5Verb::Progressed => "http://adlnet.gov/expapi/verbs/progressed",
            Cmi5Verb::Suspended => "http://adlnet.gov/expapi/verbs/suspended",
            Cmi5Verb::Resumed => "http://adlnet.gov/expapi/verbs/resumed",
            Cmi5Verb::Abandoned => "https://w3id.org/xapi/adl/verbs/abandoned",
            Cmi5Verb::Waived => "https://w3id.org/xapi/adl/verbs/waived",
            Cmi5Verb::Satisfied => "https://w3id.org/xapi/adl/verbs/satisfied",
        }
    }

    pub fn label(self) -> &'static str {
        self.iri().rsplit('/').next().unwrap_or_default()
    }

    pub fn from_iri(iri: &str) -> Option<Self> {
        Cmi5Verb::ALL.into_iter().find(|v| v.iri() == iri)
    }

    /// Verbs allowed in a statement made under cmi5 rules (progress reporting excluded).
    pub fn is_cmi5_defined(self) -> bool {
        !matches!(self, Cmi5Verb::Progressed | Cmi5Verb::Suspended | Cmi5Verb::Resumed)
    }

    pub fn to_verb(self) -> Verb {
        Verb {
            id: self.iri().to_string(),
            display: BTreeMap::from([(DEFAULT_LANG.to_string(), self.label().to_string())]),
        }
    }
}

/// Wrapper used by `GET /statements` responses.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StatementResultPage {
    pub statements: Vec<Statement>,
    #[serde(default)]
    pub more: String,
}
