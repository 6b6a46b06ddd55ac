//! Learning Record Store access.
//!
//! [`Lrs`] is the seam: [`SqlLrs`] keeps statements and state in the runtime's
//! own database, [`HttpLrs`] talks to a remote xAPI endpoint. Neither retries
//! on its own; see [`crate::uploader`] for caller-side retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use uuid::Uuid;

use crate::db::Db;
use crate::error::LrsError;
use crate::xapi::{Actor, Statement, StatementResultPage, XAPI_VERSION};

/// Filters for a statement read. Empty `verbs` matches every verb.
#[derive(Debug, Clone, Default)]
pub struct StatementQuery {
    pub activity_id: Option<String>,
    pub user_id: Option<String>,
    pub registration: Option<Uuid>,
    pub verbs: Vec<String>,
    /// Keep only the newest `limit` matches; `None` reads every match.
    pub limit: Option<u32>,
}

impl StatementQuery {
    pub fn recent(activity_id: Option<&str>, user_id: Option<&str>, limit: u32) -> Self {
        StatementQuery {
            activity_id: activity_id.map(str::to_string),
            user_id: user_id.map(str::to_string),
            limit: Some(limit),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Lrs: Send + Sync {
    /// Store a statement, returning its id. Sending an id that is already
    /// stored is a no-op.
    async fn send_statement(&self, statement: &Statement) -> Result<Uuid, LrsError>;

    /// Statements matching `query`, oldest first.
    async fn query_statements(&self, query: &StatementQuery) -> Result<Vec<Statement>, LrsError>;

    /// The most recent `limit` statements matching the optional filters,
    /// oldest first.
    async fn get_statements(
        &self,
        activity_id: Option<&str>,
        user_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Statement>, LrsError> {
        self.query_statements(&StatementQuery::recent(activity_id, user_id, limit)).await
    }

    async fn set_state(&self, activity_id: &str, user_id: &str, state_id: &str, value: &Value) -> Result<(), LrsError>;

    async fn get_state(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<Option<Value>, LrsError>;

    async fn delete_state(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<(), LrsError>;
}

#[derive(Clone)]
pub struct SqlLrs {
    db: Db,
}

impl SqlLrs {
    pub fn new(db: Db) -> Self {
        SqlLrs { db }
    }
}

#[async_trait]
impl Lrs for SqlLrs {
    async fn send_statement(&self, statement: &Statement) -> Result<Uuid, LrsError> {
        let payload = serde_json::to_string(statement)?;
        let res = sqlx::query(
            r#"
            INSERT INTO statements (id, activity_id, actor_name, verb_id, registration, timestamp_us, stored_at, payload)
            VALUES (?,?,?,?,?,?,?,?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(statement.id)
        .bind(&statement.object.id)
        .bind(statement.actor_name())
        .bind(&statement.verb.id)
        .bind(statement.registration())
        .bind(statement.timestamp.timestamp_micros())
        .bind(Utc::now())
        .bind(payload)
        .execute(&self.db)
        .await?;

        if res.rows_affected() == 0 {
            tracing::debug!(statement = %statement.id, "duplicate statement ignored");
        } else {
            tracing::debug!(statement = %statement.id, verb = %statement.verb.id, "statement stored");
        }
        Ok(statement.id)
    }

    async fn query_statements(&self, query: &StatementQuery) -> Result<Vec<Statement>, LrsError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT payload, stored_at FROM statements WHERE 1=1");
        if let Some(a) = &query.activity_id {
            qb.push(" AND activity_id = ").push_bind(a.clone());
        }
        if let Some(u) = &query.user_id {
            qb.push(" AND actor_name = ").push_bind(u.clone());
        }
        if let Some(r) = query.registration {
            qb.push(" AND registration = ").push_bind(r);
        }
        if !query.verbs.is_empty() {
            qb.push(" AND verb_id IN (");
            let mut list = qb.separated(", ");
            for v in &query.verbs {
                list.push_bind(v.clone());
            }
            list.push_unseparated(")");
        }
        match query.limit {
            Some(limit) => {
                qb.push(" ORDER BY timestamp_us DESC, rowid DESC LIMIT ")
                    .push_bind(i64::from(limit));
            }
            None => {
                qb.push(" ORDER BY timestamp_us ASC, rowid ASC");
            }
        }

        let rows: Vec<(String, DateTime<Utc>)> = qb.build_query_as().fetch_all(&self.db).await?;
        let mut out = rows
            .into_iter()
            .map(|(payload, stored_at)| {
                let mut s: Statement = serde_json::from_str(&payload)?;
                s.stored = Some(stored_at);
                Ok(s)
            })
            .collect::<Result<Vec<_>, LrsError>>()?;
        if query.limit.is_some() {
            out.reverse();
        }
        Ok(out)
    }

    async fn set_state(&self, activity_id: &str, user_id: &str, state_id: &str, value: &Value) -> Result<(), LrsError> {
        sqlx::query(
            r#"
            INSERT INTO activity_state (activity_id, user_id, state_id, value, updated_at)
            VALUES (?,?,?,?,?)
            ON CONFLICT (activity_id, user_id, state_id)
            DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
            "#,
        )
        .bind(activity_id)
        .bind(user_id)
        .bind(state_id)
        .bind(value.to_string())
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_state(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<Option<Value>, LrsError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT value FROM activity_state WHERE activity_id=? AND user_id=? AND state_id=?",
        )
        .bind(activity_id)
        .bind(user_id)
        .bind(state_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(raw.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    async fn delete_state(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<(), LrsError> {
        sqlx::query("DELETE FROM activity_state WHERE activity_id=? AND user_id=? AND state_id=?")
            .bind(activity_id)
            .bind(user_id)
            .bind(state_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Client for a remote xAPI LRS (statements and activity state resources).
#[derive(Clone)]
pub struct HttpLrs {
    client: reqwest::Client,
    endpoint: String,
    home_page: String,
    auth: Option<String>,
}

impl HttpLrs {
    pub fn new(endpoint: impl Into<String>, home_page: impl Into<String>) -> Self {
        HttpLrs {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            home_page: home_page.into(),
            auth: None,
        }
    }

    /// Value for the `Authorization` header, e.g. `Basic ...`.
    pub fn with_auth(mut self, header: impl Into<String>) -> Self {
        self.auth = Some(header.into());
        self
    }

    fn request(&self, method: reqwest::Method, resource: &str) -> reqwest::RequestBuilder {
        self.request_url(method, format!("{}/{}", self.endpoint, resource))
    }

    fn request_url(&self, method: reqwest::Method, url: impl reqwest::IntoUrl) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header("X-Experience-API-Version", XAPI_VERSION);
        if let Some(auth) = &self.auth {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        req
    }

    fn agent(&self, user_id: &str) -> Result<String, LrsError> {
        Ok(serde_json::to_string(&Actor::account(user_id, &self.home_page))?)
    }

    fn state_query(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<Vec<(&'static str, String)>, LrsError> {
        Ok(vec![
            ("activityId", activity_id.to_string()),
            ("agent", self.agent(user_id)?),
            ("stateId", state_id.to_string()),
        ])
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, LrsError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LrsError::Transport(format!("{status}: {body}")));
    }
    Err(LrsError::Rejected { status: status.as_u16(), body })
}

#[async_trait]
impl Lrs for HttpLrs {
    async fn send_statement(&self, statement: &Statement) -> Result<Uuid, LrsError> {
        let resp = self
            .request(reqwest::Method::PUT, "statements")
            .query(&[("statementId", statement.id.to_string())])
            .json(statement)
            .send()
            .await?;
        // 409: id already stored with different content; the original stands
        if resp.status() == StatusCode::CONFLICT {
            tracing::warn!(statement = %statement.id, "remote lrs reports conflicting duplicate");
            return Ok(statement.id);
        }
        check(resp).await?;
        Ok(statement.id)
    }

    async fn query_statements(&self, query: &StatementQuery) -> Result<Vec<Statement>, LrsError> {
        let mut base = vec![("limit", query.limit.unwrap_or(0).to_string())];
        if let Some(a) = &query.activity_id {
            base.push(("activity", a.clone()));
        }
        if let Some(u) = &query.user_id {
            base.push(("agent", self.agent(u)?));
        }
        if let Some(r) = query.registration {
            base.push(("registration", r.to_string()));
        }

        // the statements resource filters on one verb at a time
        let verbs: Vec<Option<&str>> = if query.verbs.is_empty() {
            vec![None]
        } else {
            query.verbs.iter().map(|v| Some(v.as_str())).collect()
        };
        let mut statements = Vec::new();
        for verb in verbs {
            let mut params = base.clone();
            if let Some(v) = verb {
                params.push(("verb", v.to_string()));
            }
            let resp = self.request(reqwest::Method::GET, "statements").query(&params).send().await?;
            let mut page: StatementResultPage = check(resp).await?.json().await?;
            statements.append(&mut page.statements);
            while query.limit.is_none() && !page.more.is_empty() {
                let url = reqwest::Url::parse(&self.endpoint)
                    .and_then(|u| u.join(&page.more))
                    .map_err(|e| LrsError::Transport(format!("bad more link '{}': {e}", page.more)))?;
                let resp = self.request_url(reqwest::Method::GET, url).send().await?;
                page = check(resp).await?.json().await?;
                statements.append(&mut page.statements);
            }
        }

        // xAPI returns newest first
        statements.sort_by_key(|s| s.timestamp);
        if let Some(limit) = query.limit {
            let excess = statements.len().saturating_sub(limit as usize);
            statements.drain(..excess);
        }
        Ok(statements)
    }

    async fn set_state(&self, activity_id: &str, user_id: &str, state_id: &str, value: &Value) -> Result<(), LrsError> {
        let resp = self
            .request(reqwest::Method::PUT, "activities/state")
            .query(&self.state_query(activity_id, user_id, state_id)?)
            .json(value)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn get_state(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<Option<Value>, LrsError> {
        let resp = self
            .request(reqwest::Method::GET, "activities/state")
            .query(&self.state_query(activity_id, user_id, state_id)?)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(resp).await?.json().await?))
    }

    async fn delete_state(&self, activity_id: &str, user_id: &str, state_id: &str) -> Result<(), LrsError> {
        let resp = self
            .request(reqwest::Method::DELETE, "activities/state")
            .query(&self.state_query(activity_id, user_id, state_id)?)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}
