use chrono::{DateTime, Duration, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::LaunchError;
use crate::lrs::Lrs;
use crate::models::{Activity, LaunchMethod, Session};
use crate::packages::PackageRepo;
use crate::xapi::{Actor, CMI5_CATEGORY, SESSION_ID_EXTENSION};

/// State document the LMS writes before handing off to the AU.
pub const LAUNCH_DATA_STATE: &str = "LMS.LaunchData";

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// xAPI endpoint handed to content.
    pub endpoint: String,
    /// Base URL for `/fetch/<token>`.
    pub fetch_base_url: String,
    /// Base URL under which package storage locations are served.
    pub content_base_url: String,
    pub actor_home_page: String,
    pub token_ttl: Duration,
}

/// Everything a content player needs to start tracking.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchDescriptor {
    pub endpoint: String,
    pub fetch: String,
    pub registration: Uuid,
    pub activity_id: String,
    pub actor: Actor,
    pub launch_url: String,
    pub launch_method: LaunchMethod,
    pub session: Session,
}

/// Optional identity supplied by the caller on relaunch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub session_id: Option<String>,
    pub registration: Option<Uuid>,
}

/// Lifetime of an auth token handed out by `/fetch`.
const AUTH_TOKEN_HOURS: i64 = 12;

#[derive(Debug, Clone)]
struct FetchGrant {
    session_id: String,
    learner_id: String,
    expires_at: DateTime<Utc>,
}

/// What an xAPI auth token lets its holder do: write as one learner.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub session_id: String,
    pub learner_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One-time fetch tokens, exchanged by content for an LRS auth token.
#[derive(Clone, Default)]
pub struct FetchTokens {
    grants: Arc<Mutex<HashMap<String, FetchGrant>>>,
    auth: Arc<Mutex<HashMap<String, AuthGrant>>>,
}

impl FetchTokens {
    pub fn issue(&self, session_id: &str, learner_id: &str, ttl: Duration) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let mut grants = self.grants.lock().unwrap_or_else(|p| p.into_inner());
        grants.retain(|_, g| g.expires_at > now);
        grants.insert(
            token.clone(),
            FetchGrant { session_id: session_id.to_string(), learner_id: learner_id.to_string(), expires_at: now + ttl },
        );
        token
    }

    /// Consume a token, returning an auth token bound to its session and learner.
    pub fn redeem(&self, token: &str) -> Result<String, LaunchError> {
        let grant = self
            .grants
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(token)
            .ok_or(LaunchError::UnknownToken)?;
        let now = Utc::now();
        if grant.expires_at <= now {
            return Err(LaunchError::TokenExpired);
        }

        tracing::debug!(session = %grant.session_id, "fetch token redeemed");
        let auth_token = Uuid::new_v4().simple().to_string();
        let mut auth = self.auth.lock().unwrap_or_else(|p| p.into_inner());
        auth.retain(|_, g| g.expires_at > now);
        auth.insert(
            auth_token.clone(),
            AuthGrant {
                session_id: grant.session_id,
                learner_id: grant.learner_id,
                expires_at: now + Duration::hours(AUTH_TOKEN_HOURS),
            },
        );
        Ok(auth_token)
    }

    /// Resolve an auth token from `/fetch` to the grant it was minted for.
    pub fn authorize(&self, auth_token: &str) -> Result<AuthGrant, LaunchError> {
        let auth = self.auth.lock().unwrap_or_else(|p| p.into_inner());
        let grant = auth.get(auth_token).ok_or(LaunchError::UnknownToken)?;
        if grant.expires_at <= Utc::now() {
            return Err(LaunchError::TokenExpired);
        }
        Ok(grant.clone())
    }
}

#[derive(Clone)]
pub struct LaunchManager {
    packages: PackageRepo,
    lrs: Arc<dyn Lrs>,
    config: LaunchConfig,
    tokens: FetchTokens,
}

impl LaunchManager {
    pub fn new(packages: PackageRepo, lrs: Arc<dyn Lrs>, config: LaunchConfig) -> Self {
        LaunchManager { packages, lrs, config, tokens: FetchTokens::default() }
    }

    pub fn tokens(&self) -> &FetchTokens {
        &self.tokens
    }

    /// Mint session identity and launch parameters for `activity`. A fresh
    /// registration is generated only when the caller does not pass one.
    pub fn get_launch_parameters(
        &self,
        activity: &Activity,
        storage_location: &str,
        learner_id: &str,
        opts: LaunchOptions,
    ) -> LaunchDescriptor {
        let session_id = opts.session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let registration = opts.registration.unwrap_or_else(Uuid::new_v4);
        let token = self.tokens.issue(&session_id, learner_id, self.config.token_ttl);
        let fetch = format!("{}/fetch/{}", self.config.fetch_base_url.trim_end_matches('/'), token);
        let actor = Actor::account(learner_id, &self.config.actor_home_page);

        let content = format!(
            "{}/{}/{}",
            self.config.content_base_url.trim_end_matches('/'),
            storage_location.trim_matches('/'),
            activity.launch_url.trim_start_matches('/')
        );
        let actor_json = serde_json::to_string(&actor).unwrap_or_else(|_| "{}".into());
        let registration_str = registration.to_string();
        let params = [
            ("endpoint", self.config.endpoint.as_str()),
            ("fetch", fetch.as_str()),
            ("registration", registration_str.as_str()),
            ("activityId", activity.activity_uri.as_str()),
            ("actor", actor_json.as_str()),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, NON_ALPHANUMERIC)))
            .collect::<Vec<_>>()
            .join("&");
        let sep = if content.contains('?') { '&' } else { '?' };

        tracing::info!(activity = %activity.activity_uri, learner = learner_id, %registration, "launch issued");
        LaunchDescriptor {
            endpoint: self.config.endpoint.clone(),
            fetch,
            registration,
            activity_id: activity.activity_uri.clone(),
            actor,
            launch_url: format!("{content}{sep}{query}"),
            launch_method: activity.launch_method,
            session: Session {
                learner_id: learner_id.to_string(),
                activity_id: activity.id,
                session_id,
                registration,
            },
        }
    }

    /// Look up the activity, build its launch and record `LMS.LaunchData`.
    /// Fails with a not-found error once the package has been deleted.
    pub async fn launch(
        &self,
        package_id: Uuid,
        activity_uri: &str,
        learner_id: &str,
        opts: LaunchOptions,
    ) -> Result<LaunchDescriptor, LaunchError> {
        let package = self
            .packages
            .get(package_id)
            .await?
            .ok_or(LaunchError::PackageNotFound(package_id))?;
        let activity = self
            .packages
            .activity(package_id, activity_uri)
            .await?
            .ok_or_else(|| LaunchError::ActivityNotFound {
                package: package_id,
                activity: activity_uri.to_string(),
            })?;

        let descriptor = self.get_launch_parameters(&activity, &package.storage_location, learner_id, opts);
        let launch_data = json!({
            "contextTemplate": {
                "contextActivities": {
                    "grouping": [{ "id": package.manifest.course.id }],
                    "category": [{ "id": CMI5_CATEGORY }]
                },
                "extensions": { SESSION_ID_EXTENSION: descriptor.session.session_id }
            },
            "launchMode": "Normal",
            "moveOn": activity.move_on.as_str(),
            "masteryScore": activity.mastery_score,
        });
        self.lrs
            .set_state(&activity.activity_uri, learner_id, LAUNCH_DATA_STATE, &launch_data)
            .await?;
        Ok(descriptor)
    }
}
