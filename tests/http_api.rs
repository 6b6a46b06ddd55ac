mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use cmi5_runtime::routes;
use cmi5_runtime::statement::*;
use common::*;

const QUIZ: &str = "https://example.com/au/quiz";
const BOUNDARY: &str = "cmi5-test-boundary";

fn app(h: &Harness) -> Router {
    routes::router(h.state.clone(), h.data_dir.path())
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn upload_req(archive: &[u8], course_id: Option<Uuid>, uploaded_by: Option<Uuid>) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in [("course_id", course_id), ("uploaded_by", uploaded_by)] {
        if let Some(v) = value {
            body.extend_from_slice(
                format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{v}\r\n").as_bytes(),
            );
        }
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"pkg.zip\"\r\n\
             Content-Type: application/zip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(archive);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    Request::builder()
        .method("POST")
        .uri("/api/packages/upload")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn upload(app: &Router) -> Value {
    let (status, body) = send(app, upload_req(&sample_package(), Some(Uuid::new_v4()), Some(Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

fn with_auth(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut().insert("authorization", format!("Basic {token}").parse().unwrap());
    req
}

struct Launched {
    package_id: String,
    registration: Uuid,
    session: String,
    fetch_token: String,
}

async fn launch_quiz(app: &Router, learner: &str) -> Launched {
    let out = upload(app).await;
    let package_id = out["package"]["id"].as_str().unwrap().to_string();
    let (status, body) = send(
        app,
        json_req("POST", "/api/launch", json!({"package_id": package_id, "activity_id": QUIZ, "learner_id": learner})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let d: Value = serde_json::from_slice(&body).unwrap();
    Launched {
        package_id,
        registration: d["registration"].as_str().unwrap().parse().unwrap(),
        session: d["session"]["session_id"].as_str().unwrap().to_string(),
        fetch_token: d["fetch"].as_str().unwrap().rsplit('/').next().unwrap().to_string(),
    }
}

async fn fetch_auth(app: &Router, fetch_token: &str) -> String {
    let (status, body) = send(app, Request::post(format!("/fetch/{fetch_token}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let auth: Value = serde_json::from_slice(&body).unwrap();
    auth["auth-token"].as_str().unwrap().to_string()
}

fn agent(name: &str) -> String {
    let raw = json!({"objectType": "Agent", "account": {"name": name, "homePage": "https://lms.example.com"}}).to_string();
    percent_encoding::utf8_percent_encode(&raw, percent_encoding::NON_ALPHANUMERIC).to_string()
}

fn enc(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[tokio::test]
async fn upload_list_get_and_delete() {
    let h = harness().await;
    let app = app(&h);
    let out = upload(&app).await;
    let id = out["package"]["id"].as_str().unwrap().to_string();
    assert_eq!(out["activities"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, Request::get("/api/packages").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, Request::get(format!("/api/packages/{id}/activities")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let acts: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(acts[1]["activity_uri"], QUIZ);

    let (status, _) = send(&app, Request::get("/content/nothing-here.html").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Request::delete(format!("/api/packages/{id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Request::get(format!("/api/packages/{id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_without_file_or_with_garbage_is_bad_request() {
    let h = harness().await;
    let app = app(&h);
    let (status, _) = send(&app, upload_req(b"garbage", None, Some(Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_without_uploader_is_bad_request() {
    let h = harness().await;
    let app = app(&h);
    let (status, body) = send(&app, upload_req(&sample_package(), Some(Uuid::new_v4()), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("uploaded_by"));

    let (_, body) = send(&app, Request::get("/api/packages").body(Body::empty()).unwrap()).await;
    let listed: Value = serde_json::from_slice(&body).unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn launch_fetch_and_progress_over_http() {
    let h = harness().await;
    let app = app(&h);
    let Launched { package_id, registration, session, fetch_token } = launch_quiz(&app, "learner-1").await;

    let auth = fetch_auth(&app, &fetch_token).await;
    let (status, _) = send(&app, Request::post(format!("/fetch/{fetch_token}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let batch = vec![
        launched_statement("learner-1", QUIZ, &session, registration).unwrap(),
        initialized_statement("learner-1", QUIZ, &session, registration).unwrap(),
        passed_statement("learner-1", QUIZ, &session, registration, 90.0, "PT10M").unwrap(),
    ];
    let req = json_req("POST", "/xapi/statements", serde_json::to_value(&batch).unwrap());
    let (status, body) = send(&app, with_auth(req, &auth)).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let ids: Vec<Uuid> = serde_json::from_slice(&body).unwrap();
    assert_eq!(ids, batch.iter().map(|s| s.id).collect::<Vec<_>>());

    let uri = format!(
        "/api/progress?package_id={package_id}&activity_id={}&learner_id=learner-1&registration={registration}",
        enc(QUIZ)
    );
    let (status, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let report: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["satisfied"], true);
    assert_eq!(report["progress"]["passed"], true);

    let req = Request::get(format!("/xapi/statements?activity={}&agent={}", enc(QUIZ), agent("learner-1")))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, with_auth(req, &auth)).await;
    assert_eq!(status, StatusCode::OK);
    let page: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(page["statements"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn xapi_requires_a_fetched_token_for_its_own_learner() {
    let h = harness().await;
    let app = app(&h);
    let l = launch_quiz(&app, "learner-1").await;
    let stmt = launched_statement("learner-1", QUIZ, &l.session, l.registration).unwrap();
    let body = serde_json::to_value(&stmt).unwrap();

    let (status, _) = send(&app, json_req("POST", "/xapi/statements", body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    // the fetch token itself is not an auth token
    let (status, _) = send(&app, with_auth(json_req("POST", "/xapi/statements", body.clone()), &l.fetch_token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let state_uri = format!("/xapi/activities/state?activityId={}&agent={}&stateId=bookmark", enc(QUIZ), agent("learner-1"));
    let (status, _) = send(&app, Request::get(&state_uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let auth = fetch_auth(&app, &l.fetch_token).await;
    let forged = launched_statement("learner-2", QUIZ, &l.session, l.registration).unwrap();
    let req = json_req("POST", "/xapi/statements", serde_json::to_value(&forged).unwrap());
    let (status, _) = send(&app, with_auth(req, &auth)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let other_state = format!("/xapi/activities/state?activityId={}&agent={}&stateId=bookmark", enc(QUIZ), agent("learner-2"));
    let (status, _) = send(&app, with_auth(json_req("PUT", &other_state, json!({"page": 1})), &auth)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, with_auth(json_req("POST", "/xapi/statements", body), &auth)).await;
    assert_eq!(status, StatusCode::OK);
    let stored = cmi5_runtime::lrs::Lrs::get_statements(h.lrs.as_ref(), None, None, 10).await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn statement_query_filters_by_registration_and_verb() {
    let h = harness().await;
    let app = app(&h);
    let l = launch_quiz(&app, "learner-1").await;
    let auth = fetch_auth(&app, &l.fetch_token).await;
    let earlier = Uuid::new_v4();
    let batch = vec![
        launched_statement("learner-1", QUIZ, "old", earlier).unwrap(),
        passed_statement("learner-1", QUIZ, "old", earlier, 90.0, "PT5M").unwrap(),
        launched_statement("learner-1", QUIZ, &l.session, l.registration).unwrap(),
        initialized_statement("learner-1", QUIZ, &l.session, l.registration).unwrap(),
    ];
    let req = json_req("POST", "/xapi/statements", serde_json::to_value(&batch).unwrap());
    let (status, _) = send(&app, with_auth(req, &auth)).await;
    assert_eq!(status, StatusCode::OK);

    let page = |uri: String| {
        let app = app.clone();
        let auth = auth.clone();
        async move {
            let (status, body) = send(&app, with_auth(Request::get(uri).body(Body::empty()).unwrap(), &auth)).await;
            assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
            let v: Value = serde_json::from_slice(&body).unwrap();
            v["statements"].as_array().unwrap().clone()
        }
    };

    let mine = page(format!("/xapi/statements?registration={}", l.registration)).await;
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|s| s["context"]["registration"] == l.registration.to_string()));

    let passed = page(format!("/xapi/statements?verb={}", enc(cmi5_runtime::xapi::Cmi5Verb::Passed.iri()))).await;
    assert_eq!(passed.len(), 1);
    assert_eq!(passed[0]["context"]["registration"], earlier.to_string());

    // 0 means "as many as the server allows"
    assert_eq!(page("/xapi/statements?limit=0".into()).await.len(), 4);
    assert_eq!(page("/xapi/statements?limit=1".into()).await.len(), 1);
}

#[tokio::test]
async fn statement_put_is_idempotent_and_validated() {
    let h = harness().await;
    let app = app(&h);
    let l = launch_quiz(&app, "learner-1").await;
    let auth = fetch_auth(&app, &l.fetch_token).await;
    let stmt = launched_statement("learner-1", QUIZ, &l.session, l.registration).unwrap();
    let uri = format!("/xapi/statements?statementId={}", stmt.id);
    for _ in 0..2 {
        let (status, _) = send(&app, with_auth(json_req("PUT", &uri, serde_json::to_value(&stmt).unwrap()), &auth)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let stored = cmi5_runtime::lrs::Lrs::get_statements(h.lrs.as_ref(), None, None, 10).await.unwrap();
    assert_eq!(stored.len(), 1);

    let mut bad = serde_json::to_value(&stmt).unwrap();
    bad["result"] = json!({"score": {"scaled": 2.0}});
    let (status, _) = send(&app, with_auth(json_req("PUT", &uri, bad), &auth)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut ahead = launched_statement("learner-1", QUIZ, &l.session, l.registration).unwrap();
    ahead.timestamp = chrono::Utc::now() + chrono::Duration::hours(1);
    let ahead_uri = format!("/xapi/statements?statementId={}", ahead.id);
    let (status, body) = send(&app, with_auth(json_req("PUT", &ahead_uri, serde_json::to_value(&ahead).unwrap()), &auth)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("future"));

    let other = format!("/xapi/statements?statementId={}", Uuid::new_v4());
    let (status, _) = send(&app, with_auth(json_req("PUT", &other, serde_json::to_value(&stmt).unwrap()), &auth)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn activity_state_round_trip() {
    let h = harness().await;
    let app = app(&h);
    let l = launch_quiz(&app, "learner-1").await;
    let auth = fetch_auth(&app, &l.fetch_token).await;
    let uri = format!("/xapi/activities/state?activityId={}&agent={}&stateId=bookmark", enc(QUIZ), agent("learner-1"));

    let (status, _) = send(&app, with_auth(json_req("PUT", &uri, json!({"page": 3})), &auth)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, with_auth(json_req("PUT", &uri, json!({"page": 4})), &auth)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, with_auth(Request::get(&uri).body(Body::empty()).unwrap(), &auth)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"page": 4}));

    let (status, _) = send(&app, with_auth(Request::delete(&uri).body(Body::empty()).unwrap(), &auth)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, with_auth(Request::get(&uri).body(Body::empty()).unwrap(), &auth)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn launch_of_unknown_package_is_not_found() {
    let h = harness().await;
    let app = app(&h);
    let (status, _) = send(
        &app,
        json_req("POST", "/api/launch", json!({"package_id": Uuid::new_v4(), "activity_id": QUIZ, "learner_id": "l"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
