pub mod admin;
pub mod announcements;
pub mod attendance;
pub mod auth;
pub mod config;
pub mod contact;
pub mod err;
pub mod extract;
pub mod files;
pub mod mailer;
pub mod marks;
pub mod models;
pub mod notes;
pub mod password;
pub mod profile;
pub mod seed;
pub mod sessions;
pub mod subjects;

use std::sync::Arc;

use anyhow::Context;
use axum::handler::Handler;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::Config;
use crate::err::{Fine, Maybe, Nothing};
use crate::mailer::Mailer;

pub use crate::err::Error;

pub type Payload<T> = Result<Maybe<T>, Error>;
pub type CookiePayload<T> = Result<([(HeaderName, String); 1], Maybe<T>), Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Nothing(err))
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    message: String,
}

pub fn notice<S: Into<String>>(message: S) -> Payload<Notice> {
    proceeds(Notice {
        message: message.into(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(Config::load()?);
    log::info!("Connecting to database...");
    let pg = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Could not connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pg)
        .await
        .context("Could not run migrations")?;

    if let Some(dir) = &config.seed_dir {
        if let Err(err) = seed::seed_from_dir(&pg, dir).await {
            log::error!("Seeding from {} failed: {:#}", dir, err);
        }
    }
    sessions::spawn_purge_task(pg.clone());

    let mailer = Mailer::from_config(&config.mail);
    let addr = config.bind_addr;
    let app = app(pg, config, mailer)?;

    log::info!("Starting department server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Server shut down");
    Ok(())
}

pub fn app(pg: PgPool, config: Arc<Config>, mailer: Mailer) -> anyhow::Result<Router> {
    let origins = config
        .cors_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin `{}`", origin))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE]);

    let router = Router::new()
        .route("/api/student-login", post(auth::login_student))
        .route("/api/faculty-login", post(auth::login_faculty))
        .route("/api/admin-login", post(auth::login_admin))
        .route("/api/logout", post(auth::logout))
        .route("/api/session", get(auth::session_status))
        .route("/api/current-student", get(auth::current_student))
        .route("/api/profile", get(profile::profile))
        .route(
            "/api/profile/photo",
            get(profile::photo).post(profile::upload_photo),
        )
        .route("/api/change-password", post(password::change_password))
        .route("/api/forgot-password", post(password::forgot_password))
        .route("/api/reset-password", post(password::reset_password))
        .route("/contact", post(contact::contact))
        .route("/api/attendance", post(attendance::submit_attendance))
        .route("/api/attendance/me", get(attendance::my_attendance))
        .route("/api/attendance/subjects", get(attendance::attended_subjects))
        .route("/api/attendance/monthly", get(attendance::monthly_attendance))
        .route(
            "/api/attendance/semester-subjects",
            get(attendance::semester_subjects),
        )
        .route("/api/attendance/alert", post(attendance::send_shortage_alert))
        .route("/api/marks", post(marks::save_marks))
        .route("/api/marks/me", get(marks::my_marks))
        .route("/api/marks/student/:usn", get(marks::student_marks))
        .route("/api/subjects", get(subjects::subjects_by_semester))
        .route(
            "/api/subjects/department/:department/:semester",
            get(subjects::subjects_by_department),
        )
        .route(
            "/api/subjects/faculty",
            get(subjects::faculty_assignments).post(subjects::assign_faculty),
        )
        .route(
            "/api/notes",
            get(notes::list_notes).delete(notes::delete_subject_notes),
        )
        .route("/api/notes/subjects", get(notes::note_subjects))
        .route("/api/notes/upload", post(notes::upload_note))
        .route("/api/notes/file/:id", axum::routing::delete(notes::delete_note))
        .route("/api/notes/file/:id/download", get(notes::download_note))
        .route("/api/notes/file/:id/preview", get(notes::preview_note))
        .route(
            "/api/announcements",
            get(announcements::list_announcements).post(announcements::create_announcement),
        )
        .route(
            "/api/announcements/:id",
            axum::routing::delete(announcements::delete_announcement),
        )
        .route(
            "/api/announcements/:id/file",
            get(announcements::announcement_file),
        )
        .route("/api/timetables", post(files::upload_timetable))
        .route(
            "/api/timetables/:semester/:section",
            get(files::get_timetable),
        )
        .route("/api/admin/student", post(admin::add_student))
        .route(
            "/api/admin/student/:usn",
            get(admin::get_student)
                .put(admin::update_student)
                .delete(admin::delete_student),
        )
        .route("/api/admin/faculty", post(admin::add_faculty))
        .route(
            "/api/admin/faculty/:ssn_id",
            get(admin::get_faculty)
                .put(admin::update_faculty)
                .delete(admin::delete_faculty),
        )
        .route("/api/admin/subject", post(admin::add_subject))
        .fallback(err::handler404.into_service())
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            PRAGMA,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(cors)
        .layer(Extension(pg))
        .layer(Extension(config))
        .layer(Extension(mailer));
    Ok(router)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl+C, shutting down"),
            Err(err) => {
                log::error!("Failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                log::info!("Received terminate signal, shutting down");
            }
            Err(err) => {
                log::error!("Failed to install signal handler: {}", err);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::header::SET_COOKIE;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::mailer::testing::{sender, RecordingTransport};

    fn test_config() -> Arc<Config> {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://localhost/department_test"),
            ("TO_EMAIL", "office@college.edu"),
        ]
        .into_iter()
        .collect();
        Arc::new(Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap())
    }

    fn test_app(transport: Arc<RecordingTransport>) -> Router {
        let config = test_config();
        let pg = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        app(pg, config, Mailer::new(transport, sender())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let app = test_app(Arc::default());
        let response = app.oneshot(get_request("/api/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn protected_routes_need_a_session() {
        for uri in ["/api/attendance/me", "/api/marks/me", "/api/profile", "/api/announcements"] {
            let response = test_app(Arc::default())
                .oneshot(get_request(uri))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }

    #[tokio::test]
    async fn responses_are_not_cached() {
        let response = test_app(Arc::default())
            .oneshot(get_request("/api/session"))
            .await
            .unwrap();
        assert!(response.headers()[CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("no-store"));
    }

    #[tokio::test]
    async fn session_status_without_cookie() {
        let response = test_app(Arc::default())
            .oneshot(get_request("/api/session"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["loggedIn"], false);
        assert!(body.get("user").is_none());
    }

    #[tokio::test]
    async fn logout_clears_cookie_without_session() {
        let response = test_app(Arc::default())
            .oneshot(post_json("/api/logout", Value::Null))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("sid=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn contact_requires_both_fields() {
        let transport = Arc::new(RecordingTransport::default());
        let response = test_app(transport.clone())
            .oneshot(post_json(
                "/contact",
                serde_json::json!({ "email": "visitor@example.com" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn contact_mails_the_inbox_with_reply_to() {
        let transport = Arc::new(RecordingTransport::default());
        let response = test_app(transport.clone())
            .oneshot(post_json(
                "/contact",
                serde_json::json!({ "email": "visitor@example.com", "message": "Hello" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["office@college.edu".to_string()]);
        assert_eq!(sent[0].reply_to.as_deref(), Some("visitor@example.com"));
    }

    #[tokio::test]
    async fn contact_reports_delivery_failure() {
        let transport = Arc::new(RecordingTransport::failing_on(1));
        let response = test_app(transport)
            .oneshot(post_json(
                "/contact",
                serde_json::json!({ "email": "visitor@example.com", "message": "Hello" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Failed to send message. Check server logs.");
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid_payloads() {
        let cases = [
            post_json("/api/student-login", serde_json::json!({})),
            post_json("/contact", serde_json::json!({ "email": 5 })),
            Request::builder()
                .method(Method::POST)
                .uri("/api/faculty-login")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        ];
        for request in cases {
            let uri = request.uri().to_string();
            let response = test_app(Arc::default()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(response.headers()[CONTENT_TYPE], "application/json", "{}", uri);
            let body = json_body(response).await;
            assert_eq!(body["error"], "InvalidPayload", "{}", uri);
            assert!(body["message"].as_str().is_some(), "{}", uri);
        }
    }

    #[tokio::test]
    async fn unparsable_query_is_an_invalid_payload() {
        let response = test_app(Arc::default())
            .oneshot(get_request("/api/subjects?semester=abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "InvalidPayload");
    }
}
