use anyhow::{Error, Result};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, env, io, net::SocketAddr, path::Path};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warp::{
    http,
    reply::{self, Reply, Response},
    Filter, Rejection,
};

use promo_ledger::{
    controllers::LedgerController,
    error::LedgerError,
    filters::{self, AdminKey, Unauthorized},
    models::{Config, LedgerConfig, PromoCodeRecord},
    storage::LedgerStore,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ImportRequest {
    content: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct AllocateReply {
    code: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct SummaryReply {
    quiz_id: String,
    total: usize,
    available: usize,
    activated: usize,
    has_available: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct CodesReply {
    quiz_id: String,
    codes: Vec<PromoCodeRecord>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct StatusRequest {
    activated: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct StatusReply {
    updated: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ErrorReply {
    error: ErrorCode,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
enum ErrorCode {
    NotFound,
    NoCodeAvailable,
    EmptyImport,
    InvalidQuizId,
    StorageFailure,
    Unauthorized,
    BadRequest,
    MethodNotAllowed,
    PayloadTooLarge,
}

fn error_response(error: ErrorCode, status: http::StatusCode) -> Response {
    reply::with_status(reply::json(&ErrorReply { error }), status).into_response()
}

fn ledger_error_response(err: &LedgerError) -> Response {
    match err {
        LedgerError::EmptyImport => {
            error_response(ErrorCode::EmptyImport, http::StatusCode::BAD_REQUEST)
        }
        LedgerError::InvalidQuizId { .. } => {
            error_response(ErrorCode::InvalidQuizId, http::StatusCode::BAD_REQUEST)
        }
        LedgerError::NotFound { .. } => {
            error_response(ErrorCode::NotFound, http::StatusCode::NOT_FOUND)
        }
        LedgerError::NoCodeAvailable { .. } => {
            error_response(ErrorCode::NoCodeAvailable, http::StatusCode::CONFLICT)
        }
        LedgerError::Storage(_) | LedgerError::Csv(_) => error_response(
            ErrorCode::StorageFailure,
            http::StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Runs ledger file I/O off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| LedgerError::Storage(io::Error::new(io::ErrorKind::Other, err.to_string())))?
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if err.find::<Unauthorized>().is_some() {
        Ok(error_response(
            ErrorCode::Unauthorized,
            http::StatusCode::UNAUTHORIZED,
        ))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        Ok(error_response(
            ErrorCode::PayloadTooLarge,
            http::StatusCode::PAYLOAD_TOO_LARGE,
        ))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        Ok(error_response(
            ErrorCode::MethodNotAllowed,
            http::StatusCode::METHOD_NOT_ALLOWED,
        ))
    } else if err.is_not_found() {
        Ok(error_response(ErrorCode::NotFound, http::StatusCode::NOT_FOUND))
    } else {
        Ok(error_response(
            ErrorCode::BadRequest,
            http::StatusCode::BAD_REQUEST,
        ))
    }
}

fn routes(
    ledger_controller: LedgerController,
    admin_key: AdminKey,
    max_upload_bytes: u64,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let import = warp::path!("promo" / String)
        .and(warp::put())
        .and(filters::admin(admin_key.clone()))
        .and(filters::json_body(max_upload_bytes))
        .and(filters::with_ledger_controller(ledger_controller.clone()))
        .and_then(
            |quiz_id: String, body: ImportRequest, ledger_controller: LedgerController| async move {
                let report =
                    blocking(move || ledger_controller.import(&quiz_id, &body.content)).await;

                let response = match report {
                    Ok(report) => reply::json(&report).into_response(),
                    Err(err) => ledger_error_response(&err),
                };

                Ok::<_, Rejection>(response)
            },
        );

    let allocate = warp::path!("promo" / String / "allocate")
        .and(warp::post())
        .and(filters::admin(admin_key.clone()))
        .and(filters::with_ledger_controller(ledger_controller.clone()))
        .and_then(
            |quiz_id: String, ledger_controller: LedgerController| async move {
                let code = blocking(move || ledger_controller.try_allocate(&quiz_id)).await;

                let response = match code {
                    Ok(code) => reply::json(&AllocateReply { code }).into_response(),
                    Err(err) => ledger_error_response(&err),
                };

                Ok::<_, Rejection>(response)
            },
        );

    let summary = warp::path!("promo" / String)
        .and(warp::get())
        .and(filters::admin(admin_key.clone()))
        .and(filters::with_ledger_controller(ledger_controller.clone()))
        .and_then(
            |quiz_id: String, ledger_controller: LedgerController| async move {
                let lookup = quiz_id.clone();
                let summary = blocking(move || ledger_controller.summary(&lookup)).await;

                let response = match summary {
                    Ok(Some(summary)) => reply::json(&SummaryReply {
                        quiz_id,
                        total: summary.total,
                        available: summary.available,
                        activated: summary.activated,
                        has_available: summary.available > 0,
                    })
                    .into_response(),
                    Ok(None) => error_response(ErrorCode::NotFound, http::StatusCode::NOT_FOUND),
                    Err(err) => ledger_error_response(&err),
                };

                Ok::<_, Rejection>(response)
            },
        );

    let codes = warp::path!("promo" / String / "codes")
        .and(warp::get())
        .and(filters::admin(admin_key.clone()))
        .and(filters::with_ledger_controller(ledger_controller.clone()))
        .and_then(
            |quiz_id: String, ledger_controller: LedgerController| async move {
                let lookup = quiz_id.clone();
                let ledger = blocking(move || ledger_controller.load(&lookup)).await;

                let response = match ledger {
                    Ok(Some(ledger)) => reply::json(&CodesReply {
                        quiz_id,
                        codes: ledger.records,
                    })
                    .into_response(),
                    Ok(None) => error_response(ErrorCode::NotFound, http::StatusCode::NOT_FOUND),
                    Err(err) => ledger_error_response(&err),
                };

                Ok::<_, Rejection>(response)
            },
        );

    let set_status = warp::path!("promo" / String / "codes" / String)
        .and(warp::put())
        .and(filters::admin(admin_key))
        .and(filters::json_body(max_upload_bytes))
        .and(filters::with_ledger_controller(ledger_controller))
        .and_then(
            |quiz_id: String,
             code: String,
             body: StatusRequest,
             ledger_controller: LedgerController| async move {
                // path params arrive still percent-encoded
                let code = match urlencoding::decode(&code) {
                    Ok(code) => code.into_owned(),
                    Err(_err) => {
                        return Ok::<_, Rejection>(error_response(
                            ErrorCode::BadRequest,
                            http::StatusCode::BAD_REQUEST,
                        ))
                    }
                };

                let updated = blocking(move || {
                    Ok(ledger_controller.set_status(&quiz_id, &code, body.activated))
                })
                .await;

                let response = match updated {
                    Ok(updated) => reply::json(&StatusReply { updated }).into_response(),
                    Err(err) => ledger_error_response(&err),
                };

                Ok::<_, Rejection>(response)
            },
        );

    import
        .or(allocate)
        .or(summary)
        .or(codes)
        .or(set_status)
        .recover(handle_rejection)
}

fn admin_key() -> Result<AdminKey> {
    let key = env::var("ADMIN_KEY")
        .map_err(|err| Error::new(err))
        .and_then(|env| Ok(hex::decode(env.trim())?))
        .or_else(|_err| -> Result<_> {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill(&mut key);

            warn!("No admin key was specified, generated a new admin key.");
            warn!("Rerun with ADMIN_KEY={}", hex::encode(key));

            Ok(key.to_vec())
        })?;

    Ok(AdminKey::new(key))
}

async fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        info!(path, "no ledger config found, using defaults");
        return Ok(Config::default());
    }

    let config = fs::read_to_string(path).await?;
    let config: Config = toml::de::from_str(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("promo_ledger=info")),
        )
        .init();

    let bind_addr = env::var("BIND").unwrap_or_else(|_err| "127.0.0.1:3030".into());
    let bind_addr: SocketAddr = bind_addr.parse()?;

    let cors_origin = env::var("CORS_ORIGIN").unwrap_or_else(|_err| "http://localhost:1313".into());

    let config_path = env::var("LEDGER_CONFIG").unwrap_or_else(|_err| "ledger.toml".into());
    let config = load_config(&config_path).await?;
    let LedgerConfig {
        dir,
        max_upload_bytes,
        ..
    } = config.ledger.clone();

    fs::create_dir_all(&dir).await?;
    info!(dir = %dir.display(), "promo ledger directory ready");

    let ledger_controller = LedgerController::new(LedgerStore::new(&config.ledger));

    let cors = warp::cors()
        .allow_origin(cors_origin.as_str())
        .allow_methods(vec!["GET", "POST", "PUT"])
        .allow_headers(vec!["Authorization", "Content-Type"]);

    let server = routes(ledger_controller, admin_key()?, max_upload_bytes).with(cors);

    info!(%bind_addr, "listening");
    warp::serve(server).run(bind_addr).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TOKEN: &str = "Bearer 0a0b0c";

    fn test_routes(
        dir: &TempDir,
    ) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        test_routes_with_limit(dir, 1024 * 1024)
    }

    fn test_routes_with_limit(
        dir: &TempDir,
        max_upload_bytes: u64,
    ) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        let store = LedgerStore::new(&LedgerConfig {
            dir: dir.path().into(),
            ..Default::default()
        });
        routes(
            LedgerController::new(store),
            AdminKey::new(vec![0x0a, 0x0b, 0x0c]),
            max_upload_bytes,
        )
    }

    fn upload() -> ImportRequest {
        ImportRequest {
            content: "code,owner,activated\nSAVE10,,0\nSAVE20,alice,1\nSAVE30,,0\n".into(),
        }
    }

    fn error_of(body: &[u8]) -> ErrorCode {
        serde_json::from_slice::<ErrorReply>(body).unwrap().error
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        let res = warp::test::request()
            .method("POST")
            .path("/promo/42/allocate")
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(res.body()), ErrorCode::Unauthorized);

        let res = warp::test::request()
            .method("POST")
            .path("/promo/42/allocate")
            .header("Authorization", "Bearer ffffff")
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upload_then_allocate_until_exhausted() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        let res = warp::test::request()
            .method("PUT")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .json(&upload())
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::OK);
        let report: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(report["records"], 3);
        assert_eq!(report["available"], 2);

        let mut allocated = Vec::new();
        for _ in 0..2 {
            let res = warp::test::request()
                .method("POST")
                .path("/promo/42/allocate")
                .header("Authorization", TOKEN)
                .reply(&api)
                .await;
            assert_eq!(res.status(), http::StatusCode::OK);
            let reply: AllocateReply = serde_json::from_slice(res.body()).unwrap();
            allocated.push(reply.code);
        }
        allocated.sort();
        assert_eq!(allocated, vec!["SAVE10", "SAVE30"]);

        let res = warp::test::request()
            .method("POST")
            .path("/promo/42/allocate")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::CONFLICT);
        assert_eq!(error_of(res.body()), ErrorCode::NoCodeAvailable);
    }

    #[tokio::test]
    async fn never_imported_quiz_is_not_found() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        let res = warp::test::request()
            .method("POST")
            .path("/promo/never/allocate")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::NOT_FOUND);
        assert_eq!(error_of(res.body()), ErrorCode::NotFound);

        let res = warp::test::request()
            .method("GET")
            .path("/promo/never")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn header_only_upload_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        let res = warp::test::request()
            .method("PUT")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .json(&ImportRequest {
                content: "code,owner,activated\n".into(),
            })
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::BAD_REQUEST);
        assert_eq!(error_of(res.body()), ErrorCode::EmptyImport);
    }

    #[tokio::test]
    async fn status_override_shows_in_summary_and_codes() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        warp::test::request()
            .method("PUT")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .json(&upload())
            .reply(&api)
            .await;

        let res = warp::test::request()
            .method("PUT")
            .path("/promo/42/codes/SAVE20")
            .header("Authorization", TOKEN)
            .json(&StatusRequest { activated: false })
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::OK);
        let reply: StatusReply = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(reply.updated, 1);

        let res = warp::test::request()
            .method("GET")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        let summary: SummaryReply = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.available, 3);
        assert!(summary.has_available);

        let res = warp::test::request()
            .method("GET")
            .path("/promo/42/codes")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        let codes: CodesReply = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(codes.codes.len(), 3);
        assert_eq!(codes.codes[1].owner, "alice");
        assert!(!codes.codes[1].activated);
    }

    #[tokio::test]
    async fn status_override_decodes_code_segment() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        warp::test::request()
            .method("PUT")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .json(&ImportRequest {
                content: "code,owner,activated\n\"SAVE 10\",,0\nÄ1,,0\nA1,,0\n".into(),
            })
            .reply(&api)
            .await;

        for path in &["/promo/42/codes/SAVE%2010", "/promo/42/codes/%C3%841"] {
            let res = warp::test::request()
                .method("PUT")
                .path(path)
                .header("Authorization", TOKEN)
                .json(&StatusRequest { activated: true })
                .reply(&api)
                .await;
            assert_eq!(res.status(), http::StatusCode::OK);
            let reply: StatusReply = serde_json::from_slice(res.body()).unwrap();
            assert_eq!(reply.updated, 1, "{}", path);
        }

        let res = warp::test::request()
            .method("GET")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        let summary: SummaryReply = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(summary.available, 1);

        let res = warp::test::request()
            .method("PUT")
            .path("/promo/42/codes/%FF")
            .header("Authorization", TOKEN)
            .json(&StatusRequest { activated: true })
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::BAD_REQUEST);
        assert_eq!(error_of(res.body()), ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn oversized_upload_is_payload_too_large() {
        let dir = TempDir::new().unwrap();
        let api = test_routes_with_limit(&dir, 16);

        let res = warp::test::request()
            .method("PUT")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .json(&upload())
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error_of(res.body()), ErrorCode::PayloadTooLarge);
        assert!(!dir.path().join("quiz_42.csv").exists());
    }

    #[tokio::test]
    async fn wrong_method_is_method_not_allowed() {
        let dir = TempDir::new().unwrap();
        let api = test_routes(&dir);

        let res = warp::test::request()
            .method("DELETE")
            .path("/promo/42")
            .header("Authorization", TOKEN)
            .reply(&api)
            .await;
        assert_eq!(res.status(), http::StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_of(res.body()), ErrorCode::MethodNotAllowed);
    }
}
