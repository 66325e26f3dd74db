use crate::config::AppConfig;
use crate::error::AppError;
use crate::jobs::{self, ScanRequest, TaskStore};
use crate::store::Store;
use crate::stores::sqlite::SqliteStore;
use actix_files::NamedFile;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 20;
const DEFAULT_SEARCH_LIMIT: u32 = 20;

#[derive(Serialize, Debug)]
struct ScanAccepted {
    task_id: Uuid,
    status: jobs::ScanStatus,
}

#[derive(Deserialize, Debug)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct SearchRequest {
    query: String,
    limit: Option<u32>,
}

#[derive(Serialize, Debug)]
struct StatsResponse {
    total_photos: i64,
    total_analyses: i64,
    models_used: i64,
    model: String,
    active_tasks: usize,
}

async fn index(config: web::Data<AppConfig>) -> Result<NamedFile, AppError> {
    let index = Path::new(&config.static_directory).join("index.html");
    NamedFile::open_async(&index).await.map_err(|e| {
        log::error!("Error serving {:?}: {}", index, e);
        AppError::Io(e)
    })
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn start_scan(
    config: web::Data<AppConfig>,
    store: web::Data<SqliteStore>,
    tasks: web::Data<TaskStore>,
    shutdown: web::Data<CancellationToken>,
    request: web::Json<ScanRequest>,
) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();
    log::debug!("Received scan request: {:?}", request);
    if !Path::new(&request.directory).is_dir() {
        return Err(AppError::InvalidRequest(format!(
            "directory not found: {}",
            request.directory
        )));
    }
    // Reject bad limits before a task exists for them.
    request.scheduler(&config)?;

    let task = tasks.create(request);
    log::info!("Started scan task {} for {}", task.task_id, task.request.directory);
    actix_web::rt::spawn(jobs::run_scan_job(
        config.into_inner(),
        store.into_inner(),
        tasks.into_inner(),
        task.task_id,
        shutdown.child_token(),
    ));

    Ok(HttpResponse::Accepted().json(ScanAccepted {
        task_id: task.task_id,
        status: task.status,
    }))
}

async fn get_scan(
    path: web::Path<String>,
    tasks: web::Data<TaskStore>,
) -> Result<HttpResponse, AppError> {
    let raw = path.into_inner();
    let task_id = Uuid::parse_str(&raw)
        .map_err(|_| AppError::NotFound(format!("scan task {}", raw)))?;
    let task = tasks
        .get(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("scan task {}", task_id)))?;
    Ok(HttpResponse::Ok().json(task))
}

async fn list_scans(
    query: web::Query<ListQuery>,
    tasks: web::Data<TaskStore>,
) -> Result<HttpResponse, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(HttpResponse::Ok().json(tasks.list(limit)))
}

async fn search(
    store: web::Data<SqliteStore>,
    request: web::Json<SearchRequest>,
) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();
    if request.query.trim().is_empty() {
        return Err(AppError::InvalidRequest("query must not be empty".into()));
    }
    let hits = store
        .search(&request.query, request.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
        .await?;
    log::debug!("Search for {:?} returned {} hits", request.query, hits.len());
    Ok(HttpResponse::Ok().json(hits))
}

async fn stats(
    config: web::Data<AppConfig>,
    store: web::Data<SqliteStore>,
    tasks: web::Data<TaskStore>,
) -> Result<HttpResponse, AppError> {
    let stats = store.stats().await?;
    let active_tasks = tasks
        .list(usize::MAX)
        .iter()
        .filter(|task| !task.status.is_finished())
        .count();
    Ok(HttpResponse::Ok().json(StatsResponse {
        total_photos: stats.total_photos,
        total_analyses: stats.total_analyses,
        models_used: stats.models_used,
        model: config.model.clone(),
        active_tasks,
    }))
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/health").route(web::get().to(health)))
        .service(
            web::resource("/api/scan")
                .route(web::post().to(start_scan))
                .route(web::get().to(list_scans)),
        )
        .service(web::resource("/api/scan/{id}").route(web::get().to(get_scan)))
        .service(web::resource("/api/search").route(web::post().to(search)))
        .service(web::resource("/api/stats").route(web::get().to(stats)));
}

pub async fn start_web_server(
    config: Arc<AppConfig>,
    store: Arc<SqliteStore>,
) -> std::io::Result<()> {
    let port = config.web_port;
    let static_directory = config.static_directory.clone();
    let tasks = Arc::new(TaskStore::new(config.task_retention.clone()));
    let shutdown = CancellationToken::new();

    let config_data = web::Data::from(config);
    let store_data = web::Data::from(store);
    let tasks_data = web::Data::from(tasks);
    let shutdown_data = web::Data::new(shutdown.clone());

    log::info!("Starting web server on port: {}", port);
    log::debug!("Serving static files from {} directory.", static_directory);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .app_data(store_data.clone())
            .app_data(tasks_data.clone())
            .app_data(shutdown_data.clone())
            .configure(routes)
            .service(actix_files::Files::new("/static", &static_directory))
            .default_service(web::to(index))
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await;

    // Stop any scans still running once the server is down.
    shutdown.cancel();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskRetentionConfig;
    use crate::metadata::AnalysisResult;
    use actix_web::http::StatusCode;
    use actix_web::test;

    struct Fixture {
        config: web::Data<AppConfig>,
        store: web::Data<SqliteStore>,
        tasks: web::Data<TaskStore>,
        shutdown: web::Data<CancellationToken>,
    }

    async fn fixture() -> Fixture {
        Fixture {
            config: web::Data::new(AppConfig::default()),
            store: web::Data::new(SqliteStore::open_in_memory().await.unwrap()),
            tasks: web::Data::new(TaskStore::new(TaskRetentionConfig {
                max_tasks: 10,
                max_age_secs: 3600,
            })),
            shutdown: web::Data::new(CancellationToken::new()),
        }
    }

    macro_rules! app {
        ($fx:expr) => {
            test::init_service(
                App::new()
                    .app_data($fx.config.clone())
                    .app_data($fx.store.clone())
                    .app_data($fx.tasks.clone())
                    .app_data($fx.shutdown.clone())
                    .configure(routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_health() {
        let fx = fixture().await;
        let app = app!(fx);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_scan_of_missing_directory_is_rejected() {
        let fx = fixture().await;
        let app = app!(fx);
        let req = test::TestRequest::post()
            .uri("/api/scan")
            .set_json(serde_json::json!({ "directory": "/no/such/photos" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(fx.tasks.is_empty());
    }

    #[actix_web::test]
    async fn test_scan_with_unusable_limits_is_rejected() {
        let fx = fixture().await;
        let app = app!(fx);
        let dir = tempfile::TempDir::new().unwrap();
        for body in [
            serde_json::json!({ "directory": dir.path(), "max_concurrent": usize::MAX }),
            serde_json::json!({ "directory": dir.path(), "batch_size": 0 }),
        ] {
            let req = test::TestRequest::post().uri("/api/scan").set_json(body).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
        assert!(fx.tasks.is_empty());
    }

    #[actix_web::test]
    async fn test_unknown_task_is_not_found() {
        let fx = fixture().await;
        let app = app!(fx);
        let uri = format!("/api/scan/{}", Uuid::new_v4());
        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/api/scan/not-a-uuid").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_list_returns_created_tasks() {
        let fx = fixture().await;
        let created = fx.tasks.create(ScanRequest::new("/photos"));
        let app = app!(fx);

        let req = test::TestRequest::get().uri("/api/scan?limit=5").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["task_id"], created.task_id.to_string());
        assert_eq!(listed[0]["status"], "pending");
    }

    #[actix_web::test]
    async fn test_search_and_stats() {
        let fx = fixture().await;
        fx.store
            .add(AnalysisResult {
                tags: vec!["sunset".into()],
                ..AnalysisResult::description_only("/photos/beach.jpg", "mock", "A beach")
            })
            .await
            .unwrap();
        let app = app!(fx);

        let req = test::TestRequest::post()
            .uri("/api/search")
            .set_json(serde_json::json!({ "query": "sunset" }))
            .to_request();
        let hits: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(hits.as_array().unwrap().len(), 1);
        assert_eq!(hits[0]["path"], "/photos/beach.jpg");

        let req = test::TestRequest::get().uri("/api/stats").to_request();
        let stats: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats["total_analyses"], 1);
        assert_eq!(stats["model"], "mock");
    }

    #[actix_web::test]
    async fn test_empty_search_is_rejected() {
        let fx = fixture().await;
        let app = app!(fx);
        let req = test::TestRequest::post()
            .uri("/api/search")
            .set_json(serde_json::json!({ "query": "  " }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
