use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer, Responder, ResponseError};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use numgen::{GenerateOptions, NumberError, NumberGenerator, PadSide, Settings};

struct Metrics {
    registry: Registry,
    generated: IntCounterVec,
    errors: IntCounterVec,
}

impl Metrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let generated = IntCounterVec::new(
            Opts::new("numgen_generated_total", "Numbers generated per key"),
            &["key"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("numgen_errors_total", "Failed requests by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(generated.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Metrics {
            registry,
            generated,
            errors,
        })
    }
}

struct AppState {
    generator: NumberGenerator,
    metrics: Metrics,
}

#[derive(Debug)]
enum ApiError {
    Number(NumberError),
    BadRequest(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Number(e) => write!(f, "{}", e),
            ApiError::BadRequest(msg) => write!(f, "{}", msg),
        }
    }
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::Number(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Number(NumberError::TemplateNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Number(NumberError::Template(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Number(NumberError::Storage(_)) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
            kind: self.kind(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateQuery {
    template: Option<String>,
    pad: Option<usize>,
    pad_char: Option<String>,
    pad_side: Option<PadSide>,
}

impl GenerateQuery {
    fn into_options(self) -> Result<GenerateOptions, ApiError> {
        let pad_char = match self.pad_char {
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => {
                        return Err(ApiError::BadRequest(format!(
                            "pad_char must be a single character, got {:?}",
                            s
                        )))
                    }
                }
            }
            None => None,
        };
        Ok(GenerateOptions {
            template: self.template,
            pad: self.pad,
            pad_char,
            pad_side: self.pad_side,
            timestamp: None,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResetPayload {
    #[serde(default)]
    value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct NumberResponse {
    number: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LastValueResponse {
    key: String,
    last_value: u64,
}

fn record_error(state: &AppState, err: ApiError) -> ApiError {
    state.metrics.errors.with_label_values(&[err.kind()]).inc();
    tracing::warn!(kind = err.kind(), error = %err, "request failed");
    err
}

async fn generate_number(
    key: web::Path<String>,
    query: web::Query<GenerateQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    let key = key.into_inner();
    let options = query
        .into_inner()
        .into_options()
        .map_err(|e| record_error(&state, e))?;

    let number = state
        .generator
        .generate(&key, options)
        .await
        .map_err(|e| record_error(&state, ApiError::Number(e)))?;

    state
        .metrics
        .generated
        .with_label_values(&[key.as_str()])
        .inc();
    Ok(web::Json(NumberResponse { number }))
}

async fn last_value(
    key: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    let key = key.into_inner();
    let last_value = state
        .generator
        .get_last(&key)
        .await
        .map_err(|e| record_error(&state, ApiError::Number(e)))?;
    Ok(web::Json(LastValueResponse { key, last_value }))
}

async fn reset_sequence(
    key: web::Path<String>,
    payload: Option<web::Json<ResetPayload>>,
    state: web::Data<AppState>,
) -> Result<impl Responder, ApiError> {
    let key = key.into_inner();
    let value = payload.map(|p| p.into_inner().value).unwrap_or_default();
    state
        .generator
        .reset(&key, value)
        .await
        .map_err(|e| record_error(&state, ApiError::Number(e)))?;
    Ok(HttpResponse::NoContent().finish())
}

async fn metrics(state: web::Data<AppState>) -> HttpResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
        return HttpResponse::InternalServerError().body(e.to_string());
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/numbers/{key}", web::get().to(generate_number))
        .route("/api/numbers/{key}/last", web::get().to(last_value))
        .route("/api/numbers/{key}/reset", web::post().to(reset_sequence))
        .route("/metrics", web::get().to(metrics));
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load().map_err(std::io::Error::other)?;
    let generator = settings
        .into_generator()
        .await
        .map_err(std::io::Error::other)?;
    let metrics = Metrics::new().map_err(std::io::Error::other)?;
    let state = web::Data::new(AppState { generator, metrics });

    let bind = std::env::var("NUMGEN_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!(%bind, "starting number generator service");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .bind(bind)?
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use numgen::{MemorySequenceStore, TemplateRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn test_state() -> web::Data<AppState> {
        let registry = TemplateRegistry::from_json(
            r#"{"TEST": {"template": "TEST-{Y}-{number}", "pad": 4}}"#,
        )
        .unwrap();
        let generator =
            NumberGenerator::new(Arc::new(MemorySequenceStore::new())).with_registry(registry);
        web::Data::new(AppState {
            generator,
            metrics: Metrics::new().unwrap(),
        })
    }

    #[actix_web::test]
    async fn test_generate_and_reset_number() {
        let app = test::init_service(App::new().app_data(test_state()).configure(routes)).await;
        let year = chrono::Local::now().format("%Y").to_string();

        let generate_request = test::TestRequest::get()
            .uri("/api/numbers/TEST")
            .to_request();
        let body: NumberResponse = test::call_and_read_body_json(&app, generate_request).await;
        assert_eq!(body.number, format!("TEST-{}-0001", year));

        let generate_request = test::TestRequest::get()
            .uri("/api/numbers/TEST")
            .to_request();
        let body: NumberResponse = test::call_and_read_body_json(&app, generate_request).await;
        assert_eq!(body.number, format!("TEST-{}-0002", year));

        let reset_request = test::TestRequest::post()
            .uri("/api/numbers/TEST/reset")
            .set_json(json!({ "value": 0 }))
            .to_request();
        let response = test::call_service(&app, reset_request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let last_request = test::TestRequest::get()
            .uri("/api/numbers/TEST/last")
            .to_request();
        let body: LastValueResponse = test::call_and_read_body_json(&app, last_request).await;
        assert_eq!(body.last_value, 0);
    }

    #[actix_web::test]
    async fn test_query_overrides() {
        let app = test::init_service(App::new().app_data(test_state()).configure(routes)).await;

        let request = test::TestRequest::get()
            .uri("/api/numbers/ORDER?template=ORD-%7Bnumber%7D&pad=6&pad_char=x&pad_side=right")
            .to_request();
        let body: NumberResponse = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body.number, "ORD-1xxxxx");
    }

    #[actix_web::test]
    async fn test_error_status_mapping() {
        let app = test::init_service(App::new().app_data(test_state()).configure(routes)).await;

        let request = test::TestRequest::get()
            .uri("/api/numbers/UNKNOWN")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = test::TestRequest::get()
            .uri("/api/numbers/TEST?template=%7Bfoo%7D")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = test::TestRequest::get()
            .uri("/api/numbers/TEST?pad_char=ab")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_oversized_pad_is_bad_request_and_consumes_nothing() {
        let app = test::init_service(App::new().app_data(test_state()).configure(routes)).await;

        let request = test::TestRequest::get()
            .uri("/api/numbers/TEST?pad=18446744073709551615")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = test::TestRequest::get()
            .uri("/api/numbers/TEST/last")
            .to_request();
        let body: LastValueResponse = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body.last_value, 0);
    }

    #[actix_web::test]
    async fn test_metrics_endpoint() {
        let app = test::init_service(App::new().app_data(test_state()).configure(routes)).await;

        let request = test::TestRequest::get()
            .uri("/api/numbers/TEST")
            .to_request();
        test::call_service(&app, request).await;

        let request = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, request).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("numgen_generated_total{key=\"TEST\"} 1"));
    }
}
