use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockrec_core::config::Settings;
use stockrec_core::domain::recommendation::{PersistedRecommendation, RecommendationQuery};
use stockrec_core::domain::run::{RejectionRecord, RunStatus, StartRunResponse};
use stockrec_core::planner::PlannerConfig;
use stockrec_core::storage::symbols::PgSymbolDirectory;
use stockrec_core::storage::{PersistenceGateway, PgStore};
use stockrec_core::workflow::pipeline::Pipeline;
use stockrec_core::workflow::{Orchestrator, WorkflowConfig};

const DEFAULT_REJECTIONS_LIMIT: i64 = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let pool: Option<sqlx::PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match stockrec_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let state = match pool {
        Some(pool) => build_state(&settings, pool).await,
        None => AppState::default(),
    };

    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// The read API only needs the store; run control also needs every
/// pipeline collaborator to be configured.
async fn build_state(settings: &Settings, pool: sqlx::PgPool) -> AppState {
    let store: Arc<dyn PersistenceGateway> = Arc::new(PgStore::new(pool.clone()));

    let mut planner = PlannerConfig::from_env();
    if planner.targets.is_empty() {
        match stockrec_core::storage::symbols::tracked_targets(&pool).await {
            Ok(targets) => planner.targets = targets,
            Err(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %e, "load tracked targets failed; planning topics only");
            }
        }
    }

    let symbols = Arc::new(PgSymbolDirectory::new(pool));
    let orchestrator = match Pipeline::from_settings(settings, planner, symbols, store.clone()) {
        Ok(pipeline) => Some(Orchestrator::new(pipeline, WorkflowConfig::from_env())),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "pipeline not configured; run endpoints disabled");
            None
        }
    };

    AppState {
        store: Some(store),
        orchestrator,
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/runs", post(start_run))
        .route("/runs/current", get(get_run_status))
        .route("/runs/current/stop", post(stop_run))
        .route("/runs/current/rejections", get(list_rejections))
        .route("/recommendations", get(list_recommendations))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone, Default)]
struct AppState {
    store: Option<Arc<dyn PersistenceGateway>>,
    orchestrator: Option<Arc<Orchestrator>>,
}

impl AppState {
    fn orchestrator(&self) -> Result<&Arc<Orchestrator>, StatusCode> {
        self.orchestrator
            .as_ref()
            .ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }

    fn store(&self) -> Result<&Arc<dyn PersistenceGateway>, StatusCode> {
        self.store.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// 202 when a run was started, 409 with the active run's status otherwise.
async fn start_run(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<StartRunResponse>), StatusCode> {
    let resp = state.orchestrator()?.start_run().await;
    let code = if resp.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((code, Json(resp)))
}

async fn get_run_status(State(state): State<AppState>) -> Result<Json<RunStatus>, StatusCode> {
    Ok(Json(state.orchestrator()?.get_run_status().await))
}

#[derive(Debug, Serialize)]
struct StopRunResponse {
    stop_requested: bool,
    current_status: RunStatus,
}

async fn stop_run(State(state): State<AppState>) -> Result<Json<StopRunResponse>, StatusCode> {
    let orchestrator = state.orchestrator()?;
    let stop_requested = orchestrator.stop_run().await;
    Ok(Json(StopRunResponse {
        stop_requested,
        current_status: orchestrator.get_run_status().await,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct RejectionsParams {
    limit: Option<i64>,
}

async fn list_rejections(
    State(state): State<AppState>,
    Query(params): Query<RejectionsParams>,
) -> Result<Json<Vec<RejectionRecord>>, StatusCode> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_REJECTIONS_LIMIT)
        .clamp(1, RecommendationQuery::MAX_LIMIT);
    let rows = state
        .orchestrator()?
        .rejections(limit)
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

async fn list_recommendations(
    State(state): State<AppState>,
    Query(query): Query<RecommendationQuery>,
) -> Result<Json<Vec<PersistedRecommendation>>, StatusCode> {
    let rows = state
        .store()?
        .list_recommendations(&query)
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %format!("{e:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use stockrec_core::domain::recommendation::{
        Candidate, QualityScore, RecommendationSort, ScoreFactors, ScoredCandidate,
    };
    use stockrec_core::storage::memory::MemoryStore;

    fn scored(ticker: &str, url: &str, score: i32) -> ScoredCandidate {
        ScoredCandidate {
            candidate: Candidate {
                ticker: ticker.to_string(),
                company_name: None,
                exchange: Some("NASDAQ".to_string()),
                rating: Some(4.0),
                price: None,
                fair_price: None,
                target_price: None,
                growth_forecast_pct: None,
                pe: None,
                reasoning: String::new(),
                analyst: None,
                source_span: None,
                analysis_date: NaiveDate::from_ymd_opt(2025, 1, 10),
                source_url: url.to_string(),
                extracted_at: Utc.with_ymd_and_hms(2025, 1, 11, 9, 0, 0).unwrap(),
            },
            quality: QualityScore {
                score,
                factors: ScoreFactors {
                    has_explicit_rating: true,
                    has_price_target: false,
                    reasoning_words: 0,
                    reasoning_has_figures: false,
                    has_analysis_date: true,
                    age_days: Some(1),
                    has_named_source: false,
                },
            },
        }
    }

    #[tokio::test]
    async fn degraded_mode_answers_503() {
        let state = AppState::default();

        let err = list_recommendations(State(state.clone()), Query(RecommendationQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);

        let err = start_run(State(state.clone())).await.unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);

        let err = stop_run(State(state)).await.unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn recommendations_are_filtered_and_sorted() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .upsert_recommendation(&scored("AAPL", "https://a.example/1", 55), now)
            .await
            .unwrap();
        store
            .upsert_recommendation(&scored("AAPL", "https://b.example/2", 80), now)
            .await
            .unwrap();
        store
            .upsert_recommendation(&scored("MSFT", "https://a.example/1", 90), now)
            .await
            .unwrap();

        let state = AppState {
            store: Some(store),
            orchestrator: None,
        };
        let Json(rows) = list_recommendations(
            State(state),
            Query(RecommendationQuery {
                ticker: Some("aapl".to_string()),
                sort: RecommendationSort::Score,
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let scores: Vec<i32> = rows.iter().map(|r| r.quality_score).collect();
        assert_eq!(scores, vec![80, 55]);
    }
}
