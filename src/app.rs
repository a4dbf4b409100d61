//! HTTP API of the ingestion pipeline

use crate::error::IngestError;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::{
    CityList, CityStatistics, CitySummary, SubmitResponse, UploadId, UploadList, UploadParams,
    UploadStatusReport,
};
use crate::pipeline::Pipeline;
use crate::validated_query::ValidatedQuery;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, FromRequestParts, Path, State},
    headers::{authorization::Basic, Authorization},
    http::{header, request::Parts, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router, TypedHeader,
};
use tower::Layer;
use tower::ServiceBuilder;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;
use tower_http::validate_request::ValidateRequestHeaderLayer;

/// Pipeline shared by the request handlers
pub type SharedPipeline = Arc<Pipeline>;

/// Service that handles requests
pub type Service = NormalizePath<Router>;

/// Identity of the caller, the username of the Basic authorization header
///
/// Credentials are not checked here.
#[derive(Debug, Clone, PartialEq)]
pub struct Owner(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = IngestError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(basic)) =
            TypedHeader::<Authorization<Basic>>::from_request_parts(parts, state)
                .await
                .map_err(|_| IngestError::MissingCredentials)?;
        if basic.username().is_empty() {
            return Err(IngestError::MissingCredentials);
        }
        Ok(Owner(basic.username().to_string()))
    }
}

/// Returns a [axum::Router] for the API
pub fn router(pipeline: SharedPipeline) -> Router {
    fn v1() -> Router<SharedPipeline> {
        Router::new()
            .route(
                "/uploads",
                post(submit_upload)
                    .layer(DefaultBodyLimit::disable())
                    .get(list_uploads),
            )
            .route("/uploads/:upload_id/status", get(upload_status))
            .route("/uploads/:upload_id/cancel", post(cancel_upload))
            .route("/cities", get(list_cities))
            .route("/cities/:city_id", get(city))
            .route("/cities/:city_id/statistics", get(city_statistics))
            .route("/cities/:city_id/refresh-cache", post(refresh_city_cache))
            .layer(
                ServiceBuilder::new().layer(ValidateRequestHeaderLayer::custom(
                    // Validate that an authorization header has been provided.
                    |request: &mut Request<Body>| {
                        if request.headers().contains_key(header::AUTHORIZATION) {
                            Ok(())
                        } else {
                            Err(StatusCode::UNAUTHORIZED.into_response())
                        }
                    },
                )),
            )
    }

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .nest("/v1", v1())
        .layer(
            TraceLayer::new_for_http()
                .on_request(request_counter)
                .on_response(record_response_metrics),
        )
        .with_state(pipeline)
}

/// Returns a [crate::app::Service] for the API
///
/// Trailing slashes are trimmed from request paths before routing.
pub fn service(pipeline: SharedPipeline) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(pipeline))
}

async fn health() -> &'static str {
    "OK"
}

/// Store the request body as a new upload and submit it.
async fn submit_upload(
    State(pipeline): State<SharedPipeline>,
    Owner(owner): Owner,
    ValidatedQuery(params): ValidatedQuery<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmitResponse>), IngestError> {
    let response = pipeline
        .receive_upload(&params.filename, &owner, body)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn upload_status(
    State(pipeline): State<SharedPipeline>,
    Path(upload_id): Path<UploadId>,
) -> Result<Json<UploadStatusReport>, IngestError> {
    Ok(Json(pipeline.get_upload_status(upload_id)?))
}

/// Uploads of the caller.
async fn list_uploads(
    State(pipeline): State<SharedPipeline>,
    Owner(owner): Owner,
) -> Result<Json<UploadList>, IngestError> {
    Ok(Json(pipeline.list_uploads(&owner)?))
}

/// Cancel an upload of the caller.
///
/// Uploads of other owners are reported as not found.
async fn cancel_upload(
    State(pipeline): State<SharedPipeline>,
    Owner(owner): Owner,
    Path(upload_id): Path<UploadId>,
) -> Result<Json<UploadStatusReport>, IngestError> {
    if pipeline.get_upload_status(upload_id)?.owner != owner {
        return Err(IngestError::UploadNotFound(upload_id));
    }
    tracing::info!("Upload {} cancelled by {}", upload_id, owner);
    Ok(Json(pipeline.cancel_upload(upload_id).await?))
}

async fn list_cities(
    State(pipeline): State<SharedPipeline>,
) -> Result<Json<CityList>, IngestError> {
    Ok(Json(pipeline.list_cities()?))
}

async fn city(
    State(pipeline): State<SharedPipeline>,
    Path(city_id): Path<String>,
) -> Result<Json<CitySummary>, IngestError> {
    Ok(Json(pipeline.get_city(&city_id)?))
}

async fn city_statistics(
    State(pipeline): State<SharedPipeline>,
    Path(city_id): Path<String>,
) -> Result<Json<CityStatistics>, IngestError> {
    Ok(Json(pipeline.get_city_statistics(&city_id).await?))
}

async fn refresh_city_cache(
    State(pipeline): State<SharedPipeline>,
    Path(city_id): Path<String>,
) -> Result<Json<CityStatistics>, IngestError> {
    Ok(Json(pipeline.refresh_city_cache(&city_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CityList, UploadList, UploadStatus};
    use crate::test_utils::{body_string, test_pipeline, BASIC_ALICE, BASIC_BOB};
    use axum::http::Method;
    use regex::Regex;
    use tower::ServiceExt; // for `oneshot`

    async fn request(
        pipeline: &SharedPipeline,
        method: Method,
        uri: &str,
        auth: Option<&str>,
        body: Body,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        service(pipeline.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health() {
        let pipeline = test_pipeline();
        let response = request(&pipeline, Method::GET, "/health", None, Body::empty()).await;
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("OK", body_string(response).await);
    }

    #[tokio::test]
    async fn metrics() {
        crate::metrics::register_metrics();
        let pipeline = test_pipeline();
        request(&pipeline, Method::GET, "/health", None, Body::empty()).await;
        let response = request(&pipeline, Method::GET, "/metrics", None, Body::empty()).await;
        assert_eq!(StatusCode::OK, response.status());
        let body = body_string(response).await;
        assert!(body.contains("incoming_requests"), "body: {body}");
    }

    #[tokio::test]
    async fn unauthorised() {
        let pipeline = test_pipeline();
        let response = request(
            &pipeline,
            Method::POST,
            "/v1/uploads?filename=data.csv",
            None,
            Body::from("NYC,1,1704067200\n"),
        )
        .await;
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
    }

    #[tokio::test]
    async fn bearer_token_is_not_an_owner() {
        let pipeline = test_pipeline();
        let response = request(
            &pipeline,
            Method::POST,
            "/v1/uploads?filename=data.csv",
            Some("Bearer abc"),
            Body::from("NYC,1,1704067200\n"),
        )
        .await;
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
        let body = body_string(response).await;
        let re = Regex::new(r"missing or invalid Basic authorization header").unwrap();
        assert!(re.is_match(&body), "body: {body}");
    }

    #[tokio::test]
    async fn missing_filename() {
        let pipeline = test_pipeline();
        let response = request(
            &pipeline,
            Method::POST,
            "/v1/uploads",
            Some(BASIC_ALICE),
            Body::from("NYC,1,1704067200\n"),
        )
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn upload_and_query() {
        let pipeline = test_pipeline();
        pipeline.start().unwrap();
        let response = request(
            &pipeline,
            Method::POST,
            "/v1/uploads/?filename=data.csv",
            Some(BASIC_ALICE),
            Body::from("city_id,temp,timestamp\nNYC,10,1704067200\nNYC,20,1704067201\n"),
        )
        .await;
        assert_eq!(StatusCode::ACCEPTED, response.status());
        let submitted: SubmitResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        pipeline.wait_idle().await;

        let response = request(
            &pipeline,
            Method::GET,
            &submitted.status_url,
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let report: UploadStatusReport =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(UploadStatus::Completed, report.status);
        assert_eq!("alice", report.owner);

        let response = request(
            &pipeline,
            Method::GET,
            "/v1/cities/NYC/statistics",
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let stats: CityStatistics = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(2, stats.count);
        assert_eq!(Some(15.0), stats.mean);

        let response = request(
            &pipeline,
            Method::POST,
            "/v1/cities/NYC/refresh-cache",
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let refreshed: CityStatistics =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert!(refreshed.cache_version > stats.cache_version);

        // A completed upload cannot be cancelled.
        let response = request(
            &pipeline,
            Method::POST,
            &format!("/v1/uploads/{}/cancel", submitted.upload_id),
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::CONFLICT, response.status());
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_upload_and_city() {
        let pipeline = test_pipeline();
        let response = request(
            &pipeline,
            Method::GET,
            &format!("/v1/uploads/{}/status", uuid::Uuid::nil()),
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        let response = request(
            &pipeline,
            Method::GET,
            "/v1/cities/Atlantis/statistics",
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        let body = body_string(response).await;
        let re = Regex::new(r"no statistics available for city Atlantis").unwrap();
        assert!(re.is_match(&body), "body: {body}");
    }

    async fn upload(pipeline: &SharedPipeline, auth: &str, data: &'static str) -> SubmitResponse {
        let response = request(
            pipeline,
            Method::POST,
            "/v1/uploads?filename=data.csv",
            Some(auth),
            Body::from(data),
        )
        .await;
        assert_eq!(StatusCode::ACCEPTED, response.status());
        serde_json::from_str(&body_string(response).await).unwrap()
    }

    #[tokio::test]
    async fn uploads_listed_per_owner() {
        let pipeline = test_pipeline();
        pipeline.start().unwrap();
        let first = upload(&pipeline, BASIC_ALICE, "NYC,10,1704067200\n").await;
        let second = upload(&pipeline, BASIC_ALICE, "LON,4,1704067200\n").await;
        upload(&pipeline, BASIC_BOB, "PAR,7,1704067200\n").await;
        pipeline.wait_idle().await;

        let response = request(
            &pipeline,
            Method::GET,
            "/v1/uploads",
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let list: UploadList = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(2, list.count);
        let mut ids: Vec<_> = list.results.iter().map(|report| report.upload_id).collect();
        ids.sort();
        let mut expected = vec![first.upload_id, second.upload_id];
        expected.sort();
        assert_eq!(expected, ids);
        assert!(list.results.iter().all(|report| report.owner == "alice"));

        let response = request(&pipeline, Method::GET, "/v1/uploads", None, Body::empty()).await;
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cities_listed_and_retrieved() {
        let pipeline = test_pipeline();
        pipeline.start().unwrap();
        upload(
            &pipeline,
            BASIC_ALICE,
            "NYC,10,1704067200\nNYC,20,1704067201\nLON,4,1704067200\n",
        )
        .await;
        upload(&pipeline, BASIC_BOB, "NYC,30,1704067200\n").await;
        pipeline.wait_idle().await;

        let response = request(
            &pipeline,
            Method::GET,
            "/v1/cities",
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let list: CityList = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(2, list.count);
        assert_eq!(
            vec!["LON", "NYC"],
            list.results.iter().map(|city| city.city_id.as_str()).collect::<Vec<_>>()
        );

        let response = request(
            &pipeline,
            Method::GET,
            "/v1/cities/NYC",
            Some(BASIC_BOB),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let city: CitySummary = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(3, city.reading_count);
        assert_eq!(2, city.uploads);

        let response = request(
            &pipeline,
            Method::GET,
            "/v1/cities/Atlantis",
            Some(BASIC_BOB),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn only_the_owner_cancels() {
        let pipeline = test_pipeline();
        // Workers are not started, so the upload stays pending.
        let submitted = upload(&pipeline, BASIC_ALICE, "NYC,10,1704067200\n").await;
        let uri = format!("/v1/uploads/{}/cancel", submitted.upload_id);

        let response = request(&pipeline, Method::POST, &uri, Some(BASIC_BOB), Body::empty()).await;
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        assert_eq!(
            UploadStatus::Pending,
            pipeline.get_upload_status(submitted.upload_id).unwrap().status
        );

        let response = request(
            &pipeline,
            Method::POST,
            &uri,
            Some(BASIC_ALICE),
            Body::empty(),
        )
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let report: UploadStatusReport =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(UploadStatus::Failed, report.status);
    }
}
