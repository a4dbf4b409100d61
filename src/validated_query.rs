//! Extractor for the validated query parameters of an upload request

use crate::error::IngestError;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::de::DeserializeOwned;
use validator::Validate;

/// Query parameters deserialised with axum's [Query] and then checked against their `validator`
/// rules.
///
/// Both kinds of failure are rejected as [IngestError]s, so a bad upload request gets the same
/// `400 Bad Request` body as every other client error. The request body is left untouched for
/// the handler to stream into the blob store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = IngestError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(params) = Query::<T>::from_request_parts(parts, state).await?;
        params.validate()?;
        Ok(ValidatedQuery(params))
    }
}
