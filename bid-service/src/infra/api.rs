// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{place_bid, storage::Storage};
use auction_common::domain::{Clock, DelayedBus, DistributedLock};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use fastrace::trace;
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use std::{io, net::IpAddr, time::Instant};
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,
    pub request_body_limit: usize,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot bind tcp listener")]
    Bind(#[source] io::Error),

    #[error("api server failed")]
    Serve(#[source] io::Error),
}

#[derive(Clone)]
struct AppState<S, L, C, B> {
    storage: S,
    lock: L,
    clock: C,
    bus: B,
}

/// Serves the bid placement HTTP surface (spec §6). Every other endpoint named in spec §1's
/// "out of scope" list (auth, read queries, health checks, admin) is an external collaborator
/// and is not implemented here.
pub async fn serve<S, L, C, B>(
    config: Config,
    storage: S,
    lock: L,
    clock: C,
    bus: B,
) -> Result<(), ApiError>
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let Config {
        address,
        port,
        request_body_limit,
    } = config;

    let state = AppState {
        storage,
        lock,
        clock,
        bus,
    };

    let app = Router::new()
        .route("/api/v1/auctions/{auction_id}/bids", post(place_bid_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(request_body_limit))
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind((address, port))
        .await
        .map_err(ApiError::Bind)?;
    info!(address:?, port; "bid-service listening");

    axum::serve(listener, app).await.map_err(ApiError::Serve)
}

/// Input extracted from the authenticated caller's JWT / session (authentication is out of
/// scope per spec §1; this handler receives `user_id` as a header the authenticating reverse
/// proxy is expected to set).
#[derive(Debug, Deserialize)]
struct PlaceBidRequest {
    amount: i64,
}

#[derive(Debug, Serialize)]
struct PlaceBidResponseData {
    amount: i64,
    new_end_date: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum PlaceBidResponse {
    Ok { data: PlaceBidResponseData },
    Error { reason: &'static str },
}

impl IntoResponse for PlaceBidResponse {
    fn into_response(self) -> axum::response::Response {
        match &self {
            PlaceBidResponse::Ok { .. } => (StatusCode::OK, Json(self)).into_response(),
            PlaceBidResponse::Error { reason } => {
                let status = match *reason {
                    "TRANSIENT" | "LOCK_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
                    "NO_SUCH_AUCTION" | "NO_SUCH_WALLET" => StatusCode::NOT_FOUND,
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, Json(self)).into_response()
            }
        }
    }
}

#[trace]
async fn place_bid_handler<S, L, C, B>(
    State(state): State<AppState<S, L, C, B>>,
    Path(auction_id): Path<Uuid>,
    // Authentication is out of scope (spec §1); a real deployment extracts user_id from a
    // verified token. The user id header stands in for that boundary here.
    user_id: UserIdHeader,
    Json(request): Json<PlaceBidRequest>,
) -> PlaceBidResponse
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let started_at = Instant::now();

    let result = place_bid(
        &state.storage,
        &state.lock,
        &state.clock,
        &state.bus,
        user_id.0,
        auction_id,
        request.amount,
    )
    .await;

    let elapsed_ms = started_at.elapsed().as_millis();

    match result {
        Ok(outcome) => {
            info!(
                auction_id:%, user_id:% = user_id.0, decision = "ok", elapsed_ms;
                "bid placed"
            );
            PlaceBidResponse::Ok {
                data: PlaceBidResponseData {
                    amount: outcome.amount,
                    new_end_date: DateTime::<Utc>::from(outcome.new_end_time).to_rfc3339(),
                },
            }
        }
        Err(error) => {
            info!(
                auction_id:%, user_id:% = user_id.0, decision = error.reason(), elapsed_ms;
                "bid rejected"
            );
            PlaceBidResponse::Error {
                reason: error.reason(),
            }
        }
    }
}

struct UserIdHeader(Uuid);

impl<S> axum::extract::FromRequestParts<S> for UserIdHeader
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .map(UserIdHeader)
            .ok_or((StatusCode::UNAUTHORIZED, "missing x-user-id header"))
    }
}
