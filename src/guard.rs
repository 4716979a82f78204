// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Loop guard.
//!
//! Replays arrive with `X-Replicated-From: {source}`. The [`loop_guard`]
//! middleware turns that header into a [`ReplicationContext`] stored in the
//! request extensions; handlers extract it and pass it explicitly down to the
//! service, which skips publishing when [`ReplicationContext::should_publish`]
//! is false. A replayed write therefore never produces a new broadcast.

use crate::event::HEADER_REPLICATED_FROM;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::convert::Infallible;
use tracing::debug;

/// Request-scoped replication marker. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicationContext {
    pub is_replicated: bool,
    pub source_node: Option<String>,
}

impl ReplicationContext {
    /// A request from a regular client.
    pub fn local() -> Self {
        Self::default()
    }

    /// A replay from `source`.
    pub fn replicated_from(source: impl Into<String>) -> Self {
        Self {
            is_replicated: true,
            source_node: Some(source.into()),
        }
    }

    /// Read the marker header. A missing, empty or non-UTF-8 value means local.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(HEADER_REPLICATED_FROM)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(Self::replicated_from)
            .unwrap_or_default()
    }

    /// Whether a mutation made under this context must be broadcast.
    pub fn should_publish(&self) -> bool {
        !self.is_replicated
    }
}

/// Edge middleware tagging every inbound request with its context.
pub async fn loop_guard(mut request: Request, next: Next) -> Response {
    let context = ReplicationContext::from_headers(request.headers());
    if let Some(source) = &context.source_node {
        debug!(
            source = %source,
            method = %request.method(),
            path = %request.uri().path(),
            "Replicated request"
        );
    }
    request.extensions_mut().insert(context);
    next.run(request).await
}

impl<S> FromRequestParts<S> for ReplicationContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Fall back to the headers when mounted without the middleware
        Ok(parts
            .extensions
            .get::<ReplicationContext>()
            .cloned()
            .unwrap_or_else(|| ReplicationContext::from_headers(&parts.headers)))
    }
}
