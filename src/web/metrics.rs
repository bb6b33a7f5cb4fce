use std::sync::atomic::{AtomicU64, Ordering};

use salvo::prelude::*;
use serde::Serialize;

static REQUESTS_CREATED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_APPROVED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_DENIED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_CANCELLED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_EXPIRED: AtomicU64 = AtomicU64::new(0);
static AUTO_ROLES_GIVEN: AtomicU64 = AtomicU64::new(0);
static TEMP_ROLES_EXPIRED: AtomicU64 = AtomicU64::new(0);
static NOTICES_FAILED: AtomicU64 = AtomicU64::new(0);

/// Process-wide counters. The core bumps them; `/metrics` reads them.
pub struct Metrics;

impl Metrics {
    pub fn request_created() {
        REQUESTS_CREATED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_approved() {
        REQUESTS_APPROVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_denied() {
        REQUESTS_DENIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_cancelled() {
        REQUESTS_CANCELLED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_expired() {
        REQUESTS_EXPIRED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auto_role_given() {
        AUTO_ROLES_GIVEN.fetch_add(1, Ordering::Relaxed);
    }

    pub fn temp_role_expired() {
        TEMP_ROLES_EXPIRED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notice_failed() {
        NOTICES_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            requests_created: REQUESTS_CREATED.load(Ordering::Relaxed),
            requests_approved: REQUESTS_APPROVED.load(Ordering::Relaxed),
            requests_denied: REQUESTS_DENIED.load(Ordering::Relaxed),
            requests_cancelled: REQUESTS_CANCELLED.load(Ordering::Relaxed),
            requests_expired: REQUESTS_EXPIRED.load(Ordering::Relaxed),
            auto_roles_given: AUTO_ROLES_GIVEN.load(Ordering::Relaxed),
            temp_roles_expired: TEMP_ROLES_EXPIRED.load(Ordering::Relaxed),
            notices_failed: NOTICES_FAILED.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_created: u64,
    pub requests_approved: u64,
    pub requests_denied: u64,
    pub requests_cancelled: u64,
    pub requests_expired: u64,
    pub auto_roles_given: u64,
    pub temp_roles_expired: u64,
    pub notices_failed: u64,
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.render(Json(Metrics::snapshot()));
}
