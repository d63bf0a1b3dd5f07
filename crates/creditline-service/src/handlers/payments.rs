//! Credit package and checkout handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::{CreditPackage, PaymentOrder, PaymentProvider};

use super::Pagination;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::payments::Checkout;
use crate::state::AppState;

/// Package with the credits it grants after bonus.
#[derive(Debug, Serialize)]
pub struct PackageResponse {
    /// The package.
    #[serde(flatten)]
    pub package: CreditPackage,
    /// Credits granted including bonus.
    pub credits_granted: i64,
}

/// Package catalog response.
#[derive(Debug, Serialize)]
pub struct PackagesResponse {
    /// Available packages.
    pub packages: Vec<PackageResponse>,
}

/// List credit packages. Public.
pub async fn list_packages(State(state): State<Arc<AppState>>) -> Json<PackagesResponse> {
    let packages = state
        .config
        .pricing
        .packages
        .iter()
        .map(|p| PackageResponse {
            package: p.clone(),
            credits_granted: p.credits_granted(),
        })
        .collect();
    Json(PackagesResponse { packages })
}

/// Checkout request.
#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    /// `stripe` or `shopier`.
    pub provider: PaymentProvider,
    /// Package to buy.
    pub package_id: String,
}

/// Start a checkout.
pub async fn checkout(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<Checkout>, ApiError> {
    let checkout = state
        .payments
        .start_checkout(
            &auth.account_id,
            auth.email.as_deref(),
            body.provider,
            &body.package_id,
        )
        .await?;
    Ok(Json(checkout))
}

/// Order list response.
#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    /// Orders, newest first.
    pub orders: Vec<PaymentOrder>,
    /// Whether there are more orders.
    pub has_more: bool,
}

/// List the caller's payment orders.
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<Pagination>,
) -> Result<Json<OrdersResponse>, ApiError> {
    let rows = state
        .store
        .list_payment_orders(&auth.account_id, query.limit() + 1, query.offset)
        .await?;
    let (orders, has_more) = query.page(rows);
    Ok(Json(OrdersResponse { orders, has_more }))
}
