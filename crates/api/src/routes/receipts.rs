//! Receipt routes

use apihub_billing::{BillingReceipt, ReceiptRole};
use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ReceiptsQuery {
    /// `payer` (default) for charges the caller paid, `payee` for income
    #[serde(default)]
    pub role: ReceiptRole,
}

pub async fn list_receipts(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ReceiptsQuery>,
) -> ApiResult<Json<Vec<BillingReceipt>>> {
    let billing = state.billing()?;
    let receipts = billing
        .receipts
        .list_receipts(auth_user.user_id, query.role)
        .await?;
    Ok(Json(receipts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::subscriptions::{subscribe, SubscribeBody};
    use crate::test_support::state_for;
    use apihub_billing::testing::Marketplace;
    use apihub_shared::ReceiptStatus;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_payer_and_payee_views() {
        let m = Marketplace::seed();
        let state = state_for(&m);
        let consumer = Extension(AuthUser {
            user_id: m.consumer_id,
            email: None,
        });
        let owner = Extension(AuthUser {
            user_id: m.owner_id,
            email: None,
        });

        let (status, _) = subscribe(
            State(state.clone()),
            consumer.clone(),
            Json(SubscribeBody {
                service_id: m.service_id,
                tier_id: m.paid_tier_id,
                payment_method_id: Some(m.card_id),
                auto_renewal: true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(paid) = list_receipts(
            State(state.clone()),
            consumer.clone(),
            Query(ReceiptsQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].status, ReceiptStatus::Paid);
        assert_eq!(paid[0].amount_cents, Marketplace::PAID_TIER_PRICE_CENTS);

        let Json(earned) = list_receipts(
            State(state.clone()),
            owner,
            Query(ReceiptsQuery {
                role: ReceiptRole::Payee,
            }),
        )
        .await
        .unwrap();
        assert_eq!(earned.len(), 1);

        let Json(none) = list_receipts(
            State(state),
            consumer,
            Query(ReceiptsQuery {
                role: ReceiptRole::Payee,
            }),
        )
        .await
        .unwrap();
        assert!(none.is_empty());
    }
}
