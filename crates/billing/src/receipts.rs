//! Billing receipts

use std::sync::Arc;

use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{BillingReceipt, ReceiptRole};
use crate::store::BillingStore;

pub struct ReceiptService {
    store: Arc<dyn BillingStore>,
}

impl ReceiptService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Receipts the caller paid (`Payer`) or received (`Payee`), newest first
    pub async fn list_receipts(
        &self,
        user_id: Uuid,
        role: ReceiptRole,
    ) -> BillingResult<Vec<BillingReceipt>> {
        self.store.list_receipts(user_id, role).await
    }
}
