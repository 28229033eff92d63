//! Consultas de transacciones: detalle, grupo completo y listado paginado.

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::entities::Transaction;
use crate::domain::error::PaymentError;
use crate::domain::repository::TransactionRepository;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

pub struct GetTransactionUseCase {
    transactions: Arc<dyn TransactionRepository>,
}

impl GetTransactionUseCase {
    pub fn new(transactions: Arc<dyn TransactionRepository>) -> Self {
        Self { transactions }
    }

    pub async fn get(&self, id: Uuid, merchant_id: Uuid) -> Result<Transaction, PaymentError> {
        self.transactions
            .find_by_id(id)
            .await?
            .filter(|t| t.merchant_id == merchant_id)
            .ok_or(PaymentError::NotFound(id))
    }

    /// Árbol del grupo ordenado por created_at ascendente (profundidad
    /// acotada en la consulta).
    pub async fn group(
        &self,
        root_id: Uuid,
        merchant_id: Uuid,
    ) -> Result<Vec<Transaction>, PaymentError> {
        let group = self.transactions.find_group(root_id).await?;
        match group.first() {
            Some(root) if root.merchant_id == merchant_id => Ok(group),
            _ => Err(PaymentError::NotFound(root_id)),
        }
    }

    pub async fn list(
        &self,
        merchant_id: Uuid,
        customer_id: Option<Uuid>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Transaction>, PaymentError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);
        self.transactions
            .list_by_merchant(merchant_id, customer_id, limit, offset)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{TransactionStatus, TransactionType};
    use crate::use_cases::testing::MemoryTransactionStore;

    fn approved_root(merchant_id: Uuid) -> Transaction {
        let mut tx = Transaction::new_root(
            Uuid::new_v4(),
            merchant_id,
            TransactionType::SALE,
            1000,
            "USD",
        )
        .unwrap();
        tx.status = TransactionStatus::APPROVED;
        tx
    }

    #[tokio::test]
    async fn get_scopes_by_merchant() {
        let merchant_id = Uuid::new_v4();
        let tx = approved_root(merchant_id);
        let store = MemoryTransactionStore::with_rows(vec![tx.clone()]);
        let use_case = GetTransactionUseCase::new(Arc::new(store));

        assert!(use_case.get(tx.id, merchant_id).await.is_ok());
        assert_eq!(
            use_case.get(tx.id, Uuid::new_v4()).await.unwrap_err(),
            PaymentError::NotFound(tx.id)
        );
    }

    #[tokio::test]
    async fn group_is_ordered_and_scoped() {
        let merchant_id = Uuid::new_v4();
        let root = approved_root(merchant_id);
        let mut child =
            Transaction::new_child(Uuid::new_v4(), &root, TransactionType::REFUND, 500).unwrap();
        child.status = TransactionStatus::APPROVED;
        let store = MemoryTransactionStore::with_rows(vec![child, root.clone()]);
        let use_case = GetTransactionUseCase::new(Arc::new(store));

        let group = use_case.group(root.id, merchant_id).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].id, root.id);

        assert!(use_case.group(root.id, Uuid::new_v4()).await.is_err());
    }
}
