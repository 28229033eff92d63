//! Estado derivado de un grupo de transacciones.
//!
//! El estado de un grupo (autorizado, capturado, reembolsado, anulado) se
//! COMPUTA a partir de las filas persistidas; nunca se almacena. Toda
//! operación que cambia estado lo re-deriva bajo el lock de fila de la raíz,
//! por lo que el chequeo de transiciones queda libre de carreras.

use crate::domain::entities::{Transaction, TransactionStatus, TransactionType};
use crate::domain::error::PaymentError;

/// Profundidad máxima del árbol de un grupo aceptada en consultas.
pub const MAX_GROUP_DEPTH: i32 = 100;

/// Vista derivada de un grupo completo, ordenado por (created_at, id).
#[derive(Debug, Clone)]
pub struct GroupState {
    pub root_id: uuid::Uuid,
    pub root_type: TransactionType,
    pub root_status: TransactionStatus,
    pub root_amount: i64,
    /// Monto autorizado: el de la raíz si es un AUTHORIZE aprobado.
    pub authorized_amount: i64,
    /// Suma de capturas aprobadas; igual al monto de la raíz si es un SALE aprobado.
    pub captured_amount: i64,
    /// Suma de reembolsos aprobados.
    pub refunded_amount: i64,
    /// True si existe un VOID aprobado en el grupo.
    pub voided: bool,
}

impl GroupState {
    /// Deriva el estado a partir de las filas del grupo.
    ///
    /// Exige exactamente una raíz (padre null). Los empates de `created_at`
    /// se desempatan por `id` ascendente.
    pub fn derive(transactions: &[Transaction]) -> Result<Self, PaymentError> {
        let mut ordered: Vec<&Transaction> = transactions.iter().collect();
        ordered.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let root = ordered
            .iter()
            .find(|t| t.parent_transaction_id.is_none())
            .ok_or_else(|| {
                PaymentError::Internal("transaction group has no root".to_string())
            })?;

        if !root.tran_type.is_root() {
            return Err(PaymentError::Internal(format!(
                "group root {} has non-root type {:?}",
                root.id, root.tran_type
            )));
        }

        let mut state = GroupState {
            root_id: root.id,
            root_type: root.tran_type,
            root_status: root.status,
            root_amount: root.amount_cents,
            authorized_amount: 0,
            captured_amount: 0,
            refunded_amount: 0,
            voided: false,
        };

        if root.is_approved() {
            match root.tran_type {
                TransactionType::AUTHORIZE => state.authorized_amount = root.amount_cents,
                TransactionType::SALE => state.captured_amount = root.amount_cents,
                _ => unreachable!(),
            }
        }

        for tx in ordered.iter().filter(|t| t.parent_transaction_id.is_some()) {
            if tx.root_transaction_id != root.id {
                return Err(PaymentError::Internal(format!(
                    "transaction {} does not belong to group {}",
                    tx.id, root.id
                )));
            }
            if !tx.is_approved() {
                continue;
            }
            match tx.tran_type {
                TransactionType::CAPTURE => state.captured_amount += tx.amount_cents,
                TransactionType::REFUND => state.refunded_amount += tx.amount_cents,
                TransactionType::VOID => state.voided = true,
                TransactionType::AUTHORIZE | TransactionType::SALE => {
                    return Err(PaymentError::Internal(format!(
                        "root-typed transaction {} has a parent",
                        tx.id
                    )))
                }
            }
        }

        Ok(state)
    }

    pub fn remaining_capturable(&self) -> i64 {
        self.authorized_amount - self.captured_amount
    }

    pub fn remaining_refundable(&self) -> i64 {
        self.captured_amount - self.refunded_amount
    }

    /// Precondiciones de authorize → capture.
    pub fn check_capture(&self, amount_cents: i64) -> Result<(), PaymentError> {
        if self.root_type != TransactionType::AUTHORIZE {
            return Err(PaymentError::InvalidState(format!(
                "capture requires an AUTHORIZE root, group {} is {:?}",
                self.root_id, self.root_type
            )));
        }
        self.ensure_root_approved("capture")?;
        self.ensure_not_voided("capture")?;
        if amount_cents <= 0 {
            return Err(PaymentError::Validation(
                "capture amount must be positive".to_string(),
            ));
        }
        if amount_cents > self.remaining_capturable() {
            return Err(PaymentError::AmountExceedsAvailable {
                requested: amount_cents,
                available: self.remaining_capturable(),
            });
        }
        Ok(())
    }

    /// Precondiciones de authorize → void: raíz aprobada, sin capturas, sin void previo.
    pub fn check_void(&self) -> Result<(), PaymentError> {
        if self.root_type != TransactionType::AUTHORIZE {
            return Err(PaymentError::InvalidState(format!(
                "void requires an AUTHORIZE root, group {} is {:?}",
                self.root_id, self.root_type
            )));
        }
        self.ensure_root_approved("void")?;
        self.ensure_not_voided("void")?;
        if self.captured_amount > 0 {
            return Err(PaymentError::InvalidState(format!(
                "group {} already has {} cents captured; refund instead of void",
                self.root_id, self.captured_amount
            )));
        }
        Ok(())
    }

    /// Precondiciones de refund: algo capturado (o un SALE aprobado) y
    /// acumulado reembolsado + nuevo ≤ capturado.
    pub fn check_refund(&self, amount_cents: i64) -> Result<(), PaymentError> {
        self.ensure_root_approved("refund")?;
        self.ensure_not_voided("refund")?;
        if amount_cents <= 0 {
            return Err(PaymentError::Validation(
                "refund amount must be positive".to_string(),
            ));
        }
        if self.captured_amount == 0 {
            return Err(PaymentError::InvalidState(format!(
                "group {} has no captured amount to refund",
                self.root_id
            )));
        }
        if amount_cents > self.remaining_refundable() {
            return Err(PaymentError::AmountExceedsAvailable {
                requested: amount_cents,
                available: self.remaining_refundable(),
            });
        }
        Ok(())
    }

    fn ensure_root_approved(&self, operation: &str) -> Result<(), PaymentError> {
        if self.root_status != TransactionStatus::APPROVED {
            return Err(PaymentError::InvalidState(format!(
                "{} requires an approved root, group {} root is {:?}",
                operation, self.root_id, self.root_status
            )));
        }
        Ok(())
    }

    fn ensure_not_voided(&self, operation: &str) -> Result<(), PaymentError> {
        if self.voided {
            return Err(PaymentError::InvalidState(format!(
                "{} rejected, group {} is voided",
                operation, self.root_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn root(tran_type: TransactionType, amount: i64, status: TransactionStatus) -> Transaction {
        let mut tx = Transaction::new_root(Uuid::new_v4(), Uuid::new_v4(), tran_type, amount, "USD")
            .unwrap();
        tx.status = status;
        tx
    }

    fn child(
        parent: &Transaction,
        tran_type: TransactionType,
        amount: i64,
        status: TransactionStatus,
    ) -> Transaction {
        let mut tx = Transaction::new_child(Uuid::new_v4(), parent, tran_type, amount).unwrap();
        tx.status = status;
        tx
    }

    #[test]
    fn derives_amounts_for_partial_capture_and_refund() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::APPROVED);
        let cap = child(&auth, TransactionType::CAPTURE, 7_500, TransactionStatus::APPROVED);
        let refund = child(&auth, TransactionType::REFUND, 3_000, TransactionStatus::APPROVED);

        let state = GroupState::derive(&[auth, cap, refund]).unwrap();
        assert_eq!(state.authorized_amount, 10_000);
        assert_eq!(state.captured_amount, 7_500);
        assert_eq!(state.refunded_amount, 3_000);
        assert_eq!(state.remaining_refundable(), 4_500);

        // 5_000 > 7_500 - 3_000
        let err = state.check_refund(5_000).unwrap_err();
        assert_eq!(
            err,
            PaymentError::AmountExceedsAvailable {
                requested: 5_000,
                available: 4_500
            }
        );
        assert!(state.check_refund(4_500).is_ok());
    }

    #[test]
    fn declined_children_do_not_count() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::APPROVED);
        let cap_declined =
            child(&auth, TransactionType::CAPTURE, 9_000, TransactionStatus::DECLINED);
        let state = GroupState::derive(&[auth, cap_declined]).unwrap();
        assert_eq!(state.captured_amount, 0);
        assert!(state.check_capture(10_000).is_ok());
    }

    #[test]
    fn sale_counts_as_captured() {
        let sale = root(TransactionType::SALE, 2_999, TransactionStatus::APPROVED);
        let state = GroupState::derive(&[sale]).unwrap();
        assert_eq!(state.captured_amount, 2_999);
        assert!(state.check_refund(2_999).is_ok());
        assert!(matches!(
            state.check_capture(1),
            Err(PaymentError::InvalidState(_))
        ));
    }

    #[test]
    fn capture_cap_is_cumulative() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::APPROVED);
        let cap1 = child(&auth, TransactionType::CAPTURE, 6_000, TransactionStatus::APPROVED);
        let state = GroupState::derive(&[auth, cap1]).unwrap();
        assert!(state.check_capture(4_000).is_ok());
        assert!(matches!(
            state.check_capture(4_001),
            Err(PaymentError::AmountExceedsAvailable { .. })
        ));
    }

    #[test]
    fn void_requires_zero_captures() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::APPROVED);
        let state = GroupState::derive(std::slice::from_ref(&auth)).unwrap();
        assert!(state.check_void().is_ok());

        let cap = child(&auth, TransactionType::CAPTURE, 500, TransactionStatus::APPROVED);
        let state = GroupState::derive(&[auth, cap]).unwrap();
        assert!(matches!(state.check_void(), Err(PaymentError::InvalidState(_))));
    }

    #[test]
    fn voided_group_rejects_everything() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::APPROVED);
        let void = child(&auth, TransactionType::VOID, 0, TransactionStatus::APPROVED);
        let state = GroupState::derive(&[auth, void]).unwrap();
        assert!(state.voided);
        assert!(matches!(
            state.check_capture(100),
            Err(PaymentError::InvalidState(_))
        ));
        assert!(matches!(state.check_void(), Err(PaymentError::InvalidState(_))));
        assert!(matches!(
            state.check_refund(100),
            Err(PaymentError::InvalidState(_))
        ));
    }

    #[test]
    fn pending_root_blocks_children() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::PENDING);
        let state = GroupState::derive(std::slice::from_ref(&auth)).unwrap();
        assert!(matches!(
            state.check_capture(100),
            Err(PaymentError::InvalidState(_))
        ));
    }

    #[test]
    fn group_without_root_is_an_invariant_break() {
        let auth = root(TransactionType::AUTHORIZE, 10_000, TransactionStatus::APPROVED);
        let cap = child(&auth, TransactionType::CAPTURE, 500, TransactionStatus::APPROVED);
        assert!(matches!(
            GroupState::derive(std::slice::from_ref(&cap)),
            Err(PaymentError::Internal(_))
        ));
    }
}
