//! An in-memory [`Store`] for tests that don't need a real Postgres
//! instance — the `auth`/`server`/`poller` crates' test suites exercise
//! their logic against this fake rather than spinning up a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use model::{AccrualResponse, AddOrderOutcome, Balance, Order, OrderStatus, Payment, User};

use crate::{RepositoryError, Store};

#[derive(Default)]
struct Inner {
    users_by_login: HashMap<String, i64>,
    users: HashMap<i64, User>,
    orders: HashMap<i64, Order>,
    payments: Vec<Payment>,
    next_user_id: i64,
    next_payment_id: i64,
}

/// Thread-safe in-memory [`Store`], useful for unit and handler tests.
#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<Inner>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn add_user(&self, login: &str, password_hash: &[u8]) -> Result<i64, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users_by_login.contains_key(login) {
            return Err(RepositoryError::DuplicateLogin);
        }
        inner.next_user_id += 1;
        let id = inner.next_user_id;
        inner.users_by_login.insert(login.to_string(), id);
        inner.users.insert(
            id,
            User {
                id,
                login: login.to_string(),
                password_hash: password_hash.to_vec(),
                sum: 0.0,
                writeoff: 0.0,
            },
        );
        Ok(id)
    }

    async fn get_user(&self, login: &str) -> Result<User, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let id = inner
            .users_by_login
            .get(login)
            .ok_or(RepositoryError::NotFound)?;
        Ok(inner.users.get(id).cloned().unwrap())
    }

    async fn add_order(
        &self,
        order_id: i64,
        user_id: i64,
    ) -> Result<AddOrderOutcome, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.orders.get(&order_id) {
            return Ok(if existing.user_id == user_id {
                AddOrderOutcome::AlreadyYours(existing.status)
            } else {
                AddOrderOutcome::OwnedByOther
            });
        }
        inner.orders.insert(
            order_id,
            Order {
                id: order_id,
                status: OrderStatus::New,
                user_id,
                uploaded_at: Utc::now(),
                processed_at: None,
                accrual: None,
            },
        );
        Ok(AddOrderOutcome::Inserted)
    }

    async fn update_order_info(&self, accrual: &AccrualResponse) -> Result<i64, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get(&accrual.order)
            .cloned()
            .ok_or(RepositoryError::NotFound)?;
        if order.status.is_terminal() {
            return Ok(order.user_id);
        }

        let user_id = order.user_id;
        {
            let order = inner.orders.get_mut(&accrual.order).unwrap();
            order.status = accrual.status;
            order.processed_at = Some(Utc::now());
            order.accrual = accrual.accrual;
        }
        if accrual.status == OrderStatus::Processed {
            let user = inner.users.get_mut(&user_id).unwrap();
            user.sum += accrual.accrual.unwrap_or(0.0);
        }
        Ok(user_id)
    }

    async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(orders)
    }

    async fn get_balance(&self, user_id: i64) -> Result<Balance, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let user = inner.users.get(&user_id).ok_or(RepositoryError::NotFound)?;
        Ok(Balance {
            current: user.sum,
            withdrawn: user.writeoff,
        })
    }

    async fn spend_bonus(
        &self,
        user_id: i64,
        order_id: i64,
        sum: f64,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.payments.iter().any(|p| p.order_id == order_id) {
            return Err(RepositoryError::DuplicateOrder);
        }
        let user = inner.users.get(&user_id).ok_or(RepositoryError::NotFound)?;
        if user.sum < sum {
            return Err(RepositoryError::InsufficientFunds);
        }
        inner.next_payment_id += 1;
        let id = inner.next_payment_id;
        inner.payments.push(Payment {
            id,
            user_id,
            order_id,
            processed_at: Utc::now(),
            sum,
        });
        let user = inner.users.get_mut(&user_id).unwrap();
        user.sum -= sum;
        user.writeoff += sum;
        Ok(())
    }

    async fn spent_bonus_list(&self, user_id: i64) -> Result<Vec<Payment>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let mut payments: Vec<Payment> = inner
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spend_bonus_rejects_when_balance_too_low() {
        let store = FakeStore::new();
        let user_id = store.add_user("alice", b"hash").await.unwrap();
        let err = store.spend_bonus(user_id, 123, 10.0).await.unwrap_err();
        assert!(matches!(err, RepositoryError::InsufficientFunds));
    }

    #[tokio::test]
    async fn add_order_distinguishes_all_three_outcomes() {
        let store = FakeStore::new();
        let alice = store.add_user("alice", b"hash").await.unwrap();
        let bob = store.add_user("bob", b"hash").await.unwrap();

        assert_eq!(
            store.add_order(7992723465, alice).await.unwrap(),
            AddOrderOutcome::Inserted
        );
        assert_eq!(
            store.add_order(7992723465, alice).await.unwrap(),
            AddOrderOutcome::AlreadyYours(OrderStatus::New)
        );
        assert_eq!(
            store.add_order(7992723465, bob).await.unwrap(),
            AddOrderOutcome::OwnedByOther
        );
    }

    #[tokio::test]
    async fn update_order_info_is_a_no_op_once_terminal() {
        let store = FakeStore::new();
        let user_id = store.add_user("alice", b"hash").await.unwrap();
        store.add_order(7992723465, user_id).await.unwrap();

        store
            .update_order_info(&AccrualResponse {
                order: 7992723465,
                status: OrderStatus::Processed,
                accrual: Some(500.0),
            })
            .await
            .unwrap();
        assert_eq!(store.get_balance(user_id).await.unwrap().current, 500.0);

        // Re-delivery of the same terminal status must not credit twice.
        store
            .update_order_info(&AccrualResponse {
                order: 7992723465,
                status: OrderStatus::Processed,
                accrual: Some(500.0),
            })
            .await
            .unwrap();
        assert_eq!(store.get_balance(user_id).await.unwrap().current, 500.0);
    }
}
