//! # Store — the transactional gateway over Postgres
//!
//! A single [`Store`] trait covers users, orders, payments, and balances,
//! since they form one coherent state machine rather than four independent
//! repositories.
//!
//! [`PgStore`] is the production implementation, built over a
//! [`deadpool_postgres::Pool`]; every multi-statement operation
//! (`UpdateOrderInfo`, `SpendBonus`) runs inside one transaction so the
//! balance/state invariants hold at every commit boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, PoolError};
use model::{AccrualResponse, AddOrderOutcome, Balance, Order, OrderStatus, Payment, User};
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::Transaction;

#[cfg(feature = "test-support")]
pub mod fake;

/// Errors a [`Store`] operation can fail with.
///
/// Constraint violations are recognized and translated into the specific
/// variants below rather than left as opaque database errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("could not obtain a pooled connection: {0}")]
    Pool(#[from] PoolError),
    #[error("not found")]
    NotFound,
    #[error("login already taken")]
    DuplicateLogin,
    #[error("a withdrawal has already been recorded against this order")]
    DuplicateOrder,
    #[error("insufficient funds")]
    InsufficientFunds,
}

fn status_to_i16(status: OrderStatus) -> i16 {
    match status {
        OrderStatus::New => 0,
        OrderStatus::Registered => 1,
        OrderStatus::Processing => 2,
        OrderStatus::Processed => 3,
        OrderStatus::Invalid => 4,
    }
}

fn status_from_i16(value: i16) -> OrderStatus {
    match value {
        0 => OrderStatus::New,
        1 => OrderStatus::Registered,
        2 => OrderStatus::Processing,
        3 => OrderStatus::Processed,
        _ => OrderStatus::Invalid,
    }
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Operations and contracts for the user/order/payment state machine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn add_user(&self, login: &str, password_hash: &[u8]) -> Result<i64, RepositoryError>;

    async fn get_user(&self, login: &str) -> Result<User, RepositoryError>;

    async fn add_order(
        &self,
        order_id: i64,
        user_id: i64,
    ) -> Result<AddOrderOutcome, RepositoryError>;

    /// Atomically applies an accrual update. Returns the affected user's id.
    /// A no-op on an already-terminal row returns that row's `user_id`
    /// without touching `users.sum`.
    async fn update_order_info(
        &self,
        accrual: &AccrualResponse,
    ) -> Result<i64, RepositoryError>;

    async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>, RepositoryError>;

    async fn get_balance(&self, user_id: i64) -> Result<Balance, RepositoryError>;

    async fn spend_bonus(
        &self,
        user_id: i64,
        order_id: i64,
        sum: f64,
    ) -> Result<(), RepositoryError>;

    async fn spent_bonus_list(&self, user_id: i64) -> Result<Vec<Payment>, RepositoryError>;
}

/// Postgres-backed [`Store`].
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn add_user(&self, login: &str, password_hash: &[u8]) -> Result<i64, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO users (login, password) VALUES ($1, $2) RETURNING id",
                &[&login, &password_hash],
            )
            .await;

        match row {
            Ok(row) => Ok(row.get::<_, i64>("id")),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::DuplicateLogin),
            Err(e) => Err(RepositoryError::Db(e)),
        }
    }

    async fn get_user(&self, login: &str) -> Result<User, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, login, password, sum, writeoff FROM users WHERE login = $1",
                &[&login],
            )
            .await?;
        let row = row.ok_or(RepositoryError::NotFound)?;
        Ok(User {
            id: row.get("id"),
            login: row.get("login"),
            password_hash: row.get("password"),
            sum: row.get("sum"),
            writeoff: row.get("writeoff"),
        })
    }

    async fn add_order(
        &self,
        order_id: i64,
        user_id: i64,
    ) -> Result<AddOrderOutcome, RepositoryError> {
        let client = self.pool.get().await?;
        let inserted = client
            .query_opt(
                "INSERT INTO orders (id, status, user_id, uploaded_at)
                 VALUES ($1, $2, $3, now())
                 ON CONFLICT (id) DO NOTHING
                 RETURNING id",
                &[&order_id, &status_to_i16(OrderStatus::New), &user_id],
            )
            .await?;

        if inserted.is_some() {
            return Ok(AddOrderOutcome::Inserted);
        }

        let row = client
            .query_one(
                "SELECT user_id, status FROM orders WHERE id = $1",
                &[&order_id],
            )
            .await?;
        let owner: i64 = row.get("user_id");
        if owner == user_id {
            let status = status_from_i16(row.get::<_, i16>("status"));
            Ok(AddOrderOutcome::AlreadyYours(status))
        } else {
            Ok(AddOrderOutcome::OwnedByOther)
        }
    }

    async fn update_order_info(&self, accrual: &AccrualResponse) -> Result<i64, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT user_id, status FROM orders WHERE id = $1 FOR UPDATE",
                &[&accrual.order],
            )
            .await?;
        let row = match row {
            Some(row) => row,
            None => {
                tx.rollback().await?;
                return Err(RepositoryError::NotFound);
            }
        };

        let user_id: i64 = row.get("user_id");
        let current_status = status_from_i16(row.get::<_, i16>("status"));
        if current_status.is_terminal() {
            // Re-delivery of a terminal order: no-op, never re-credits.
            tx.commit().await?;
            return Ok(user_id);
        }

        tx.execute(
            "UPDATE orders SET status = $2, processed_at = now(), accrual = $3 WHERE id = $1",
            &[&accrual.order, &status_to_i16(accrual.status), &accrual.accrual],
        )
        .await?;

        if accrual.status == OrderStatus::Processed {
            credit_user(&tx, user_id, accrual.accrual.unwrap_or(0.0)).await?;
        }

        tx.commit().await?;
        Ok(user_id)
    }

    async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, status, user_id, uploaded_at, processed_at, accrual
                 FROM orders WHERE user_id = $1 ORDER BY uploaded_at DESC",
                &[&user_id],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_order).collect())
    }

    async fn get_balance(&self, user_id: i64) -> Result<Balance, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT sum, writeoff FROM users WHERE id = $1", &[&user_id])
            .await?;
        let row = row.ok_or(RepositoryError::NotFound)?;
        Ok(Balance {
            current: row.get("sum"),
            withdrawn: row.get("writeoff"),
        })
    }

    async fn spend_bonus(
        &self,
        user_id: i64,
        order_id: i64,
        sum: f64,
    ) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_one("SELECT sum FROM users WHERE id = $1 FOR UPDATE", &[&user_id])
            .await?;
        let available: f64 = row.get("sum");
        if available < sum {
            tx.rollback().await?;
            return Err(RepositoryError::InsufficientFunds);
        }

        let insert = tx
            .execute(
                "INSERT INTO payments (user_id, order_id, processed_at, sum)
                 VALUES ($1, $2, now(), $3)",
                &[&user_id, &order_id, &sum],
            )
            .await;
        if let Err(e) = insert {
            tx.rollback().await?;
            return if is_unique_violation(&e) {
                Err(RepositoryError::DuplicateOrder)
            } else {
                Err(RepositoryError::Db(e))
            };
        }

        tx.execute(
            "UPDATE users SET sum = sum - $2, writeoff = writeoff + $2 WHERE id = $1",
            &[&user_id, &sum],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn spent_bonus_list(&self, user_id: i64) -> Result<Vec<Payment>, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, user_id, order_id, processed_at, sum
                 FROM payments WHERE user_id = $1 ORDER BY processed_at DESC",
                &[&user_id],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Payment {
                id: row.get("id"),
                user_id: row.get("user_id"),
                order_id: row.get("order_id"),
                processed_at: row.get("processed_at"),
                sum: row.get("sum"),
            })
            .collect())
    }
}

async fn credit_user(tx: &Transaction<'_>, user_id: i64, accrual: f64) -> Result<(), RepositoryError> {
    tx.execute(
        "UPDATE users SET sum = sum + $2 WHERE id = $1",
        &[&user_id, &accrual],
    )
    .await?;
    Ok(())
}

fn row_to_order(row: tokio_postgres::Row) -> Order {
    Order {
        id: row.get("id"),
        status: status_from_i16(row.get::<_, i16>("status")),
        user_id: row.get("user_id"),
        uploaded_at: row.get("uploaded_at"),
        processed_at: row.get::<_, Option<DateTime<Utc>>>("processed_at"),
        accrual: row.get("accrual"),
    }
}
