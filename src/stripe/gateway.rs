//! Persistence Gateway
//!
//! The narrow write contract reconciliation needs from the user store. Both
//! upserts are overwrites keyed by id, so concurrent or repeated deliveries
//! of the same event converge on the same row (last write wins).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::stripe::transition::SubscriptionStatus;

/// The subscription-relevant slice of a user row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    /// Internal user id
    pub user_id: Uuid,
    /// Contact address
    pub email: String,
    /// Display name
    pub name: String,
    /// Provider customer id, once checkout has completed
    pub stripe_customer_id: Option<String>,
    /// Provider subscription id
    pub stripe_subscription_id: Option<String>,
    /// Current status
    pub subscription_status: SubscriptionStatus,
}

impl UserRecord {
    /// A freshly registered user with no subscription
    pub fn new(user_id: Uuid, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
            name: name.into(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            subscription_status: SubscriptionStatus::None,
        }
    }
}

/// User store operations consumed by the webhook pipeline
///
/// `Ok(None)` means the key matched no user. That is a dropped transition,
/// not a failure.
#[async_trait]
pub trait SubscriptionGateway: Send + Sync + 'static {
    /// Set the provider customer id on `user_id`
    async fn upsert_customer_link(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<UserRecord>, GatewayError>;

    /// Set the status of the user owning `customer_id`; `None` keeps the stored subscription id
    async fn upsert_subscription(
        &self,
        customer_id: &str,
        subscription_id: Option<&str>,
        status: SubscriptionStatus,
    ) -> Result<Option<UserRecord>, GatewayError>;

    /// Current status of `user_id`
    async fn subscription_status(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionStatus>, GatewayError>;
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, UserRecord>,
    by_customer: HashMap<String, Uuid>,
}

/// In-process user store
#[derive(Debug, Default)]
pub struct InMemorySubscriptionGateway {
    tables: RwLock<Tables>,
    writes: AtomicU64,
}

impl InMemorySubscriptionGateway {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user (the registration flow's side of the contract)
    ///
    /// Re-inserting an existing user replaces the row and moves its
    /// customer index entry.
    pub fn insert_user(&self, record: UserRecord) {
        let mut tables = self.tables.write();
        let Tables { users, by_customer } = &mut *tables;

        let previous = users
            .get(&record.user_id)
            .and_then(|row| row.stripe_customer_id.clone());
        if let Some(previous) = previous {
            if by_customer.get(&previous) == Some(&record.user_id) {
                by_customer.remove(&previous);
            }
        }

        if let Some(customer_id) = &record.stripe_customer_id {
            by_customer.insert(customer_id.clone(), record.user_id);
        }
        users.insert(record.user_id, record);
    }

    /// Snapshot of a user row
    pub fn get_user(&self, user_id: Uuid) -> Option<UserRecord> {
        self.tables.read().users.get(&user_id).cloned()
    }

    /// Snapshot of the user owning `customer_id`
    pub fn get_by_customer(&self, customer_id: &str) -> Option<UserRecord> {
        let tables = self.tables.read();
        let user_id = tables.by_customer.get(customer_id)?;
        tables.users.get(user_id).cloned()
    }

    /// Number of upserts that reached the store, matched or not
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SubscriptionGateway for InMemorySubscriptionGateway {
    async fn upsert_customer_link(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> Result<Option<UserRecord>, GatewayError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.write();

        if let Some(owner) = tables.by_customer.get(customer_id) {
            if *owner != user_id {
                return Err(GatewayError::Conflict(format!(
                    "customer {} already linked to another user",
                    customer_id
                )));
            }
        }

        let Tables { users, by_customer } = &mut *tables;
        let Some(user) = users.get_mut(&user_id) else {
            return Ok(None);
        };

        if let Some(previous) = user.stripe_customer_id.replace(customer_id.to_string()) {
            if previous != customer_id {
                by_customer.remove(&previous);
            }
        }
        by_customer.insert(customer_id.to_string(), user_id);

        Ok(Some(user.clone()))
    }

    async fn upsert_subscription(
        &self,
        customer_id: &str,
        subscription_id: Option<&str>,
        status: SubscriptionStatus,
    ) -> Result<Option<UserRecord>, GatewayError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.write();

        let Some(user_id) = tables.by_customer.get(customer_id).copied() else {
            return Ok(None);
        };
        let Some(user) = tables.users.get_mut(&user_id) else {
            return Ok(None);
        };

        if let Some(subscription_id) = subscription_id {
            user.stripe_subscription_id = Some(subscription_id.to_string());
        }
        user.subscription_status = status;

        Ok(Some(user.clone()))
    }

    async fn subscription_status(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionStatus>, GatewayError> {
        Ok(self
            .tables
            .read()
            .users
            .get(&user_id)
            .map(|u| u.subscription_status))
    }
}

/// Why a user may not reach subscription-gated content
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// No such user
    #[error("user not found")]
    UnknownUser,

    /// User exists but is not paid up
    #[error("active subscription required (status: {0})")]
    Inactive(SubscriptionStatus),

    /// Store lookup failed
    #[error("could not verify subscription: {0}")]
    Lookup(#[from] GatewayError),
}

/// Gate used by subscription-only routes: only `active` passes
pub async fn ensure_active(
    gateway: &dyn SubscriptionGateway,
    user_id: Uuid,
) -> Result<(), AccessError> {
    match gateway.subscription_status(user_id).await? {
        None => Err(AccessError::UnknownUser),
        Some(status) if status.is_active() => Ok(()),
        Some(status) => Err(AccessError::Inactive(status)),
    }
}
