//! Operation variants: the work a claimed operation performs.
//!
//! Variants are looked up by operation name in a [`VariantRegistry`] that is
//! built once at startup and handed to the worker. There is no global
//! registration; two variants under one name is an error at build time.

pub mod permissions;
pub mod tags;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::db::SerialStore;
use crate::error::{Error, Result};
use crate::model::{NewOperation, Operation, OperationId};

pub const REBUILD_KNOWN_TAGS_FOR_ANON: &str = "rebuild_known_tags_for_anon";
pub const REBUILD_KNOWN_TAGS_FOR_USER: &str = "rebuild_known_tags_for_user";
pub const REBUILD_KNOWN_TAGS_FOR_ALL: &str = "rebuild_known_tags_for_all";
pub const REBUILD_COMPUTED_TAGS_FOR_ITEM: &str = "rebuild_computed_tags_for_item";
pub const REBUILD_PERMISSIONS_FOR_ITEM: &str = "rebuild_permissions_for_item";

/// A unit of work bound to an operation name.
///
/// `execute` returns whether anything was changed. Returning an error, or
/// panicking, fails the operation; the error text lands in its log.
#[async_trait]
pub trait Variant: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool>;
}

/// Planned and actual record counts reported by a running variant.
///
/// Shared with the worker so a partial `affected` survives a failure.
#[derive(Debug, Default)]
pub struct Progress {
    expected: AtomicI64,
    affected: AtomicI64,
}

impl Progress {
    pub fn set_expected(&self, expected: i64) {
        self.expected.store(expected, Ordering::Relaxed);
    }

    pub fn add_affected(&self, n: i64) {
        self.affected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_affected(&self, n: i64) {
        self.affected.store(n, Ordering::Relaxed);
    }

    pub fn expected(&self) -> i64 {
        self.expected.load(Ordering::Relaxed)
    }

    pub fn affected(&self) -> i64 {
        self.affected.load(Ordering::Relaxed)
    }
}

/// Everything a variant may touch while executing one operation.
#[derive(Clone)]
pub struct ExecutionContext {
    pub operation: Operation,
    pub store: Arc<dyn SerialStore>,
    pub catalog: Arc<dyn Catalog>,
    pub progress: Arc<Progress>,
}

impl ExecutionContext {
    pub fn new(
        operation: Operation,
        store: Arc<dyn SerialStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let progress = Progress::default();
        progress.set_expected(operation.expected);
        progress.set_affected(operation.affected);
        Self {
            operation,
            store,
            catalog,
            progress: Arc::new(progress),
        }
    }

    /// Decode the operation's extras into variant parameters.
    pub fn params<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.operation.extras.clone()).map_err(|e| Error::BadOperation {
            id: self.operation.id,
            problem: e.to_string(),
        })
    }

    /// User who asked for the operation, if recorded.
    pub fn requested_by(&self) -> Option<Uuid> {
        self.operation
            .extras
            .get("requested_by")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    /// Enqueue follow-up work on behalf of the same requester.
    pub async fn enqueue(&self, name: &str, extras: serde_json::Value) -> Result<OperationId> {
        let mut new = NewOperation::new(name).extras(extras);
        if let Some(user) = self.requested_by() {
            new = new.requested_by(user);
        }
        let id = self.store.enqueue(new).await?;
        debug!(parent = self.operation.id, id, name, "enqueued follow-up operation");
        Ok(id)
    }

    /// Schedule known-tag rebuilds for `users`, plus the anonymous view when
    /// `include_anon` is set. Returns how many operations were enqueued.
    pub async fn enqueue_known_tags_rebuilds(
        &self,
        users: &BTreeSet<i64>,
        include_anon: bool,
    ) -> Result<i64> {
        let mut enqueued = 0;
        for &user_id in users {
            let user = self.catalog.get_user_by_id(user_id).await?;
            self.enqueue(
                REBUILD_KNOWN_TAGS_FOR_USER,
                serde_json::json!({ "user_uuid": user.uuid }),
            )
            .await?;
            enqueued += 1;
        }
        if include_anon {
            self.enqueue(REBUILD_KNOWN_TAGS_FOR_ANON, serde_json::json!({}))
                .await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Variant> + Send + Sync>;

/// Name to variant-constructor table.
#[derive(Clone, Default)]
pub struct VariantRegistry {
    factories: BTreeMap<String, Factory>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in variant.
    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(REBUILD_KNOWN_TAGS_FOR_ANON, || {
            Box::new(tags::RebuildKnownTagsForAnon)
        })?;
        registry.register(REBUILD_KNOWN_TAGS_FOR_USER, || {
            Box::new(tags::RebuildKnownTagsForUser)
        })?;
        registry.register(REBUILD_KNOWN_TAGS_FOR_ALL, || {
            Box::new(tags::RebuildKnownTagsForAll)
        })?;
        registry.register(REBUILD_COMPUTED_TAGS_FOR_ITEM, || {
            Box::new(tags::RebuildComputedTagsForItem)
        })?;
        registry.register(REBUILD_PERMISSIONS_FOR_ITEM, || {
            Box::new(permissions::RebuildPermissionsForItem)
        })?;
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Variant> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::DuplicateVariant(name));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Build a fresh variant for `name`.
    pub fn get(&self, name: &str) -> Option<Box<dyn Variant>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
