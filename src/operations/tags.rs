//! Tag maintenance variants.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExecutionContext, REBUILD_KNOWN_TAGS_FOR_ANON, REBUILD_KNOWN_TAGS_FOR_USER, Variant};
use crate::catalog::{Item, compute_tags};
use crate::error::Result;

/// Recount tags visible to anonymous visitors.
pub struct RebuildKnownTagsForAnon;

#[async_trait]
impl Variant for RebuildKnownTagsForAnon {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        let written = ctx.catalog.rebuild_known_tags_for_anon().await?;
        debug!(tags = written, "rebuilt known tags for anon");
        ctx.progress.set_affected(written as i64);
        Ok(written > 0)
    }
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user_uuid: Uuid,
}

/// Recount tags visible to one user.
pub struct RebuildKnownTagsForUser;

#[async_trait]
impl Variant for RebuildKnownTagsForUser {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        let params: UserParams = ctx.params()?;
        let user = ctx.catalog.get_user(params.user_uuid).await?;
        let written = ctx.catalog.rebuild_known_tags_for_user(&user).await?;
        debug!(user = %user.uuid, tags = written, "rebuilt known tags for user");
        ctx.progress.set_affected(written as i64);
        Ok(written > 0)
    }
}

/// Fan out one user rebuild per user plus the anonymous one.
pub struct RebuildKnownTagsForAll;

#[async_trait]
impl Variant for RebuildKnownTagsForAll {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        let users = ctx.catalog.list_users().await?;
        ctx.progress.set_expected(users.len() as i64 + 1);

        for user in &users {
            let id = ctx
                .enqueue(
                    REBUILD_KNOWN_TAGS_FOR_USER,
                    serde_json::json!({ "user_uuid": user.uuid }),
                )
                .await?;
            debug!(id, user = %user.uuid, "scheduled known tags rebuild for user");
            ctx.progress.add_affected(1);
        }

        let id = ctx
            .enqueue(REBUILD_KNOWN_TAGS_FOR_ANON, serde_json::json!({}))
            .await?;
        debug!(id, "scheduled known tags rebuild for anon");
        ctx.progress.add_affected(1);
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct ItemParams {
    item_uuid: Uuid,
}

/// Recompute computed tags for an item and its live descendants, then
/// schedule known-tag rebuilds for everyone who can see them.
pub struct RebuildComputedTagsForItem;

#[async_trait]
impl Variant for RebuildComputedTagsForItem {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        let params: ItemParams = ctx.params()?;
        let item = ctx.catalog.get_item(params.item_uuid).await?;
        let owner = ctx.catalog.get_user_by_id(item.owner_id).await?;

        let mut affected_users: BTreeSet<i64> = BTreeSet::new();
        affected_users.insert(item.owner_id);
        affected_users.extend(item.permissions.iter().copied());

        // Parents are always handled before their children, so the cache
        // holds fresh tags for every parent below the starting item.
        let mut items: BTreeMap<i64, Item> = BTreeMap::new();
        let mut computed: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        let mut pending = vec![item];

        while let Some(current) = pending.pop() {
            let (parent, parent_tags) = match current.parent_id {
                Some(parent_id) => {
                    let parent = match items.get(&parent_id) {
                        Some(parent) => parent.clone(),
                        None => ctx.catalog.get_item_by_id(parent_id).await?,
                    };
                    let tags = match computed.get(&parent_id) {
                        Some(tags) => tags.clone(),
                        None => ctx.catalog.get_computed_tags(&parent).await?,
                    };
                    (Some(parent), tags)
                }
                None => (None, BTreeSet::new()),
            };

            let tags = compute_tags(&current, parent.as_ref(), &parent_tags);
            ctx.catalog.save_computed_tags(&current, &tags).await?;
            ctx.progress.add_affected(1);

            affected_users.insert(current.owner_id);
            affected_users.extend(current.permissions.iter().copied());

            for child in ctx.catalog.get_children(&current).await? {
                if child.is_deleted {
                    continue;
                }
                info!(parent = %current.uuid, child = %child.uuid, "tags change in parent affected child");
                pending.push(child);
            }

            computed.insert(current.id, tags);
            items.insert(current.id, current);
        }

        ctx.enqueue_known_tags_rebuilds(&affected_users, owner.is_public)
            .await?;
        Ok(true)
    }
}
