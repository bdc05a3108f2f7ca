//! Permission propagation through the item tree.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ExecutionContext, Variant};
use crate::error::Result;

/// How a permission change reaches descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyAs {
    /// Add `added` and remove `deleted`, keeping everything else.
    #[default]
    Delta,
    /// Overwrite with `original`.
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsParams {
    pub item_uuid: Uuid,
    #[serde(default)]
    pub added: BTreeSet<i64>,
    #[serde(default)]
    pub deleted: BTreeSet<i64>,
    /// Full permission set of the source item after the change.
    #[serde(default)]
    pub original: BTreeSet<i64>,
    #[serde(default)]
    pub apply_to_parents: bool,
    #[serde(default)]
    pub apply_to_children: bool,
    #[serde(default)]
    pub apply_to_children_as: ApplyAs,
}

pub struct RebuildPermissionsForItem;

#[async_trait]
impl Variant for RebuildPermissionsForItem {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        let params: PermissionsParams = ctx.params()?;
        let mut affected_users = BTreeSet::new();

        if params.apply_to_parents {
            apply_to_parents(ctx, &params, &mut affected_users).await?;
        }
        if params.apply_to_children {
            apply_to_children(ctx, &params, &mut affected_users).await?;
        }

        let public = ctx.catalog.public_user_ids().await?;
        let touches_public = !public.is_disjoint(&affected_users);
        ctx.enqueue_known_tags_rebuilds(&affected_users, touches_public)
            .await?;

        Ok(ctx.progress.affected() > 0)
    }
}

/// Walk up from the direct parent, stopping at the first deleted ancestor.
async fn apply_to_parents(
    ctx: &ExecutionContext,
    params: &PermissionsParams,
    affected_users: &mut BTreeSet<i64>,
) -> Result<()> {
    affected_users.extend(params.added.iter().copied());

    let item = ctx.catalog.get_item(params.item_uuid).await?;
    let parents = ctx.catalog.get_parents(&item).await?;

    for mut parent in parents.into_iter().rev() {
        if parent.is_deleted {
            break;
        }
        parent.permissions.extend(params.added.iter().copied());
        parent.permissions.retain(|user| !params.deleted.contains(user));
        ctx.catalog.save_permissions(&parent).await?;
        ctx.progress.add_affected(1);
        info!(child = %item.uuid, parent = %parent.uuid, "permissions change in child affected parent");
    }
    Ok(())
}

/// Walk every live descendant. Deleted items and their subtrees are skipped.
async fn apply_to_children(
    ctx: &ExecutionContext,
    params: &PermissionsParams,
    affected_users: &mut BTreeSet<i64>,
) -> Result<()> {
    let top = ctx.catalog.get_item(params.item_uuid).await?;
    let mut pending = ctx.catalog.get_children(&top).await?;

    while let Some(mut child) = pending.pop() {
        if child.is_deleted {
            continue;
        }

        match params.apply_to_children_as {
            ApplyAs::Copy => {
                affected_users.extend(
                    child
                        .permissions
                        .symmetric_difference(&params.original)
                        .copied(),
                );
                child.permissions = params.original.clone();
            }
            ApplyAs::Delta => {
                child.permissions.extend(params.added.iter().copied());
                child.permissions.retain(|user| !params.deleted.contains(user));
                affected_users.extend(params.added.union(&params.deleted).copied());
            }
        }

        ctx.catalog.save_permissions(&child).await?;
        ctx.progress.add_affected(1);
        info!(child = %child.uuid, "permissions change in parent affected child");

        pending.extend(ctx.catalog.get_children(&child).await?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_default_to_delta_and_no_propagation() {
        let uuid = Uuid::new_v4();
        let params: PermissionsParams =
            serde_json::from_value(serde_json::json!({ "item_uuid": uuid, "added": [3] })).unwrap();
        assert_eq!(params.apply_to_children_as, ApplyAs::Delta);
        assert!(!params.apply_to_parents && !params.apply_to_children);
        assert!(params.deleted.is_empty());
    }

    #[test]
    fn apply_as_uses_lowercase_names() {
        let copy: ApplyAs = serde_json::from_value(serde_json::json!("copy")).unwrap();
        assert_eq!(copy, ApplyAs::Copy);
        assert!(serde_json::from_value::<ApplyAs>(serde_json::json!("merge")).is_err());
    }
}
