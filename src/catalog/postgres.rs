//! Postgres catalog, sharing the pool with [`crate::db::postgres::PgStore`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Catalog, Item, User};
use crate::error::{Error, Result};

const ITEM_COLUMNS: &str = "id, uuid, parent_id, owner_id, name, is_deleted, tags, permissions";

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn get_item(&self, uuid: Uuid) -> Result<Item> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE uuid = $1"))
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Into::into)
            .ok_or_else(|| Error::NotFound(format!("item {uuid}")))
    }

    async fn get_item_by_id(&self, id: i64) -> Result<Item> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Into::into)
            .ok_or_else(|| Error::NotFound(format!("item {id}")))
    }

    async fn get_children(&self, item: &Item) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE parent_id = $1 ORDER BY id"
        ))
        .bind(item.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_parents(&self, item: &Item) -> Result<Vec<Item>> {
        let Some(parent_id) = item.parent_id else {
            return Ok(Vec::new());
        };

        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "WITH RECURSIVE ancestors AS (
                 SELECT {ITEM_COLUMNS}, 0 AS depth FROM items WHERE id = $1
                 UNION ALL
                 SELECT i.id, i.uuid, i.parent_id, i.owner_id, i.name, i.is_deleted,
                        i.tags, i.permissions, a.depth + 1
                 FROM items i JOIN ancestors a ON i.id = a.parent_id
             )
             SELECT {ITEM_COLUMNS} FROM ancestors ORDER BY depth DESC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_permissions(&self, item: &Item) -> Result<()> {
        let permissions: Vec<i64> = item.permissions.iter().copied().collect();
        let rows_affected = sqlx::query("UPDATE items SET permissions = $1 WHERE id = $2")
            .bind(&permissions)
            .bind(item.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(Error::NotFound(format!("item {}", item.id)));
        }
        Ok(())
    }

    async fn get_computed_tags(&self, item: &Item) -> Result<BTreeSet<String>> {
        let row: Option<(Vec<String>,)> =
            sqlx::query_as("SELECT tags FROM computed_tags WHERE item_id = $1")
                .bind(item.id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(tags,)| tags.into_iter().collect()).unwrap_or_default())
    }

    async fn save_computed_tags(&self, item: &Item, tags: &BTreeSet<String>) -> Result<()> {
        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        sqlx::query(
            "INSERT INTO computed_tags (item_id, tags) VALUES ($1, $2)
             ON CONFLICT (item_id) DO UPDATE SET tags = EXCLUDED.tags",
        )
        .bind(item.id)
        .bind(&tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, uuid: Uuid) -> Result<User> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, uuid, is_public FROM users WHERE uuid = $1")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Into::into)
            .ok_or_else(|| Error::NotFound(format!("user {uuid}")))
    }

    async fn get_user_by_id(&self, id: i64) -> Result<User> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, uuid, is_public FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Into::into)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT id, uuid, is_public FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn public_user_ids(&self) -> Result<BTreeSet<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE is_public")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn rebuild_known_tags_for_user(&self, user: &User) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM known_tags WHERE user_id = $1")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
        let written = sqlx::query(
            "INSERT INTO known_tags (user_id, tag, counter)
             SELECT $1, tag, count(*)
             FROM items i
             JOIN computed_tags ct ON ct.item_id = i.id,
             unnest(ct.tags) AS tag
             WHERE NOT i.is_deleted AND (i.owner_id = $1 OR $1 = ANY(i.permissions))
             GROUP BY tag",
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(written)
    }

    async fn rebuild_known_tags_for_anon(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM known_tags_anon")
            .execute(&mut *tx)
            .await?;
        let written = sqlx::query(
            "INSERT INTO known_tags_anon (tag, counter)
             SELECT tag, count(*)
             FROM items i
             JOIN users u ON u.id = i.owner_id
             JOIN computed_tags ct ON ct.item_id = i.id,
             unnest(ct.tags) AS tag
             WHERE NOT i.is_deleted AND u.is_public
             GROUP BY tag",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(written)
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: i64,
    uuid: Uuid,
    parent_id: Option<i64>,
    owner_id: i64,
    name: String,
    is_deleted: bool,
    tags: Vec<String>,
    permissions: Vec<i64>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            parent_id: row.parent_id,
            owner_id: row.owner_id,
            name: row.name,
            is_deleted: row.is_deleted,
            tags: row.tags,
            permissions: row.permissions.into_iter().collect(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    uuid: Uuid,
    is_public: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            is_public: row.is_public,
        }
    }
}
