//! In-process catalog for tests and local experiments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Catalog, Item, User};
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    next_id: i64,
    users: BTreeMap<i64, User>,
    items: BTreeMap<i64, Item>,
    computed_tags: BTreeMap<i64, BTreeSet<String>>,
    known_tags: BTreeMap<i64, BTreeMap<String, i64>>,
    known_tags_anon: BTreeMap<String, i64>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn item(&self, id: i64) -> Result<&Item> {
        self.items
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("item {id}")))
    }

    fn count_tags<'a>(&self, items: impl Iterator<Item = &'a Item>) -> BTreeMap<String, i64> {
        let mut counters = BTreeMap::new();
        for item in items.filter(|item| !item.is_deleted) {
            for tag in self.computed_tags.get(&item.id).into_iter().flatten() {
                *counters.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        counters
    }
}

/// Catalog kept entirely in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, is_public: bool) -> User {
        let mut state = self.state();
        let user = User {
            id: state.next_id(),
            uuid: Uuid::new_v4(),
            is_public,
        };
        state.users.insert(user.id, user.clone());
        user
    }

    pub fn add_item(
        &self,
        owner: &User,
        parent: Option<&Item>,
        name: &str,
        tags: &[&str],
        permissions: &[i64],
    ) -> Item {
        let mut state = self.state();
        let item = Item {
            id: state.next_id(),
            uuid: Uuid::new_v4(),
            parent_id: parent.map(|p| p.id),
            owner_id: owner.id,
            name: name.to_string(),
            is_deleted: false,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            permissions: permissions.iter().copied().collect(),
        };
        state.items.insert(item.id, item.clone());
        item
    }

    pub fn mark_deleted(&self, item: &Item) {
        if let Some(stored) = self.state().items.get_mut(&item.id) {
            stored.is_deleted = true;
        }
    }

    /// Current stored copy of an item.
    pub fn item(&self, id: i64) -> Option<Item> {
        self.state().items.get(&id).cloned()
    }

    pub fn computed_tags_of(&self, id: i64) -> BTreeSet<String> {
        self.state()
            .computed_tags
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn known_tags_of(&self, user_id: i64) -> BTreeMap<String, i64> {
        self.state()
            .known_tags
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn known_tags_anon(&self) -> BTreeMap<String, i64> {
        self.state().known_tags_anon.clone()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_item(&self, uuid: Uuid) -> Result<Item> {
        self.state()
            .items
            .values()
            .find(|item| item.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("item {uuid}")))
    }

    async fn get_item_by_id(&self, id: i64) -> Result<Item> {
        self.state().item(id).cloned()
    }

    async fn get_children(&self, item: &Item) -> Result<Vec<Item>> {
        Ok(self
            .state()
            .items
            .values()
            .filter(|child| child.parent_id == Some(item.id))
            .cloned()
            .collect())
    }

    async fn get_parents(&self, item: &Item) -> Result<Vec<Item>> {
        let state = self.state();
        let mut parents = Vec::new();
        let mut current = item.parent_id;
        while let Some(id) = current {
            let parent = state.item(id)?;
            current = parent.parent_id;
            parents.push(parent.clone());
        }
        parents.reverse();
        Ok(parents)
    }

    async fn save_permissions(&self, item: &Item) -> Result<()> {
        let mut state = self.state();
        let stored = state
            .items
            .get_mut(&item.id)
            .ok_or_else(|| Error::NotFound(format!("item {}", item.id)))?;
        stored.permissions = item.permissions.clone();
        Ok(())
    }

    async fn get_computed_tags(&self, item: &Item) -> Result<BTreeSet<String>> {
        Ok(self.computed_tags_of(item.id))
    }

    async fn save_computed_tags(&self, item: &Item, tags: &BTreeSet<String>) -> Result<()> {
        self.state().computed_tags.insert(item.id, tags.clone());
        Ok(())
    }

    async fn get_user(&self, uuid: Uuid) -> Result<User> {
        self.state()
            .users
            .values()
            .find(|user| user.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {uuid}")))
    }

    async fn get_user_by_id(&self, id: i64) -> Result<User> {
        self.state()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.state().users.values().cloned().collect())
    }

    async fn public_user_ids(&self) -> Result<BTreeSet<i64>> {
        Ok(self
            .state()
            .users
            .values()
            .filter(|user| user.is_public)
            .map(|user| user.id)
            .collect())
    }

    async fn rebuild_known_tags_for_user(&self, user: &User) -> Result<u64> {
        let mut state = self.state();
        let visible = state
            .items
            .values()
            .filter(|item| item.owner_id == user.id || item.permissions.contains(&user.id));
        let counters = state.count_tags(visible);
        let written = counters.len() as u64;
        state.known_tags.insert(user.id, counters);
        Ok(written)
    }

    async fn rebuild_known_tags_for_anon(&self) -> Result<u64> {
        let mut state = self.state();
        let public: BTreeSet<i64> = state
            .users
            .values()
            .filter(|user| user.is_public)
            .map(|user| user.id)
            .collect();
        let visible = state
            .items
            .values()
            .filter(|item| public.contains(&item.owner_id));
        let counters = state.count_tags(visible);
        let written = counters.len() as u64;
        state.known_tags_anon = counters;
        Ok(written)
    }
}
