//! Item catalog: the item/user/tag store that operation variants mutate.
//!
//! The web application owns these tables. The worker only needs the narrow
//! slice below: tree navigation, permission writes, computed tags and the
//! known-tag counters used for search suggestions.

pub mod memory;
pub mod postgres;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

/// An item (image or collection) in the hierarchical tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub uuid: Uuid,
    pub parent_id: Option<i64>,
    pub owner_id: i64,
    pub name: String,
    pub is_deleted: bool,
    /// User-assigned tags, as entered.
    pub tags: Vec<String>,
    /// Ids of users this item is shared with.
    pub permissions: BTreeSet<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub uuid: Uuid,
    pub is_public: bool,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_item(&self, uuid: Uuid) -> Result<Item>;

    async fn get_item_by_id(&self, id: i64) -> Result<Item>;

    /// Direct children, deleted ones included.
    async fn get_children(&self, item: &Item) -> Result<Vec<Item>>;

    /// Ancestors ordered from the root down to the direct parent.
    async fn get_parents(&self, item: &Item) -> Result<Vec<Item>>;

    async fn save_permissions(&self, item: &Item) -> Result<()>;

    async fn get_computed_tags(&self, item: &Item) -> Result<BTreeSet<String>>;

    async fn save_computed_tags(&self, item: &Item, tags: &BTreeSet<String>) -> Result<()>;

    async fn get_user(&self, uuid: Uuid) -> Result<User>;

    async fn get_user_by_id(&self, id: i64) -> Result<User>;

    async fn list_users(&self) -> Result<Vec<User>>;

    async fn public_user_ids(&self) -> Result<BTreeSet<i64>>;

    /// Replace the known-tag counters visible to `user`. Returns tags written.
    async fn rebuild_known_tags_for_user(&self, user: &User) -> Result<u64>;

    /// Replace the known-tag counters visible to anonymous visitors.
    async fn rebuild_known_tags_for_anon(&self) -> Result<u64>;
}

/// Computed tags of `item` given its parent and the parent's computed tags.
///
/// Own tags, the trimmed parent name and own name are casefolded; parent
/// computed tags are inherited as-is; parent and own uuids are included.
pub fn compute_tags(
    item: &Item,
    parent: Option<&Item>,
    parent_tags: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut computed: BTreeSet<String> = item.tags.iter().map(|tag| casefold(tag)).collect();

    if let Some(parent) = parent {
        let parent_name = parent.name.trim();
        if !parent_name.is_empty() {
            computed.insert(casefold(parent_name));
        }
    }

    let name = item.name.trim();
    if !name.is_empty() {
        computed.insert(casefold(name));
    }

    computed.extend(parent_tags.iter().cloned());

    if let Some(parent) = parent {
        computed.insert(parent.uuid.to_string());
    }
    computed.insert(item.uuid.to_string());

    computed
}

/// Lowercase plus the full case foldings where Unicode folding and
/// lowercasing disagree in practice (`ß` to `ss`, final sigma, Latin
/// ligatures), so tags match the ones already stored.
pub fn casefold(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'ß' | 'ẞ' => folded.push_str("ss"),
            'ς' => folded.push('σ'),
            'ﬀ' => folded.push_str("ff"),
            'ﬁ' => folded.push_str("fi"),
            'ﬂ' => folded.push_str("fl"),
            'ﬃ' => folded.push_str("ffi"),
            'ﬄ' => folded.push_str("ffl"),
            'ﬅ' | 'ﬆ' => folded.push_str("st"),
            _ => folded.extend(c.to_lowercase()),
        }
    }
    folded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, tags: &[&str]) -> Item {
        Item {
            id: 1,
            uuid: Uuid::new_v4(),
            parent_id: None,
            owner_id: 1,
            name: name.to_string(),
            is_deleted: false,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            permissions: BTreeSet::new(),
        }
    }

    #[test]
    fn casefold_expands_sharp_s_and_ligatures() {
        assert_eq!(casefold("Straße"), "strasse");
        assert_eq!(casefold("GROẞ"), "gross");
        assert_eq!(casefold("λογος"), "λογοσ");
        assert_eq!(casefold("oﬃce"), "office");
        assert_eq!(casefold("Ünïcode"), "ünïcode");
    }

    #[test]
    fn folded_names_become_tags() {
        let root = item("Straße", &["Fußball"]);
        let tags = compute_tags(&root, None, &BTreeSet::new());
        assert!(tags.contains("strasse"));
        assert!(tags.contains("fussball"));
    }

    #[test]
    fn root_item_gets_own_tags_name_and_uuid() {
        let root = item("  Holidays ", &["Sea", "sun"]);
        let tags = compute_tags(&root, None, &BTreeSet::new());

        let expected: BTreeSet<String> = ["sea", "sun", "holidays", root.uuid.to_string().as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn child_inherits_parent_name_tags_and_uuid() {
        let parent = item("Trip", &[]);
        let parent_tags = compute_tags(&parent, None, &BTreeSet::new());
        let child = Item {
            parent_id: Some(parent.id),
            ..item("", &["Beach"])
        };

        let tags = compute_tags(&child, Some(&parent), &parent_tags);
        assert!(tags.contains("beach"));
        assert!(tags.contains("trip"));
        assert!(tags.contains(&parent.uuid.to_string()));
        assert!(tags.contains(&child.uuid.to_string()));
        assert!(tags.is_superset(&parent_tags));
        assert!(!tags.contains(""));
    }
}
