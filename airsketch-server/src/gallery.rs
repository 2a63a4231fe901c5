use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const GUEST_USER: &str = "guest";

#[derive(Clone, Debug, Serialize)]
pub struct GalleryItem {
    pub id: Uuid,
    pub user_id: String,
    pub sketch_data: Option<String>,
    pub image_data: Option<String>,
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewGalleryItem {
    pub user_id: Option<String>,
    pub sketch_data: Option<String>,
    pub image_data: Option<String>,
    pub prompt: Option<String>,
}

/// In-memory history of saved generations.
#[derive(Default)]
pub struct Gallery {
    items: RwLock<Vec<GalleryItem>>,
}

impl Gallery {
    pub fn create(&self, new: NewGalleryItem) -> Uuid {
        let item = GalleryItem {
            id: Uuid::new_v4(),
            user_id: new.user_id.unwrap_or_else(|| GUEST_USER.to_string()),
            sketch_data: new.sketch_data,
            image_data: new.image_data,
            prompt: new.prompt,
            created_at: Utc::now(),
        };
        let id = item.id;
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
        id
    }

    /// Items newest first, optionally restricted to one user.
    pub fn list(&self, user_id: Option<&str>) -> Vec<GalleryItem> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        let mut listed: Vec<_> = items
            .iter()
            .rev()
            .filter(|item| user_id.is_none_or(|u| item.user_id == u))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed
    }

    /// Returns whether an item was removed; unknown ids are a no-op.
    pub fn delete(&self, id: Uuid) -> bool {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let before = items.len();
        items.retain(|item| item.id != id);
        items.len() != before
    }
}
