//! Caller sessions. A session carries the dataset an owner is allowed to
//! lock objects from.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::cache::entry::ObjectId;
use crate::cache::events::{emit, CacheEvent, EventSender};
use crate::cache::locks::LockError;
use crate::store::models::Session;
use crate::store::MetadataStore;

pub struct SessionRegistry {
    store: Arc<dyn MetadataStore>,
    events: EventSender,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn MetadataStore>, events: EventSender) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, owner: &str, objects: Vec<ObjectId>) -> Result<Session, LockError> {
        let session = Session {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            objects,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, owner, objects = session.objects.len(), "Session created");
        emit(
            &self.events,
            CacheEvent::SessionCreated {
                session_id: session.id,
            },
        );
        Ok(session)
    }

    pub async fn get(&self, id: Uuid, owner: &str) -> Result<Session, LockError> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or(LockError::SessionNotFound(id))?;
        if session.owner != owner {
            return Err(LockError::NotSessionOwner(id));
        }
        Ok(session)
    }

    /// Delete a session. Locks taken through it stay valid until released.
    pub async fn delete(&self, id: Uuid, owner: &str) -> Result<(), LockError> {
        self.get(id, owner).await?;
        self.store
            .remove_session(id)
            .await?
            .ok_or(LockError::SessionNotFound(id))?;
        info!(session_id = %id, owner, "Session deleted");
        emit(&self.events, CacheEvent::SessionDeleted { session_id: id });
        Ok(())
    }
}
