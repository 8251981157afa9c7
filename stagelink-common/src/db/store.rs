//! Persistence store for rooms, requests and custom instruments
//!
//! This is the single persistence collaborator the gateway consumes. Every
//! mutation is a standalone statement; rows are independent, so there is no
//! transactional coupling between operations.

use crate::db::models::{CustomInstrument, Request, RequestAction, Room};
use crate::Result;
use chrono::Utc;
use sqlx::SqlitePool;

/// Persistence operations over the StageLink schema
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn find_room_by_name(&self, name: &str) -> Result<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(
            "SELECT id, name, created_at FROM rooms WHERE name = ? LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    pub async fn find_room_by_id(&self, id: i64) -> Result<Option<Room>> {
        let room =
            sqlx::query_as::<_, Room>("SELECT id, name, created_at FROM rooms WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(room)
    }

    pub async fn create_room(&self, name: &str) -> Result<Room> {
        let room = sqlx::query_as::<_, Room>(
            "INSERT INTO rooms (name, created_at) VALUES (?, ?) RETURNING id, name, created_at",
        )
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(room)
    }

    /// Find a room by name, creating it when absent.
    /// The bool is true when the room already existed. The conditional
    /// insert plus re-select keeps two concurrent calls for the same name
    /// from creating two rows; the loser of the race sees the winner's row.
    pub async fn find_or_create_room(&self, name: &str) -> Result<(Room, bool)> {
        if let Some(room) = self.find_room_by_name(name).await? {
            return Ok((room, true));
        }

        let inserted = sqlx::query(
            "INSERT INTO rooms (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let room = self
            .find_room_by_name(name)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok((room, inserted == 0))
    }

    /// Active (not yet completed) requests for a room, oldest first
    pub async fn list_active_requests(&self, room_id: i64) -> Result<Vec<Request>> {
        let requests = sqlx::query_as::<_, Request>(
            r#"
            SELECT id, room_id, musician, instrument, target_instrument,
                   action, completed, created_at
            FROM requests
            WHERE room_id = ? AND completed = 0
            ORDER BY id
            "#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(requests)
    }

    pub async fn insert_request(
        &self,
        room_id: i64,
        musician: &str,
        instrument: &str,
        target_instrument: &str,
        action: RequestAction,
    ) -> Result<Request> {
        let request = sqlx::query_as::<_, Request>(
            r#"
            INSERT INTO requests
                (room_id, musician, instrument, target_instrument, action, completed, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            RETURNING id, room_id, musician, instrument, target_instrument,
                      action, completed, created_at
            "#,
        )
        .bind(room_id)
        .bind(musician)
        .bind(instrument)
        .bind(target_instrument)
        .bind(action)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(request)
    }

    /// Mark one request completed. Returns the updated row, or None when the
    /// id does not resolve. Completion is monotone: a row already completed
    /// stays completed.
    pub async fn complete_request(&self, id: i64) -> Result<Option<Request>> {
        let request = sqlx::query_as::<_, Request>(
            r#"
            UPDATE requests SET completed = 1 WHERE id = ?
            RETURNING id, room_id, musician, instrument, target_instrument,
                      action, completed, created_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(request)
    }

    /// Scoped completion used by the gateway: only flips a request that
    /// belongs to the given room, so one room's technician cannot complete
    /// another room's rows.
    pub async fn complete_request_in_room(
        &self,
        id: i64,
        room_id: i64,
    ) -> Result<Option<Request>> {
        let request = sqlx::query_as::<_, Request>(
            r#"
            UPDATE requests SET completed = 1 WHERE id = ? AND room_id = ?
            RETURNING id, room_id, musician, instrument, target_instrument,
                      action, completed, created_at
            "#,
        )
        .bind(id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(request)
    }

    /// Complete every active request in a room; returns how many rows flipped
    pub async fn complete_all_requests(&self, room_id: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE requests SET completed = 1 WHERE room_id = ? AND completed = 0")
                .bind(room_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_custom_instruments(&self, room_id: i64) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM custom_instruments WHERE room_id = ? ORDER BY id",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// Idempotent create: a duplicate (room, name) returns the existing row
    pub async fn find_or_create_custom_instrument(
        &self,
        room_id: i64,
        name: &str,
    ) -> Result<CustomInstrument> {
        sqlx::query("INSERT OR IGNORE INTO custom_instruments (room_id, name) VALUES (?, ?)")
            .bind(room_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        let instrument = sqlx::query_as::<_, CustomInstrument>(
            "SELECT id, room_id, name FROM custom_instruments WHERE room_id = ? AND name = ?",
        )
        .bind(room_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    async fn test_store() -> Store {
        Store::new(init_memory_database().await.unwrap())
    }

    #[tokio::test]
    async fn find_or_create_room_reports_existing() {
        let store = test_store().await;

        let (room, existing) = store.find_or_create_room("Ensayo1").await.unwrap();
        assert_eq!(room.name, "Ensayo1");
        assert!(!existing);

        let (again, existing) = store.find_or_create_room("Ensayo1").await.unwrap();
        assert_eq!(again.id, room.id);
        assert!(existing);
    }

    #[tokio::test]
    async fn room_names_are_unique() {
        let store = test_store().await;

        let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();
        // A blind insert of the same name hits the unique index
        assert!(store.create_room("Ensayo1").await.is_err());
        // The race-safe path still resolves to the single row
        let (again, existing) = store.find_or_create_room("Ensayo1").await.unwrap();
        assert_eq!(again.id, room.id);
        assert!(existing);
    }

    #[tokio::test]
    async fn scoped_completion_ignores_other_rooms() {
        let store = test_store().await;
        let (room, _) = store.find_or_create_room("a").await.unwrap();
        let (other, _) = store.find_or_create_room("b").await.unwrap();
        let req = store
            .insert_request(room.id, "Ana", "Voz", "Voz", RequestAction::VolumeUp)
            .await
            .unwrap();

        // Wrong room: no flip, no row
        let miss = store.complete_request_in_room(req.id, other.id).await.unwrap();
        assert!(miss.is_none());
        assert_eq!(store.list_active_requests(room.id).await.unwrap().len(), 1);

        // Owning room: completed
        let hit = store.complete_request_in_room(req.id, room.id).await.unwrap();
        assert!(hit.unwrap().completed);
    }

    #[tokio::test]
    async fn active_requests_exclude_completed_and_other_rooms() {
        let store = test_store().await;
        let (room, _) = store.find_or_create_room("a").await.unwrap();
        let (other, _) = store.find_or_create_room("b").await.unwrap();

        let keep = store
            .insert_request(room.id, "Ana", "Voz", "Guitarra", RequestAction::VolumeUp)
            .await
            .unwrap();
        let done = store
            .insert_request(room.id, "Luis", "Bajo", "Bajo", RequestAction::ReverbDown)
            .await
            .unwrap();
        store
            .insert_request(other.id, "Eva", "Teclado", "Voz", RequestAction::Thanks)
            .await
            .unwrap();
        store.complete_request(done.id).await.unwrap();

        let active = store.list_active_requests(room.id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);
        assert!(!active[0].completed);
    }

    #[tokio::test]
    async fn complete_request_is_monotone() {
        let store = test_store().await;
        let (room, _) = store.find_or_create_room("a").await.unwrap();
        let req = store
            .insert_request(room.id, "Ana", "Voz", "Voz", RequestAction::VolumeDown)
            .await
            .unwrap();

        let first = store.complete_request(req.id).await.unwrap().unwrap();
        assert!(first.completed);
        let second = store.complete_request(req.id).await.unwrap().unwrap();
        assert!(second.completed);

        assert!(store.complete_request(999_999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_all_is_idempotent() {
        let store = test_store().await;
        let (room, _) = store.find_or_create_room("a").await.unwrap();
        for _ in 0..3 {
            store
                .insert_request(room.id, "Ana", "Voz", "Voz", RequestAction::Assistance)
                .await
                .unwrap();
        }

        assert_eq!(store.complete_all_requests(room.id).await.unwrap(), 3);
        assert_eq!(store.complete_all_requests(room.id).await.unwrap(), 0);
        assert!(store.list_active_requests(room.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn custom_instrument_create_is_idempotent() {
        let store = test_store().await;
        let (room, _) = store.find_or_create_room("a").await.unwrap();

        let first = store
            .find_or_create_custom_instrument(room.id, "Sax")
            .await
            .unwrap();
        let second = store
            .find_or_create_custom_instrument(room.id, "Sax")
            .await
            .unwrap();
        assert_eq!(first, second);

        let names = store.list_custom_instruments(room.id).await.unwrap();
        assert_eq!(names, vec!["Sax".to_string()]);
    }
}
