use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Room, RoomStatus};

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Room>, AppError> {
    let room = sqlx::query_as::<_, Room>("SELECT id, code, status FROM rooms WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(room)
}

pub async fn set_status<'e, E>(executor: E, id: Uuid, status: RoomStatus) -> Result<(), AppError>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE rooms SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(executor)
        .await?;
    Ok(())
}
