use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::artifact::{Artifact, NewArtifact};
use crate::models::image::{ImageId, SourceImage};
use crate::models::job::ArtifactFormat;

fn decode_image_id(row: &PgRow, column: &str) -> Result<ImageId, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    ImageId::parse(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn artifact_from_row(row: &PgRow) -> Result<Artifact, sqlx::Error> {
    let format: String = row.try_get("format")?;
    Ok(Artifact {
        id: row.try_get("id")?,
        image_id: decode_image_id(row, "image_id")?,
        uri: row.try_get("uri")?,
        format: ArtifactFormat::from_str(&format).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Look up a source image by id
pub async fn get_source_image(
    pool: &PgPool,
    image_id: &ImageId,
) -> Result<Option<SourceImage>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, storage_key, filename, owner_id
        FROM source_images
        WHERE id = $1
        "#,
    )
    .bind(image_id.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(SourceImage {
            id: decode_image_id(&r, "id")?,
            storage_key: r.try_get("storage_key")?,
            filename: r.try_get("filename")?,
            owner_id: r.try_get("owner_id")?,
        })
    })
    .transpose()
}

/// Get the artifact record stored under `uri`
pub async fn find_artifact_by_uri(pool: &PgPool, uri: &str) -> Result<Option<Artifact>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, image_id, uri, format, owner_id, created_at
        FROM splat_artifacts
        WHERE uri = $1
        "#,
    )
    .bind(uri)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(artifact_from_row).transpose()
}

/// Insert an artifact record, or refresh the existing one for the same uri
pub async fn upsert_artifact(pool: &PgPool, artifact: &NewArtifact) -> Result<Artifact, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO splat_artifacts (image_id, uri, format, owner_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (uri) DO UPDATE
        SET image_id = EXCLUDED.image_id,
            format = EXCLUDED.format,
            owner_id = COALESCE(EXCLUDED.owner_id, splat_artifacts.owner_id),
            updated_at = NOW()
        RETURNING id, image_id, uri, format, owner_id, created_at
        "#,
    )
    .bind(artifact.image_id.as_str())
    .bind(&artifact.uri)
    .bind(artifact.format.to_string())
    .bind(&artifact.owner_id)
    .fetch_one(pool)
    .await?;

    artifact_from_row(&row)
}

/// Delete the artifact record stored under `uri`; returns whether one existed
pub async fn delete_artifact_by_uri(pool: &PgPool, uri: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM splat_artifacts WHERE uri = $1")
        .bind(uri)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Check database connectivity
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
