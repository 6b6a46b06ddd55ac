use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::Db;
use crate::models::*;

/// Package and activity records.
#[derive(Clone)]
pub struct PackageRepo {
    db: Db,
}

#[derive(FromRow)]
struct PackageRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    course_id: Option<Uuid>,
    manifest: String,
    storage_location: String,
    byte_size: i64,
    uploaded_by: Uuid,
    version: String,
    is_valid: bool,
    validation_errors: String,
    warnings: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PackageRow> for Package {
    type Error = sqlx::Error;

    fn try_from(r: PackageRow) -> Result<Self, Self::Error> {
        let decode = |e: serde_json::Error| sqlx::Error::Decode(Box::new(e));
        Ok(Package {
            id: r.id,
            title: r.title,
            description: r.description,
            course_id: r.course_id,
            manifest: serde_json::from_str(&r.manifest).map_err(decode)?,
            storage_location: r.storage_location,
            byte_size: r.byte_size,
            uploaded_by: r.uploaded_by,
            version: r.version,
            is_valid: r.is_valid,
            validation_errors: serde_json::from_str(&r.validation_errors).map_err(decode)?,
            warnings: serde_json::from_str(&r.warnings).map_err(decode)?,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
struct ActivityRow {
    id: Uuid,
    package_id: Uuid,
    activity_uri: String,
    title: String,
    description: Option<String>,
    launch_url: String,
    launch_method: String,
    move_on: String,
    mastery_score: Option<f64>,
    activity_type: String,
    duration: Option<String>,
}

impl From<ActivityRow> for Activity {
    fn from(r: ActivityRow) -> Self {
        Activity {
            id: r.id,
            package_id: r.package_id,
            activity_uri: r.activity_uri,
            title: r.title,
            description: r.description,
            launch_url: r.launch_url,
            launch_method: LaunchMethod::parse(&r.launch_method).unwrap_or_default(),
            move_on: MoveOn::parse(&r.move_on).unwrap_or_default(),
            mastery_score: r.mastery_score,
            activity_type: r.activity_type,
            duration: r.duration,
        }
    }
}

const PACKAGE_COLUMNS: &str = "id, title, description, course_id, manifest, storage_location, byte_size, \
     uploaded_by, version, is_valid, validation_errors, warnings, created_at";

const ACTIVITY_COLUMNS: &str = "id, package_id, activity_uri, title, description, launch_url, \
     launch_method, move_on, mastery_score, activity_type, duration";

impl PackageRepo {
    pub fn new(db: Db) -> Self {
        PackageRepo { db }
    }

    /// Publish a package with its activities in one transaction; readers see
    /// either all of it or nothing.
    pub async fn insert(&self, package: &Package, activities: &[&Activity]) -> Result<(), sqlx::Error> {
        let encode = |e: serde_json::Error| sqlx::Error::Protocol(e.to_string());
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO packages ({PACKAGE_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)"
        ))
        .bind(package.id)
        .bind(&package.title)
        .bind(&package.description)
        .bind(package.course_id)
        .bind(serde_json::to_string(&package.manifest).map_err(encode)?)
        .bind(&package.storage_location)
        .bind(package.byte_size)
        .bind(package.uploaded_by)
        .bind(&package.version)
        .bind(package.is_valid)
        .bind(serde_json::to_string(&package.validation_errors).map_err(encode)?)
        .bind(serde_json::to_string(&package.warnings).map_err(encode)?)
        .bind(package.created_at)
        .execute(&mut *tx)
        .await?;

        for (order, a) in activities.iter().enumerate() {
            sqlx::query(&format!(
                "INSERT INTO activities ({ACTIVITY_COLUMNS}, order_index) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)"
            ))
            .bind(a.id)
            .bind(a.package_id)
            .bind(&a.activity_uri)
            .bind(&a.title)
            .bind(&a.description)
            .bind(&a.launch_url)
            .bind(a.launch_method.as_str())
            .bind(a.move_on.as_str())
            .bind(a.mastery_score)
            .bind(&a.activity_type)
            .bind(&a.duration)
            .bind(order as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Package>, sqlx::Error> {
        let row: Option<PackageRow> =
            sqlx::query_as(&format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE id=?"))
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        row.map(Package::try_from).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Package>, sqlx::Error> {
        let rows: Vec<PackageRow> =
            sqlx::query_as(&format!("SELECT {PACKAGE_COLUMNS} FROM packages ORDER BY created_at"))
                .fetch_all(&self.db)
                .await?;
        rows.into_iter().map(Package::try_from).collect()
    }

    pub async fn activities(&self, package_id: Uuid) -> Result<Vec<Activity>, sqlx::Error> {
        let rows: Vec<ActivityRow> = sqlx::query_as(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE package_id=? ORDER BY order_index"
        ))
        .bind(package_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Activity::from).collect())
    }

    pub async fn activity(&self, package_id: Uuid, activity_uri: &str) -> Result<Option<Activity>, sqlx::Error> {
        let row: Option<ActivityRow> = sqlx::query_as(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE package_id=? AND activity_uri=?"
        ))
        .bind(package_id)
        .bind(activity_uri)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Activity::from))
    }

    /// Returns false when no such package exists.
    pub async fn set_course(&self, id: Uuid, course_id: Uuid) -> Result<bool, sqlx::Error> {
        let res = sqlx::query("UPDATE packages SET course_id=? WHERE id=?")
            .bind(course_id)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Returns false when no such package exists.
    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM activities WHERE package_id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM packages WHERE id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }
}
