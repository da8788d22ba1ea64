//! Database initialization tests against file-backed databases

use grades_common::db::{get_schema_version, init_database};

#[tokio::test]
async fn test_database_created_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("grades.db");
    assert!(!db_path.exists());

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists(), "database file was not created");
    assert_eq!(get_schema_version(&pool).await.unwrap(), 2);
    pool.close().await;
}

#[tokio::test]
async fn test_database_reopens_existing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("grades.db");

    let pool = init_database(&db_path).await.unwrap();
    sqlx::query("INSERT INTO frozen_courses (course_id, frozen_at) VALUES ('course-v1:O+C+R', 'x')")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let pool = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM frozen_courses")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    pool.close().await;
}

#[tokio::test]
async fn test_wal_and_foreign_keys_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("grades.db")).await.unwrap();

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");

    let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(fk, 1);
    pool.close().await;
}
