//! Final in-repo path computation and collision handling.

use std::path::Path;

use chrono::{DateTime, Datelike, Utc};
use luma_model::{DuplicatePolicy, StorageStrategy};
use tokio::fs;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::Repository;

/// Outcome of placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Commit the staged file at this repository-relative path.
    Target(String),
    /// Content-addressed target already holds these exact bytes: no move is
    /// needed, record the asset against this path. Only the cas strategy
    /// produces this; a content-addressed path can collide only with its own
    /// content.
    ExistingContent(String),
}

/// Compute the final repository-relative path for a committed file per the
/// repository's storage strategy, resolving filename collisions per its
/// duplicate policy.
pub async fn place(
    repo: &Repository,
    file_name: &str,
    content_hash: &str,
    uploaded_at: DateTime<Utc>,
) -> Result<Placement> {
    let name = sanitize_name(file_name);
    let strategy = effective_strategy(repo.config.storage_strategy, content_hash);

    match strategy {
        StorageStrategy::Cas => {
            let rel = cas_path(content_hash, &name);
            if fs::try_exists(repo.absolute(&rel)).await? {
                Ok(Placement::ExistingContent(rel))
            } else {
                Ok(Placement::Target(rel))
            }
        }
        StorageStrategy::Date => {
            let prefix = format!(
                "inbox/{:04}/{:02}",
                uploaded_at.year(),
                uploaded_at.month()
            );
            resolve_collision(repo, &prefix, &name).await
        }
        StorageStrategy::Flat => resolve_collision(repo, "inbox", &name).await,
    }
}

/// Content-addressed storage needs enough hash for the fanout directories;
/// fall back to date partitioning otherwise.
fn effective_strategy(strategy: StorageStrategy, content_hash: &str) -> StorageStrategy {
    match strategy {
        StorageStrategy::Cas if content_hash.len() < 6 => StorageStrategy::Date,
        other => other,
    }
}

fn cas_path(hash: &str, name: &str) -> String {
    let ext = extension_suffix(name);
    format!(
        "inbox/{}/{}/{}/{hash}{ext}",
        &hash[0..2],
        &hash[2..4],
        &hash[4..6]
    )
}

async fn resolve_collision(repo: &Repository, prefix: &str, name: &str) -> Result<Placement> {
    let rel = format!("{prefix}/{name}");
    if !fs::try_exists(repo.absolute(&rel)).await? {
        return Ok(Placement::Target(rel));
    }

    match repo.config.handle_duplicate_filenames {
        DuplicatePolicy::Overwrite => Ok(Placement::Target(rel)),
        DuplicatePolicy::Uuid => {
            let (stem, ext) = split_name(name);
            loop {
                let candidate =
                    format!("{prefix}/{stem}-{}{ext}", Uuid::now_v7().simple());
                if !fs::try_exists(repo.absolute(&candidate)).await? {
                    return Ok(Placement::Target(candidate));
                }
            }
        }
        DuplicatePolicy::Rename => {
            let (stem, ext) = split_name(name);
            let mut counter = 1u32;
            loop {
                let candidate = format!("{prefix}/{stem}-{counter}{ext}");
                if !fs::try_exists(repo.absolute(&candidate)).await? {
                    return Ok(Placement::Target(candidate));
                }
                counter += 1;
            }
        }
    }
}

/// Strip any client-supplied directory components; an empty or unusable
/// name falls back to a generic one.
fn sanitize_name(file_name: &str) -> String {
    Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("upload")
        .to_string()
}

fn split_name(name: &str) -> (String, String) {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("upload")
        .to_string();
    (stem, extension_suffix(name))
}

fn extension_suffix(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use luma_model::{RepositoryConfig, RepositoryId};

    fn repository(root: &Path, config: RepositoryConfig) -> Repository {
        Repository::new(RepositoryId::new(), root, config)
    }

    fn date(y: i32, m: u32) -> DateTime<Utc> {
        chrono::TimeZone::with_ymd_and_hms(&Utc, y, m, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn date_strategy_partitions_by_year_and_month() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(dir.path(), RepositoryConfig::default());
        let placement = place(&repo, "cat.jpg", "abcdef", date(2024, 10)).await.unwrap();
        assert_eq!(placement, Placement::Target("inbox/2024/10/cat.jpg".into()));
    }

    #[tokio::test]
    async fn flat_strategy_keeps_the_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Flat,
                ..RepositoryConfig::default()
            },
        );
        let placement = place(&repo, "a/b/../cat.jpg", "abcdef", date(2024, 1)).await.unwrap();
        assert_eq!(placement, Placement::Target("inbox/cat.jpg".into()));
    }

    #[tokio::test]
    async fn cas_strategy_shards_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Cas,
                ..RepositoryConfig::default()
            },
        );
        let hash = "00aabbccdd";
        let placement = place(&repo, "cat.jpg", hash, date(2024, 1)).await.unwrap();
        assert_eq!(
            placement,
            Placement::Target(format!("inbox/00/aa/bb/{hash}.jpg"))
        );
    }

    #[tokio::test]
    async fn cas_collision_reports_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Cas,
                ..RepositoryConfig::default()
            },
        );
        let hash = "00aabbccdd";
        let rel = format!("inbox/00/aa/bb/{hash}.jpg");
        let abs = repo.absolute(&rel);
        tokio::fs::create_dir_all(abs.parent().unwrap()).await.unwrap();
        tokio::fs::write(&abs, b"bytes").await.unwrap();

        let placement = place(&repo, "cat.jpg", hash, date(2024, 1)).await.unwrap();
        assert_eq!(placement, Placement::ExistingContent(rel));
    }

    #[tokio::test]
    async fn short_hash_falls_back_to_date_partitioning() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Cas,
                ..RepositoryConfig::default()
            },
        );
        let placement = place(&repo, "cat.jpg", "ab", date(2024, 3)).await.unwrap();
        assert_eq!(placement, Placement::Target("inbox/2024/03/cat.jpg".into()));
    }

    #[tokio::test]
    async fn uuid_policy_appends_an_id_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Flat,
                ..RepositoryConfig::default()
            },
        );
        let occupied = repo.absolute("inbox/cat.jpg");
        tokio::fs::create_dir_all(occupied.parent().unwrap()).await.unwrap();
        tokio::fs::write(&occupied, b"other bytes").await.unwrap();

        let Placement::Target(rel) =
            place(&repo, "cat.jpg", "abcdef", date(2024, 1)).await.unwrap()
        else {
            panic!("expected a fresh target");
        };
        assert!(rel.starts_with("inbox/cat-"));
        assert!(rel.ends_with(".jpg"));
        assert_ne!(rel, "inbox/cat.jpg");
    }

    #[tokio::test]
    async fn rename_policy_increments_until_free() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Flat,
                handle_duplicate_filenames: DuplicatePolicy::Rename,
                ..RepositoryConfig::default()
            },
        );
        tokio::fs::create_dir_all(repo.absolute("inbox")).await.unwrap();
        tokio::fs::write(repo.absolute("inbox/cat.jpg"), b"a").await.unwrap();
        tokio::fs::write(repo.absolute("inbox/cat-1.jpg"), b"b").await.unwrap();

        let placement = place(&repo, "cat.jpg", "abcdef", date(2024, 1)).await.unwrap();
        assert_eq!(placement, Placement::Target("inbox/cat-2.jpg".into()));
    }

    #[tokio::test]
    async fn overwrite_policy_reuses_the_occupied_path() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(
            dir.path(),
            RepositoryConfig {
                storage_strategy: StorageStrategy::Flat,
                handle_duplicate_filenames: DuplicatePolicy::Overwrite,
                ..RepositoryConfig::default()
            },
        );
        tokio::fs::create_dir_all(repo.absolute("inbox")).await.unwrap();
        tokio::fs::write(repo.absolute("inbox/cat.jpg"), b"old").await.unwrap();

        let placement = place(&repo, "cat.jpg", "abcdef", date(2024, 1)).await.unwrap();
        assert_eq!(placement, Placement::Target("inbox/cat.jpg".into()));
    }
}
