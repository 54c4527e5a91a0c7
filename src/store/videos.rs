use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{DbErrorKind, StoreError};
use crate::db::Database;
use crate::message::{Channel, RepositoryVideoRecord, Video, VideoInfo, format_timestamp};

const SELECT_COLUMNS: &str = "SELECT id, created_at, url, resolution, width, height, download_dir, \
     output_path, title, duration, published_at, average_rating, thumbnail, tags, channel_id, \
     channel_name, channel_url FROM videos";

#[derive(Debug, FromRow)]
struct VideoRow {
    id: String,
    created_at: String,
    url: String,
    resolution: i64,
    width: Option<i64>,
    height: Option<i64>,
    download_dir: String,
    output_path: String,
    title: String,
    duration: Option<String>,
    published_at: Option<String>,
    average_rating: Option<f64>,
    thumbnail: Option<String>,
    tags: String,
    channel_id: String,
    channel_name: String,
    channel_url: String,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{value}': {e}"))
}

fn to_u32(value: i64, column: &str) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("{column} out of range: {value}"))
}

impl VideoRow {
    fn into_record(self) -> Result<RepositoryVideoRecord, String> {
        let id = Uuid::parse_str(&self.id).map_err(|e| format!("bad id '{}': {e}", self.id))?;
        let created_at = parse_time(&self.created_at)?;
        let published_at = self.published_at.as_deref().map(parse_time).transpose()?;
        let tags: Vec<String> =
            serde_json::from_str(&self.tags).map_err(|e| format!("bad tags: {e}"))?;

        let video = Video {
            info: VideoInfo {
                url: self.url,
                title: self.title,
                duration: self.duration,
                published_at,
                average_rating: self.average_rating,
                thumbnail: self.thumbnail,
                tags,
                channel: Channel {
                    id: self.channel_id,
                    name: self.channel_name,
                    url: self.channel_url,
                },
            },
            resolution: to_u32(self.resolution, "resolution")?,
            width: self.width.map(|w| to_u32(w, "width")).transpose()?,
            height: self.height.map(|h| to_u32(h, "height")).transpose()?,
            download_dir: PathBuf::from(self.download_dir),
            output_path: PathBuf::from(self.output_path),
        };
        Ok(RepositoryVideoRecord::restore(id, created_at, video))
    }
}

/// Catalogue of downloaded videos. The source URL is unique.
#[derive(Debug, Clone)]
pub struct VideoRepository {
    db: Database,
}

impl VideoRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Catalogues `video` under a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if a video with the same URL is
    /// already catalogued, [`StoreError::Persistence`] for anything else.
    #[instrument(skip(self, video), fields(url = %video.url()))]
    pub async fn save_video(&self, video: &Video) -> Result<RepositoryVideoRecord, StoreError<Video>> {
        let record = RepositoryVideoRecord::new(video.clone());
        let tags = serde_json::to_string(&video.info.tags)
            .map_err(|e| StoreError::persistence(DbErrorKind::Decode, e.to_string()))?;

        sqlx::query(
            r"INSERT INTO videos (
                id, created_at, url, resolution, width, height, download_dir, output_path,
                title, duration, published_at, average_rating, thumbnail, tags,
                channel_id, channel_name, channel_url
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id().to_string())
        .bind(format_timestamp(record.created_at()))
        .bind(video.url())
        .bind(i64::from(video.resolution))
        .bind(video.width.map(i64::from))
        .bind(video.height.map(i64::from))
        .bind(video.download_dir.to_string_lossy().into_owned())
        .bind(video.output_path.to_string_lossy().into_owned())
        .bind(video.title())
        .bind(video.info.duration.as_deref())
        .bind(video.info.published_at.map(format_timestamp))
        .bind(video.info.average_rating)
        .bind(video.info.thumbnail.as_deref())
        .bind(tags)
        .bind(&video.info.channel.id)
        .bind(&video.info.channel.name)
        .bind(&video.info.channel.url)
        .execute(self.db.pool())
        .await
        .map_err(|e| StoreError::from_save(&e, video.url(), video.clone()))?;

        debug!(id = %record.id(), "video catalogued");
        Ok(record)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the lookup fails.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<RepositoryVideoRecord>, StoreError<Video>> {
        self.fetch_one("id", &id.to_string()).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the lookup fails.
    pub async fn get_by_url(&self, url: &str) -> Result<Option<RepositoryVideoRecord>, StoreError<Video>> {
        self.fetch_one("url", url).await
    }

    /// First video with exactly this title.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the lookup fails.
    pub async fn get_by_title(
        &self,
        title: &str,
    ) -> Result<Option<RepositoryVideoRecord>, StoreError<Video>> {
        self.fetch_one("title", title).await
    }

    /// Videos whose channel name contains `fragment` (case-insensitive for ASCII).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_channel_name(
        &self,
        fragment: &str,
    ) -> Result<Vec<RepositoryVideoRecord>, StoreError<Video>> {
        let escaped = fragment
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let sql = format!(
            "{SELECT_COLUMNS} WHERE channel_name LIKE ? ESCAPE '\\' ORDER BY created_at, rowid"
        );
        let rows: Vec<VideoRow> = sqlx::query_as(&sql)
            .bind(format!("%{escaped}%"))
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter()
            .map(|row| row.into_record().map_err(|e| StoreError::persistence(DbErrorKind::Decode, e)))
            .collect()
    }

    async fn fetch_one(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<RepositoryVideoRecord>, StoreError<Video>> {
        let sql = format!("{SELECT_COLUMNS} WHERE {column} = ? ORDER BY rowid LIMIT 1");
        let row: Option<VideoRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(self.db.pool())
            .await?;

        row.map(VideoRow::into_record)
            .transpose()
            .map_err(|e| StoreError::persistence(DbErrorKind::Decode, e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use chrono::TimeZone;

    use super::*;

    fn video(url: &str, title: &str, channel: &str) -> Video {
        Video {
            info: VideoInfo {
                url: url.to_string(),
                title: title.to_string(),
                duration: Some("3:10".to_string()),
                published_at: Some(Utc.with_ymd_and_hms(2025, 5, 4, 10, 0, 0).unwrap()),
                average_rating: Some(4.5),
                thumbnail: None,
                tags: vec!["a".to_string(), "b".to_string()],
                channel: Channel {
                    id: "UC1".to_string(),
                    name: channel.to_string(),
                    url: "https://youtube.com/@c".to_string(),
                },
            },
            resolution: 720,
            width: Some(1280),
            height: Some(720),
            download_dir: PathBuf::from("/media/z/Zephyr"),
            output_path: Path::new("/media/z/Zephyr").join(format!("{title}.mkv")),
        }
    }

    async fn repository() -> VideoRepository {
        VideoRepository::new(Database::new_in_memory().await.unwrap())
    }

    // ==================== Save ====================

    #[tokio::test]
    async fn test_save_video_round_trips_every_field() {
        let repo = repository().await;
        let original = video("https://youtu.be/1", "First", "Zephyr");

        let record = repo.save_video(&original).await.unwrap();
        let loaded = repo.get_by_id(record.id()).await.unwrap().unwrap();

        assert_eq!(loaded.video(), &original);
        assert_eq!(loaded.id(), record.id());
    }

    #[tokio::test]
    async fn test_same_url_twice_is_duplicate() {
        let repo = repository().await;
        let original = video("https://youtu.be/1", "First", "Zephyr");
        repo.save_video(&original).await.unwrap();

        let error = repo.save_video(&original).await.unwrap_err();

        assert!(error.is_duplicate());
    }

    // ==================== Lookup ====================

    #[tokio::test]
    async fn test_get_by_url_and_title() {
        let repo = repository().await;
        repo.save_video(&video("https://youtu.be/1", "First", "Zephyr"))
            .await
            .unwrap();

        let by_url = repo.get_by_url("https://youtu.be/1").await.unwrap().unwrap();
        let by_title = repo.get_by_title("First").await.unwrap().unwrap();

        assert_eq!(by_url.id(), by_title.id());
        assert!(repo.get_by_url("https://youtu.be/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_channel_name_matches_fragment() {
        let repo = repository().await;
        repo.save_video(&video("https://youtu.be/1", "One", "Zephyr Music"))
            .await
            .unwrap();
        repo.save_video(&video("https://youtu.be/2", "Two", "Zephyr Talks"))
            .await
            .unwrap();
        repo.save_video(&video("https://youtu.be/3", "Three", "Other"))
            .await
            .unwrap();

        let found = repo.list_by_channel_name("zephyr").await.unwrap();

        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|r| r.video().channel_name().starts_with("Zephyr")));
    }

    #[tokio::test]
    async fn test_list_by_channel_name_treats_wildcards_literally() {
        let repo = repository().await;
        repo.save_video(&video("https://youtu.be/1", "One", "100% Rock"))
            .await
            .unwrap();
        repo.save_video(&video("https://youtu.be/2", "Two", "1000 Rocks"))
            .await
            .unwrap();

        let found = repo.list_by_channel_name("0% R").await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].video().channel_name(), "100% Rock");
    }
}
