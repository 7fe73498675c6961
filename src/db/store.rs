//! The operations the rest of the crate actually calls. Every query here is
//! built with `sqlx::query`/`sqlx::query_as` at runtime — no compile-time
//! `query!` macros, since there's no `DATABASE_URL` available at build time
//! for this crate's packaging story.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::models::{
    Artifact, ArtifactKind, Chapter, Channel, EnhancementRun, EnhancementSegment, SearchHit,
    Segment, SourceKind, Transcript, TranscriptListItem, Video, VideoStatus,
};
use super::sqlite_helpers::{
    bool_to_int, datetime_to_str, from_json_opt, int_to_bool, now_iso8601, str_to_datetime,
    to_json,
};
use super::{connect_pool, migrate};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database file and brings its schema up
    /// to date. A fresh handle is cheap to construct — this is the only place
    /// in the crate that knows the file lives on disk at all.
    pub async fn open(database_path: &Path) -> anyhow::Result<Self> {
        let pool = connect_pool(database_path).await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let pool = connect_pool(Path::new(":memory:")).await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- videos ---------------------------------------------------------

    pub async fn has_transcript(&self, video_id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM transcripts WHERE video_id = ? LIMIT 1")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert-or-update keyed by `video_id`. `created_at` is preserved across
    /// updates; `updated_at` always advances (§3.2 invariant 2).
    pub async fn upsert_video(&self, video: &Video) -> anyhow::Result<()> {
        let now = now_iso8601();
        sqlx::query(
            "INSERT INTO videos (
                video_id, source_kind, source_uri, title, description, uploader,
                channel_id, duration_ms, upload_timestamp, raw_metadata, local_path, language,
                engine, engine_version, model_path, output_formats, enhancement_config,
                status, error, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(video_id) DO UPDATE SET
                source_kind = excluded.source_kind,
                source_uri = excluded.source_uri,
                title = excluded.title,
                description = excluded.description,
                uploader = excluded.uploader,
                channel_id = excluded.channel_id,
                duration_ms = excluded.duration_ms,
                upload_timestamp = excluded.upload_timestamp,
                raw_metadata = excluded.raw_metadata,
                local_path = excluded.local_path,
                language = excluded.language,
                engine = excluded.engine,
                engine_version = excluded.engine_version,
                model_path = excluded.model_path,
                output_formats = excluded.output_formats,
                enhancement_config = excluded.enhancement_config,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at",
        )
        .bind(&video.video_id)
        .bind(video.source_kind.as_str())
        .bind(&video.source_uri)
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.uploader)
        .bind(&video.channel_id)
        .bind(video.duration_ms)
        .bind(&video.upload_timestamp)
        .bind(video.raw_metadata.as_ref().map(to_json))
        .bind(&video.local_path)
        .bind(&video.language)
        .bind(&video.engine)
        .bind(&video.engine_version)
        .bind(&video.model_path)
        .bind(to_json(&video.output_formats))
        .bind(video.enhancement_config.as_ref().map(to_json))
        .bind(video.status.as_str())
        .bind(&video.error)
        .bind(datetime_to_str(video.created_at))
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_video_status(
        &self,
        video_id: &str,
        status: VideoStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        update_video_status_exec(&self.pool, video_id, status, error).await
    }

    pub async fn get_video(&self, video_id: &str) -> anyhow::Result<Option<Video>> {
        let row = sqlx::query("SELECT * FROM videos WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_video(&r)).transpose()
    }

    pub async fn find_video_by_source(&self, source_uri: &str) -> anyhow::Result<Option<Video>> {
        let row = sqlx::query("SELECT * FROM videos WHERE source_uri = ? ORDER BY created_at DESC LIMIT 1")
            .bind(source_uri)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_video(&r)).transpose()
    }

    pub async fn list_videos(
        &self,
        status: Option<VideoStatus>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Video>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM videos WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(s.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM videos ORDER BY created_at DESC LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_video).collect()
    }

    // ---- transcripts ------------------------------------------------------

    pub async fn upsert_transcript(&self, transcript: &Transcript) -> anyhow::Result<()> {
        upsert_transcript_exec(&self.pool, transcript).await
    }

    pub async fn get_transcript(&self, video_id: &str) -> anyhow::Result<Option<Transcript>> {
        let row = sqlx::query("SELECT * FROM transcripts WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_transcript(&r)).transpose()
    }

    // ---- segments ----------------------------------------------------------

    /// Replaces every segment for `video_id` in one transaction — re-transcribing
    /// a video must leave no stale segments behind (§3.2 invariant 5).
    pub async fn replace_segments(&self, video_id: &str, segments: &[Segment]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_segments_exec(&mut *tx, video_id).await?;
        for seg in segments {
            insert_segment_exec(&mut *tx, seg).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_segments(&self, video_id: &str) -> anyhow::Result<Vec<Segment>> {
        let rows = sqlx::query("SELECT * FROM segments WHERE video_id = ? ORDER BY start_ms ASC")
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_segment).collect()
    }

    // ---- chapters ------------------------------------------------------------

    pub async fn replace_chapters(&self, video_id: &str, chapters: &[Chapter]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chapters WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        for ch in chapters {
            sqlx::query(
                "INSERT INTO chapters (video_id, start_ms, end_ms, title) VALUES (?, ?, ?, ?)",
            )
            .bind(&ch.video_id)
            .bind(ch.start_ms)
            .bind(ch.end_ms)
            .bind(&ch.title)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_chapters(&self, video_id: &str) -> anyhow::Result<Vec<Chapter>> {
        let rows = sqlx::query("SELECT * FROM chapters WHERE video_id = ? ORDER BY start_ms ASC")
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chapter).collect()
    }

    // ---- artifacts -------------------------------------------------------------

    pub async fn insert_artifact(&self, artifact: &Artifact) -> anyhow::Result<()> {
        insert_artifact_exec(&self.pool, artifact).await
    }

    pub async fn get_artifacts(&self, video_id: &str) -> anyhow::Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE video_id = ? ORDER BY created_at ASC")
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_artifact).collect()
    }

    pub async fn get_artifact_by_kind(
        &self,
        video_id: &str,
        kind: ArtifactKind,
    ) -> anyhow::Result<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT * FROM artifacts WHERE video_id = ? AND kind = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(video_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_artifact(&r)).transpose()
    }

    // ---- enhancement telemetry ----------------------------------------------------

    pub async fn insert_enhancement_run(&self, run: &EnhancementRun) -> anyhow::Result<i64> {
        insert_enhancement_run_exec(&self.pool, run).await
    }

    pub async fn insert_enhancement_segments(
        &self,
        segments: &[EnhancementSegment],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for seg in segments {
            insert_enhancement_segment_exec(&mut *tx, seg.run_id, seg).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_enhancement_runs(&self, video_id: &str) -> anyhow::Result<Vec<EnhancementRun>> {
        let rows = sqlx::query(
            "SELECT * FROM enhancement_runs WHERE video_id = ? ORDER BY started_at DESC",
        )
        .bind(video_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_enhancement_run).collect()
    }

    /// Persists a finished transcription item — transcript, segments,
    /// artifacts, optional enhancement telemetry, and the `done` status
    /// transition — in a single transaction, so a crash mid-write can never
    /// leave a video stuck `processing` with its transcript already on disk
    /// (§4.7 step 11).
    pub async fn finalize_transcription(
        &self,
        video_id: &str,
        transcript: &Transcript,
        segments: &[Segment],
        artifacts: &[Artifact],
        enhancement_run: Option<&EnhancementRun>,
        enhancement_segments: &[EnhancementSegment],
    ) -> anyhow::Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        upsert_transcript_exec(&mut *tx, transcript).await?;
        delete_segments_exec(&mut *tx, video_id).await?;
        for seg in segments {
            insert_segment_exec(&mut *tx, seg).await?;
        }
        for artifact in artifacts {
            insert_artifact_exec(&mut *tx, artifact).await?;
        }

        let run_id = if let Some(run) = enhancement_run {
            let id = insert_enhancement_run_exec(&mut *tx, run).await?;
            for seg in enhancement_segments {
                insert_enhancement_segment_exec(&mut *tx, id, seg).await?;
            }
            Some(id)
        } else {
            None
        };

        update_video_status_exec(&mut *tx, video_id, VideoStatus::Done, None).await?;

        tx.commit().await?;
        Ok(run_id)
    }

    // ---- deletion ------------------------------------------------------------

    /// Clears everything derived from a video (transcript, segments, chapters,
    /// artifacts, enhancement telemetry) but keeps the `videos` row itself, so a
    /// retry has something to resume from (§3.2 invariant 4, §8 scenario 6).
    pub async fn delete_video_data(&self, video_id: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM transcripts WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM segments WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chapters WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM artifacts WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM enhancement_segments WHERE run_id IN
                (SELECT id FROM enhancement_runs WHERE video_id = ?)",
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM enhancement_runs WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// [Self::delete_video_data] plus the `videos` row itself (§3.2 invariant 5).
    pub async fn delete_video_fully(&self, video_id: &str) -> anyhow::Result<()> {
        self.delete_video_data(video_id).await?;
        sqlx::query("DELETE FROM videos WHERE video_id = ?")
            .bind(video_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- search --------------------------------------------------------------

    /// FTS5 `MATCH` against segment text, ranked by `bm25`. A malformed query
    /// (unbalanced quotes, a bare `NOT`) surfaces as `InvalidQuery` rather than
    /// panicking or returning nothing (§4.1).
    pub async fn search_segments(&self, query: &str, limit: i64) -> anyhow::Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            "SELECT video_id, start_ms, end_ms, text, bm25(segments_fts) AS score
             FROM segments_fts WHERE segments_fts MATCH ? ORDER BY score LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(SearchHit {
                    video_id: r.try_get("video_id")?,
                    start_ms: r.try_get("start_ms")?,
                    end_ms: r.try_get("end_ms")?,
                    text: r.try_get("text")?,
                    score: r.try_get::<f64, _>("score")?,
                })
            })
            .collect()
    }

    // ---- analytics -------------------------------------------------------------

    pub async fn count_videos_by_status(&self) -> anyhow::Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as c FROM videos GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::new();
        for row in rows {
            out.insert(row.try_get::<String, _>("status")?, row.try_get::<i64, _>("c")?);
        }
        Ok(out)
    }

    pub async fn total_duration_ms(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COALESCE(SUM(duration_ms), 0) as total FROM videos WHERE status = 'done'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn count_segments(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM segments")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    pub async fn count_videos(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM videos").fetch_one(&self.pool).await?;
        Ok(row.try_get("c")?)
    }

    pub async fn count_transcripts(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM transcripts").fetch_one(&self.pool).await?;
        Ok(row.try_get("c")?)
    }

    /// Transcripts whose video has at least one resolvable audio source — a
    /// `source_audio`/`audio_wav_enhanced`/`audio_wav` artifact, or a
    /// `local_path` (§6.1 `GET /api/stats` `audioBackedTranscripts`).
    pub async fn count_audio_backed_transcripts(&self) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM transcripts t JOIN videos v ON v.video_id = t.video_id
             WHERE v.local_path IS NOT NULL
                OR EXISTS (
                    SELECT 1 FROM artifacts a WHERE a.video_id = t.video_id
                    AND a.kind IN ('source_audio', 'audio_wav_enhanced', 'audio_wav')
                )",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("c")?)
    }

    pub async fn distinct_uploaders(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT uploader, COUNT(*) as c FROM videos
             WHERE uploader IS NOT NULL AND uploader != ''
             GROUP BY uploader ORDER BY uploader ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Ok((r.try_get::<String, _>("uploader")?, r.try_get::<i64, _>("c")?)))
            .collect()
    }

    pub async fn enhancement_application_rate(&self) -> anyhow::Result<f64> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(applied), 0) as applied,
                COUNT(*) as total
             FROM enhancement_runs",
        )
        .fetch_one(&self.pool)
        .await?;
        let applied: i64 = row.try_get("applied")?;
        let total: i64 = row.try_get("total")?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(applied as f64 / total as f64)
    }

    // ---- transcript listing / channels ---------------------------------------

    /// Joins `videos`/`transcripts`, newest-first, optionally narrowed by a
    /// full-text query (matched against [Self::search_segments]'s shadow
    /// table) and/or `channel_id` (§6.1 `GET /api/transcripts`).
    pub async fn list_transcripts(
        &self,
        limit: i64,
        offset: i64,
        q: Option<&str>,
        channel_id: Option<&str>,
    ) -> anyhow::Result<Vec<TranscriptListItem>> {
        let mut sql = String::from(
            "SELECT v.video_id, v.title, v.uploader, v.channel_id, v.language, v.duration_ms,
                    v.status, t.model, t.text, t.created_at
             FROM transcripts t JOIN videos v ON v.video_id = t.video_id",
        );
        let mut conditions = Vec::new();
        if q.is_some() {
            conditions.push(
                "t.video_id IN (SELECT video_id FROM segments_fts WHERE segments_fts MATCH ?)",
            );
        }
        if channel_id.is_some() {
            conditions.push("v.channel_id = ?");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY t.created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(q) = q {
            query = query.bind(q);
        }
        if let Some(c) = channel_id {
            query = query.bind(c);
        }
        query = query.bind(limit).bind(offset);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_transcript_list_item).collect()
    }

    pub async fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT channel_id, uploader, COUNT(*) as c FROM videos
             WHERE channel_id IS NOT NULL AND channel_id != ''
             GROUP BY channel_id, uploader ORDER BY uploader ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Channel {
                    channel_id: r.try_get("channel_id")?,
                    uploader: r.try_get("uploader")?,
                    video_count: r.try_get::<i64, _>("c")?,
                })
            })
            .collect()
    }

    // ---- analytics aggregates (§6.5) ------------------------------------------

    /// 30-day daily video-creation counts, keyed by the `YYYY-MM-DD` date
    /// prefix of `created_at`. Days with no rows are simply absent; the
    /// caller backfills zeros (§6.5 "30-day daily series backfilled with
    /// zeros").
    pub async fn daily_video_counts(&self, since: chrono::DateTime<Utc>) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT substr(created_at, 1, 10) as day, COUNT(*) as c
             FROM videos WHERE created_at >= ? GROUP BY day ORDER BY day ASC",
        )
        .bind(datetime_to_str(since))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Ok((r.try_get::<String, _>("day")?, r.try_get::<i64, _>("c")?)))
            .collect()
    }

    pub async fn language_distribution(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT COALESCE(NULLIF(language, ''), 'unknown') as lang, COUNT(*) as c
             FROM transcripts GROUP BY lang ORDER BY c DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| Ok((r.try_get::<String, _>("lang")?, r.try_get::<i64, _>("c")?)))
            .collect()
    }

    pub async fn source_kind_distribution(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT source_kind, COUNT(*) as c FROM videos GROUP BY source_kind")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| Ok((r.try_get::<String, _>("source_kind")?, r.try_get::<i64, _>("c")?)))
            .collect()
    }

    pub async fn enhancement_outcome_distribution(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) as c FROM enhancement_runs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| Ok((r.try_get::<String, _>("status")?, r.try_get::<i64, _>("c")?)))
            .collect()
    }

    /// Counts over the fixed buckets of §6.5: `[<5m, 5-15m, 15-30m, 30-60m, 60m+]`.
    pub async fn duration_buckets(&self) -> anyhow::Result<[i64; 5]> {
        let row = sqlx::query(
            "SELECT
                SUM(CASE WHEN duration_ms < 300000 THEN 1 ELSE 0 END) as b0,
                SUM(CASE WHEN duration_ms >= 300000 AND duration_ms < 900000 THEN 1 ELSE 0 END) as b1,
                SUM(CASE WHEN duration_ms >= 900000 AND duration_ms < 1800000 THEN 1 ELSE 0 END) as b2,
                SUM(CASE WHEN duration_ms >= 1800000 AND duration_ms < 3600000 THEN 1 ELSE 0 END) as b3,
                SUM(CASE WHEN duration_ms >= 3600000 THEN 1 ELSE 0 END) as b4
             FROM videos WHERE duration_ms IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok([
            row.try_get::<Option<i64>, _>("b0")?.unwrap_or(0),
            row.try_get::<Option<i64>, _>("b1")?.unwrap_or(0),
            row.try_get::<Option<i64>, _>("b2")?.unwrap_or(0),
            row.try_get::<Option<i64>, _>("b3")?.unwrap_or(0),
            row.try_get::<Option<i64>, _>("b4")?.unwrap_or(0),
        ])
    }

    /// Per-video wall-clock (`updated_at - created_at`) for `done` videos,
    /// newest-first, used for the analytics "per-video job wall-clock series".
    pub async fn job_wallclock_series(&self, limit: i64) -> anyhow::Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT video_id, created_at, updated_at FROM videos
             WHERE status = 'done' ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let video_id: String = r.try_get("video_id")?;
                let created = str_to_datetime(&r.try_get::<String, _>("created_at")?)?;
                let updated = str_to_datetime(&r.try_get::<String, _>("updated_at")?)?;
                Ok((video_id, (updated - created).num_milliseconds().max(0)))
            })
            .collect()
    }

    /// Most recent enhancement runs across all videos, newest-first — backs
    /// the analytics "per-run enhancement timing/speech/SNR series".
    pub async fn list_enhancement_runs(&self, limit: i64) -> anyhow::Result<Vec<EnhancementRun>> {
        let rows = sqlx::query("SELECT * FROM enhancement_runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_enhancement_run).collect()
    }
}

// ---- executor-generic statement bodies --------------------------------
//
// Each of these runs one statement against anything implementing
// `sqlx::Executor` — a bare `&SqlitePool` (auto-committed) or `&mut *tx`
// (composed into a larger transaction). The public `Store` methods above
// bind to the pool; `finalize_transcription` composes the same bodies
// inside one transaction.

async fn upsert_transcript_exec<'c, E>(executor: E, transcript: &Transcript) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO transcripts (video_id, model, language, text, compact_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(video_id) DO UPDATE SET
            model = excluded.model,
            language = excluded.language,
            text = excluded.text,
            compact_json = excluded.compact_json,
            created_at = excluded.created_at",
    )
    .bind(&transcript.video_id)
    .bind(&transcript.model)
    .bind(&transcript.language)
    .bind(&transcript.text)
    .bind(to_json(&transcript.compact_json))
    .bind(datetime_to_str(transcript.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

async fn delete_segments_exec<'c, E>(executor: E, video_id: &str) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query("DELETE FROM segments WHERE video_id = ?")
        .bind(video_id)
        .execute(executor)
        .await?;
    Ok(())
}

async fn insert_segment_exec<'c, E>(executor: E, seg: &Segment) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO segments (video_id, start_ms, end_ms, text, avg_logprob, no_speech_prob)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&seg.video_id)
    .bind(seg.start_ms)
    .bind(seg.end_ms)
    .bind(&seg.text)
    .bind(seg.avg_logprob)
    .bind(seg.no_speech_prob)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_artifact_exec<'c, E>(executor: E, artifact: &Artifact) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO artifacts (video_id, kind, uri, size_bytes, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&artifact.video_id)
    .bind(artifact.kind.as_str())
    .bind(&artifact.uri)
    .bind(artifact.size_bytes)
    .bind(datetime_to_str(artifact.created_at))
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_enhancement_run_exec<'c, E>(executor: E, run: &EnhancementRun) -> anyhow::Result<i64>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO enhancement_runs (
            video_id, status, applied, mode, source_class, snr_db, regime_count,
            analysis_duration_ms, processing_ms, metrics, versions, config,
            started_at, finished_at, skip_reason, error
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&run.video_id)
    .bind(run.status.as_str())
    .bind(bool_to_int(run.applied))
    .bind(&run.mode)
    .bind(&run.source_class)
    .bind(run.snr_db)
    .bind(run.regime_count)
    .bind(run.analysis_duration_ms)
    .bind(run.processing_ms)
    .bind(run.metrics.as_ref().map(to_json))
    .bind(run.versions.as_ref().map(to_json))
    .bind(run.config.as_ref().map(to_json))
    .bind(datetime_to_str(run.started_at))
    .bind(datetime_to_str(run.finished_at))
    .bind(&run.skip_reason)
    .bind(&run.error)
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn insert_enhancement_segment_exec<'c, E>(
    executor: E,
    run_id: i64,
    seg: &EnhancementSegment,
) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO enhancement_segments (
            run_id, segment_index, start_ms, end_ms, dereverb_applied,
            denoise_applied, atten_lim_db, processing_ms, noise_rms_db,
            spectral_centroid_hz, speech_ratio
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(seg.segment_index)
    .bind(seg.start_ms)
    .bind(seg.end_ms)
    .bind(bool_to_int(seg.dereverb_applied))
    .bind(bool_to_int(seg.denoise_applied))
    .bind(seg.atten_lim_db)
    .bind(seg.processing_ms)
    .bind(seg.noise_rms_db)
    .bind(seg.spectral_centroid_hz)
    .bind(seg.speech_ratio)
    .execute(executor)
    .await?;
    Ok(())
}

async fn update_video_status_exec<'c, E>(
    executor: E,
    video_id: &str,
    status: VideoStatus,
    error: Option<&str>,
) -> anyhow::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query("UPDATE videos SET status = ?, error = ?, updated_at = ? WHERE video_id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(now_iso8601())
        .bind(video_id)
        .execute(executor)
        .await?;
    Ok(())
}

fn row_to_video(row: &SqliteRow) -> anyhow::Result<Video> {
    Ok(Video {
        video_id: row.try_get("video_id")?,
        source_kind: SourceKind::from_str(&row.try_get::<String, _>("source_kind")?),
        source_uri: row.try_get("source_uri")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        uploader: row.try_get("uploader")?,
        channel_id: row.try_get("channel_id")?,
        duration_ms: row.try_get("duration_ms")?,
        upload_timestamp: row.try_get("upload_timestamp")?,
        raw_metadata: from_json_opt(row.try_get::<Option<String>, _>("raw_metadata")?.as_deref())?,
        local_path: row.try_get("local_path")?,
        language: row.try_get("language")?,
        engine: row.try_get("engine")?,
        engine_version: row.try_get("engine_version")?,
        model_path: row.try_get("model_path")?,
        output_formats: from_json_opt(Some(&row.try_get::<String, _>("output_formats")?))?
            .unwrap_or_default(),
        enhancement_config: from_json_opt(
            row.try_get::<Option<String>, _>("enhancement_config")?.as_deref(),
        )?,
        status: VideoStatus::from_str(&row.try_get::<String, _>("status")?),
        error: row.try_get("error")?,
        created_at: str_to_datetime(&row.try_get::<String, _>("created_at")?)
            .unwrap_or_else(|_| Utc::now()),
        updated_at: str_to_datetime(&row.try_get::<String, _>("updated_at")?)
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_transcript(row: &SqliteRow) -> anyhow::Result<Transcript> {
    Ok(Transcript {
        video_id: row.try_get("video_id")?,
        model: row.try_get("model")?,
        language: row.try_get("language")?,
        text: row.try_get("text")?,
        compact_json: from_json_opt(Some(&row.try_get::<String, _>("compact_json")?))?
            .unwrap_or(serde_json::Value::Null),
        created_at: str_to_datetime(&row.try_get::<String, _>("created_at")?)
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_segment(row: &SqliteRow) -> anyhow::Result<Segment> {
    Ok(Segment {
        video_id: row.try_get("video_id")?,
        start_ms: row.try_get("start_ms")?,
        end_ms: row.try_get("end_ms")?,
        text: row.try_get("text")?,
        avg_logprob: row.try_get("avg_logprob")?,
        no_speech_prob: row.try_get("no_speech_prob")?,
    })
}

fn row_to_chapter(row: &SqliteRow) -> anyhow::Result<Chapter> {
    Ok(Chapter {
        video_id: row.try_get("video_id")?,
        start_ms: row.try_get("start_ms")?,
        end_ms: row.try_get("end_ms")?,
        title: row.try_get("title")?,
    })
}

fn row_to_artifact(row: &SqliteRow) -> anyhow::Result<Artifact> {
    let kind_str: String = row.try_get("kind")?;
    Ok(Artifact {
        video_id: row.try_get("video_id")?,
        kind: ArtifactKind::from_str(&kind_str)
            .ok_or_else(|| anyhow::anyhow!("unknown artifact kind '{kind_str}'"))?,
        uri: row.try_get("uri")?,
        size_bytes: row.try_get("size_bytes")?,
        created_at: str_to_datetime(&row.try_get::<String, _>("created_at")?)
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_transcript_list_item(row: &SqliteRow) -> anyhow::Result<TranscriptListItem> {
    Ok(TranscriptListItem {
        video_id: row.try_get("video_id")?,
        title: row.try_get("title")?,
        uploader: row.try_get("uploader")?,
        channel_id: row.try_get("channel_id")?,
        language: row.try_get("language")?,
        duration_ms: row.try_get("duration_ms")?,
        status: VideoStatus::from_str(&row.try_get::<String, _>("status")?),
        model: row.try_get("model")?,
        text: row.try_get("text")?,
        created_at: str_to_datetime(&row.try_get::<String, _>("created_at")?)
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_enhancement_run(row: &SqliteRow) -> anyhow::Result<EnhancementRun> {
    use super::models::EnhancementStatus;
    Ok(EnhancementRun {
        id: Some(row.try_get("id")?),
        video_id: row.try_get("video_id")?,
        status: EnhancementStatus::from_str(&row.try_get::<String, _>("status")?),
        applied: int_to_bool(row.try_get("applied")?),
        mode: row.try_get("mode")?,
        source_class: row.try_get("source_class")?,
        snr_db: row.try_get("snr_db")?,
        regime_count: row.try_get("regime_count")?,
        analysis_duration_ms: row.try_get("analysis_duration_ms")?,
        processing_ms: row.try_get("processing_ms")?,
        metrics: from_json_opt(row.try_get::<Option<String>, _>("metrics")?.as_deref())?,
        versions: from_json_opt(row.try_get::<Option<String>, _>("versions")?.as_deref())?,
        config: from_json_opt(row.try_get::<Option<String>, _>("config")?.as_deref())?,
        started_at: str_to_datetime(&row.try_get::<String, _>("started_at")?)
            .unwrap_or_else(|_| Utc::now()),
        finished_at: str_to_datetime(&row.try_get::<String, _>("finished_at")?)
            .unwrap_or_else(|_| Utc::now()),
        skip_reason: row.try_get("skip_reason")?,
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::SourceKind;

    fn sample_video(id: &str) -> Video {
        let now = Utc::now();
        Video {
            video_id: id.to_string(),
            source_kind: SourceKind::Url,
            source_uri: format!("https://example.com/{id}"),
            title: Some("Sample".to_string()),
            description: None,
            uploader: None,
            channel_id: None,
            duration_ms: Some(60_000),
            upload_timestamp: None,
            raw_metadata: None,
            local_path: None,
            language: Some("en".to_string()),
            engine: Some("whisperx".to_string()),
            engine_version: None,
            model_path: None,
            output_formats: vec!["srt".to_string(), "txt".to_string()],
            enhancement_config: None,
            status: VideoStatus::New,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_video(&sample_video("v1")).await.unwrap();
        let fetched = store.get_video("v1").await.unwrap().unwrap();
        assert_eq!(fetched.video_id, "v1");
        assert_eq!(fetched.output_formats, vec!["srt", "txt"]);
        assert_eq!(fetched.status, VideoStatus::New);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_video_id() {
        let store = Store::open_in_memory().await.unwrap();
        let mut v = sample_video("v1");
        store.upsert_video(&v).await.unwrap();
        v.title = Some("Renamed".to_string());
        store.upsert_video(&v).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM videos")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .try_get("c")
            .unwrap();
        assert_eq!(count, 1);

        let fetched = store.get_video("v1").await.unwrap().unwrap();
        assert_eq!(fetched.title, Some("Renamed".to_string()));
    }

    #[tokio::test]
    async fn update_status_sets_error_and_advances_updated_at() {
        let store = Store::open_in_memory().await.unwrap();
        let v = sample_video("v1");
        let created_at = v.updated_at;
        store.upsert_video(&v).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .update_video_status("v1", VideoStatus::Error, Some("boom"))
            .await
            .unwrap();

        let fetched = store.get_video("v1").await.unwrap().unwrap();
        assert_eq!(fetched.status, VideoStatus::Error);
        assert_eq!(fetched.error, Some("boom".to_string()));
        assert!(fetched.updated_at >= created_at);
    }

    #[tokio::test]
    async fn replace_segments_clears_stale_rows() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_video(&sample_video("v1")).await.unwrap();

        let first = vec![Segment {
            video_id: "v1".into(),
            start_ms: 0,
            end_ms: 1000,
            text: "first pass".into(),
            avg_logprob: None,
            no_speech_prob: None,
        }];
        store.replace_segments("v1", &first).await.unwrap();
        assert_eq!(store.get_segments("v1").await.unwrap().len(), 1);

        let second = vec![
            Segment {
                video_id: "v1".into(),
                start_ms: 0,
                end_ms: 500,
                text: "re-run a".into(),
                avg_logprob: None,
                no_speech_prob: None,
            },
            Segment {
                video_id: "v1".into(),
                start_ms: 500,
                end_ms: 1000,
                text: "re-run b".into(),
                avg_logprob: None,
                no_speech_prob: None,
            },
        ];
        store.replace_segments("v1", &second).await.unwrap();
        let got = store.get_segments("v1").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].text, "re-run a");
    }

    #[tokio::test]
    async fn search_segments_finds_by_text() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_video(&sample_video("v1")).await.unwrap();
        store
            .replace_segments(
                "v1",
                &[Segment {
                    video_id: "v1".into(),
                    start_ms: 0,
                    end_ms: 2000,
                    text: "the quick brown fox".into(),
                    avg_logprob: None,
                    no_speech_prob: None,
                }],
            )
            .await
            .unwrap();

        let hits = store.search_segments("brown", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].video_id, "v1");
    }

    #[tokio::test]
    async fn search_segments_rejects_malformed_query() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.search_segments("\"unterminated", 10).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn delete_video_data_keeps_video_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_video(&sample_video("v1")).await.unwrap();
        store
            .replace_segments(
                "v1",
                &[Segment {
                    video_id: "v1".into(),
                    start_ms: 0,
                    end_ms: 1000,
                    text: "hi".into(),
                    avg_logprob: None,
                    no_speech_prob: None,
                }],
            )
            .await
            .unwrap();

        store.delete_video_data("v1").await.unwrap();
        assert!(store.get_video("v1").await.unwrap().is_some());
        assert!(store.get_segments("v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_video_fully_removes_video_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_video(&sample_video("v1")).await.unwrap();
        store.delete_video_fully("v1").await.unwrap();
        assert!(store.get_video("v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_videos_by_status_groups_correctly() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_video(&sample_video("v1")).await.unwrap();
        let mut v2 = sample_video("v2");
        v2.status = VideoStatus::Done;
        store.upsert_video(&v2).await.unwrap();

        let counts = store.count_videos_by_status().await.unwrap();
        assert_eq!(counts.get("new"), Some(&1));
        assert_eq!(counts.get("done"), Some(&1));
    }
}
