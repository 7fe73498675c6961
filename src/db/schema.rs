//! Idempotent schema setup.
//!
//! Unlike the generic entity-trait schema sync this grew out of, there are only
//! ever seven tables here, so each gets its own `CREATE TABLE IF NOT EXISTS`
//! plus an explicit list of columns to backfill with `ALTER TABLE ... ADD COLUMN`
//! if they're missing. New columns get appended to their table's list; nothing
//! here ever needs to see the table's full current shape to decide what to add.

use sqlx::{Row, SqlitePool};

struct ColumnSpec {
    name: &'static str,
    ddl_type: &'static str,
}

const fn col(name: &'static str, ddl_type: &'static str) -> ColumnSpec {
    ColumnSpec { name, ddl_type }
}

struct TableSpec {
    name: &'static str,
    create_sql: &'static str,
    columns: &'static [ColumnSpec],
}

const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "videos",
        create_sql: "CREATE TABLE IF NOT EXISTS videos (video_id TEXT PRIMARY KEY)",
        columns: &[
            col("source_kind", "TEXT NOT NULL DEFAULT 'url'"),
            col("source_uri", "TEXT NOT NULL DEFAULT ''"),
            col("title", "TEXT"),
            col("description", "TEXT"),
            col("uploader", "TEXT"),
            col("channel_id", "TEXT"),
            col("duration_ms", "INTEGER"),
            col("upload_timestamp", "TEXT"),
            col("raw_metadata", "TEXT"),
            col("local_path", "TEXT"),
            col("language", "TEXT"),
            col("engine", "TEXT"),
            col("engine_version", "TEXT"),
            col("model_path", "TEXT"),
            col("output_formats", "TEXT NOT NULL DEFAULT '[]'"),
            col("enhancement_config", "TEXT"),
            col("status", "TEXT NOT NULL DEFAULT 'new'"),
            col("error", "TEXT"),
            col("created_at", "TEXT NOT NULL DEFAULT ''"),
            col("updated_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    },
    TableSpec {
        name: "transcripts",
        create_sql: "CREATE TABLE IF NOT EXISTS transcripts (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        columns: &[
            col("video_id", "TEXT NOT NULL DEFAULT ''"),
            col("model", "TEXT"),
            col("language", "TEXT"),
            col("text", "TEXT NOT NULL DEFAULT ''"),
            col("compact_json", "TEXT NOT NULL DEFAULT '{}'"),
            col("created_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    },
    TableSpec {
        name: "segments",
        create_sql: "CREATE TABLE IF NOT EXISTS segments (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        columns: &[
            col("video_id", "TEXT NOT NULL DEFAULT ''"),
            col("start_ms", "INTEGER NOT NULL DEFAULT 0"),
            col("end_ms", "INTEGER NOT NULL DEFAULT 0"),
            col("text", "TEXT NOT NULL DEFAULT ''"),
            col("avg_logprob", "REAL"),
            col("no_speech_prob", "REAL"),
        ],
    },
    TableSpec {
        name: "chapters",
        create_sql: "CREATE TABLE IF NOT EXISTS chapters (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        columns: &[
            col("video_id", "TEXT NOT NULL DEFAULT ''"),
            col("start_ms", "INTEGER NOT NULL DEFAULT 0"),
            col("end_ms", "INTEGER"),
            col("title", "TEXT NOT NULL DEFAULT 'Chapter'"),
        ],
    },
    TableSpec {
        name: "artifacts",
        create_sql: "CREATE TABLE IF NOT EXISTS artifacts (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        columns: &[
            col("video_id", "TEXT NOT NULL DEFAULT ''"),
            col("kind", "TEXT NOT NULL DEFAULT ''"),
            col("uri", "TEXT NOT NULL DEFAULT ''"),
            col("size_bytes", "INTEGER"),
            col("created_at", "TEXT NOT NULL DEFAULT ''"),
        ],
    },
    TableSpec {
        name: "enhancement_runs",
        create_sql:
            "CREATE TABLE IF NOT EXISTS enhancement_runs (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        columns: &[
            col("video_id", "TEXT NOT NULL DEFAULT ''"),
            col("status", "TEXT NOT NULL DEFAULT 'skipped'"),
            col("applied", "INTEGER NOT NULL DEFAULT 0"),
            col("mode", "TEXT NOT NULL DEFAULT 'auto'"),
            col("source_class", "TEXT"),
            col("snr_db", "REAL"),
            col("regime_count", "INTEGER"),
            col("analysis_duration_ms", "INTEGER"),
            col("processing_ms", "INTEGER"),
            col("metrics", "TEXT"),
            col("versions", "TEXT"),
            col("config", "TEXT"),
            col("started_at", "TEXT NOT NULL DEFAULT ''"),
            col("finished_at", "TEXT NOT NULL DEFAULT ''"),
            col("skip_reason", "TEXT"),
            col("error", "TEXT"),
        ],
    },
    TableSpec {
        name: "enhancement_segments",
        create_sql: "CREATE TABLE IF NOT EXISTS enhancement_segments (id INTEGER PRIMARY KEY AUTOINCREMENT)",
        columns: &[
            col("run_id", "INTEGER NOT NULL DEFAULT 0"),
            col("segment_index", "INTEGER NOT NULL DEFAULT 0"),
            col("start_ms", "INTEGER NOT NULL DEFAULT 0"),
            col("end_ms", "INTEGER NOT NULL DEFAULT 0"),
            col("dereverb_applied", "INTEGER NOT NULL DEFAULT 0"),
            col("denoise_applied", "INTEGER NOT NULL DEFAULT 0"),
            col("atten_lim_db", "REAL NOT NULL DEFAULT 0"),
            col("processing_ms", "INTEGER NOT NULL DEFAULT 0"),
            col("noise_rms_db", "REAL"),
            col("spectral_centroid_hz", "REAL"),
            col("speech_ratio", "REAL"),
        ],
    },
];

async fn existing_columns(pool: &SqlitePool, table: &str) -> anyhow::Result<Vec<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get::<String, _>("name")).collect())
}

async fn ensure_table(pool: &SqlitePool, spec: &TableSpec) -> anyhow::Result<()> {
    sqlx::query(spec.create_sql).execute(pool).await?;
    let present = existing_columns(pool, spec.name).await?;
    for column in spec.columns {
        if present.iter().any(|c| c == column.name) {
            continue;
        }
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            spec.name, column.name, column.ddl_type
        );
        sqlx::query(&ddl).execute(pool).await?;
    }
    Ok(())
}

/// Creates/backfills every base table. Safe to call on every startup.
pub async fn ensure_tables(pool: &SqlitePool) -> anyhow::Result<()> {
    for spec in TABLES {
        ensure_table(pool, spec).await?;
    }
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_video ON segments(video_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chapters_video ON chapters(video_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_video ON artifacts(video_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_enhancement_runs_video ON enhancement_runs(video_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_enhancement_segments_run ON enhancement_segments(run_id)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Rebuilds the segment full-text index: the `unicode61` tokenizer with
/// diacritics stripped, and triggers that keep `segments_fts` in lockstep with
/// `segments` CRUD (§4.1 "Triggers").
pub async fn rebuild_fts(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query("DROP TRIGGER IF EXISTS segments_fts_ai").execute(pool).await?;
    sqlx::query("DROP TRIGGER IF EXISTS segments_fts_ad").execute(pool).await?;
    sqlx::query("DROP TRIGGER IF EXISTS segments_fts_au").execute(pool).await?;
    sqlx::query("DROP TABLE IF EXISTS segments_fts").execute(pool).await?;

    sqlx::query(
        "CREATE VIRTUAL TABLE segments_fts USING fts5(
            text,
            video_id UNINDEXED,
            start_ms UNINDEXED,
            end_ms UNINDEXED,
            tokenize = 'unicode61 remove_diacritics 2'
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO segments_fts(rowid, text, video_id, start_ms, end_ms)
         SELECT id, text, video_id, start_ms, end_ms FROM segments",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TRIGGER segments_fts_ai AFTER INSERT ON segments BEGIN
            INSERT INTO segments_fts(rowid, text, video_id, start_ms, end_ms)
            VALUES (new.id, new.text, new.video_id, new.start_ms, new.end_ms);
         END",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TRIGGER segments_fts_ad AFTER DELETE ON segments BEGIN
            INSERT INTO segments_fts(segments_fts, rowid, text, video_id, start_ms, end_ms)
            VALUES ('delete', old.id, old.text, old.video_id, old.start_ms, old.end_ms);
         END",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TRIGGER segments_fts_au AFTER UPDATE ON segments BEGIN
            INSERT INTO segments_fts(segments_fts, rowid, text, video_id, start_ms, end_ms)
            VALUES ('delete', old.id, old.text, old.video_id, old.start_ms, old.end_ms);
            INSERT INTO segments_fts(rowid, text, video_id, start_ms, end_ms)
            VALUES (new.id, new.text, new.video_id, new.start_ms, new.end_ms);
         END",
    )
    .execute(pool)
    .await?;

    Ok(())
}
