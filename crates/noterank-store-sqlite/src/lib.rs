use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use noterank_core::{Candidate, MetricSpec, RecordStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS notes (
  path TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS note_metrics (
  path TEXT NOT NULL,
  metric TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (path, metric),
  FOREIGN KEY (path) REFERENCES notes(path)
);

CREATE TABLE IF NOT EXISTS metrics (
  name TEXT PRIMARY KEY,
  ascending INTEGER NOT NULL CHECK (ascending IN (0, 1)),
  position INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_note_metrics_metric ON note_metrics(metric);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteSummary {
    pub path: String,
    pub name: String,
    pub metrics: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteDetail {
    pub path: String,
    pub name: String,
    pub body: String,
    pub metrics: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredMetric {
    pub name: String,
    pub notes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_notes: usize,
    pub imported_metric_values: usize,
    pub invalid_frontmatter: usize,
}

impl SqliteStore {
    /// Open a SQLite-backed note store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert or replace one note.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_note(&mut self, path: &str, name: &str, body: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notes(path, name, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET name = excluded.name, body = excluded.body",
                params![path, name, body],
            )
            .with_context(|| format!("failed to upsert note {path}"))?;
        Ok(())
    }

    /// Load one note with its body and metric values.
    ///
    /// # Errors
    /// Returns an error when lookup fails.
    pub fn get_note(&self, path: &str) -> Result<Option<NoteDetail>> {
        let row = self
            .conn
            .prepare("SELECT name, body FROM notes WHERE path = ?1")?
            .query_row(params![path], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;

        match row {
            Some((name, body)) => {
                let metrics = self.note_metric_values(path)?;
                Ok(Some(NoteDetail { path: path.to_string(), name, body, metrics }))
            }
            None => Ok(None),
        }
    }

    /// List all notes with their metric values, ordered by path.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_notes(&self) -> Result<Vec<NoteSummary>> {
        let mut stmt =
            self.conn.prepare("SELECT path, name FROM notes ORDER BY path ASC")?;
        let mut rows = stmt.query([])?;
        let mut notes = Vec::new();

        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            let name: String = row.get(1)?;
            let metrics = self.note_metric_values(&path)?;
            notes.push(NoteSummary { path, name, metrics });
        }

        Ok(notes)
    }

    fn note_metric_values(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT metric, value FROM note_metrics WHERE path = ?1 ORDER BY metric ASC")?;
        let mut rows = stmt.query(params![path])?;
        let mut metrics = BTreeMap::new();

        while let Some(row) = rows.next()? {
            metrics.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }

        Ok(metrics)
    }

    /// Upsert one metric value on an existing note.
    ///
    /// # Errors
    /// Returns an error when the note does not exist or the write fails.
    pub fn set_metric_value(&mut self, path: &str, metric: &str, value: &str) -> Result<()> {
        let updated_at = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO note_metrics(path, metric, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path, metric) DO UPDATE
                 SET value = excluded.value, updated_at = excluded.updated_at",
                params![path, metric, value, updated_at],
            )
            .with_context(|| format!("failed to write metric '{metric}' for note {path}"))?;
        tracing::debug!(path, metric, value, "wrote metric value");
        Ok(())
    }

    /// List notes carrying a value for `metric`, ordered by path.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn metric_values(&self, metric: &str) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT notes.path, notes.name, note_metrics.value
             FROM note_metrics
             JOIN notes ON notes.path = note_metrics.path
             WHERE note_metrics.metric = ?1
             ORDER BY notes.path ASC",
        )?;
        let mut rows = stmt.query(params![metric])?;
        let mut values = Vec::new();

        while let Some(row) = rows.next()? {
            values.push((row.get(0)?, row.get(1)?, row.get(2)?));
        }

        Ok(values)
    }

    /// The ordered metric registry.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_metrics(&self) -> Result<Vec<MetricSpec>> {
        let mut stmt =
            self.conn.prepare("SELECT name, ascending FROM metrics ORDER BY position ASC")?;
        let mut rows = stmt.query([])?;
        let mut specs = Vec::new();

        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let ascending: i64 = row.get(1)?;
            specs.push(MetricSpec::new(name, ascending != 0));
        }

        Ok(specs)
    }

    /// Look up one registered metric by name.
    ///
    /// # Errors
    /// Returns an error when lookup fails.
    pub fn find_metric(&self, name: &str) -> Result<Option<MetricSpec>> {
        let ascending = self
            .conn
            .prepare("SELECT ascending FROM metrics WHERE name = ?1")?
            .query_row(params![name], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(ascending.map(|value| MetricSpec::new(name, value != 0)))
    }

    /// Register a metric at the end of the registry.
    ///
    /// # Errors
    /// Returns an error when the name is empty or already registered.
    pub fn add_metric(&mut self, spec: &MetricSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(anyhow!("metric name MUST be non-empty"));
        }
        if self.find_metric(&spec.name)?.is_some() {
            return Err(anyhow!("metric already registered: {}", spec.name));
        }

        self.conn
            .execute(
                "INSERT INTO metrics(name, ascending, position)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(position), 0) + 1 FROM metrics))",
                params![spec.name, i64::from(spec.ascending)],
            )
            .with_context(|| format!("failed to register metric {}", spec.name))?;
        Ok(())
    }

    /// Change the sort direction of a registered metric.
    ///
    /// # Errors
    /// Returns an error when the metric is not registered.
    pub fn update_metric(&mut self, spec: &MetricSpec) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE metrics SET ascending = ?2 WHERE name = ?1",
                params![spec.name, i64::from(spec.ascending)],
            )
            .with_context(|| format!("failed to update metric {}", spec.name))?;
        if updated == 0 {
            return Err(anyhow!("metric not registered: {}", spec.name));
        }
        Ok(())
    }

    /// Remove a metric from the registry. Stored note values stay in place.
    ///
    /// # Errors
    /// Returns an error when the metric is not registered.
    pub fn remove_metric(&mut self, name: &str) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM metrics WHERE name = ?1", params![name])
            .with_context(|| format!("failed to remove metric {name}"))?;
        if removed == 0 {
            return Err(anyhow!("metric not registered: {name}"));
        }
        Ok(())
    }

    /// Frontmatter keys usable as metrics: keys carried by more than two
    /// notes.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn discover_metrics(&self) -> Result<Vec<DiscoveredMetric>> {
        let mut stmt = self.conn.prepare(
            "SELECT metric, COUNT(*) FROM note_metrics
             GROUP BY metric HAVING COUNT(*) > 2
             ORDER BY metric ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut discovered = Vec::new();

        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let notes: i64 = row.get(1)?;
            discovered.push(DiscoveredMetric {
                name,
                notes: usize::try_from(notes).unwrap_or(usize::MAX),
            });
        }

        Ok(discovered)
    }

    /// Import every `.md` file under `dir` (recursively). The YAML
    /// frontmatter becomes metric values (scalar entries only), the rest of
    /// the file becomes the note body. Note paths are relative to `dir`.
    ///
    /// Files whose frontmatter fails to parse are imported body-only and
    /// counted in `invalid_frontmatter`.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be walked, a file cannot
    /// be read, or a write fails.
    pub fn import_dir(&mut self, dir: &Path) -> Result<ImportSummary> {
        let mut files = Vec::new();
        collect_markdown_files(dir, &mut files)
            .with_context(|| format!("failed to walk import directory {}", dir.display()))?;
        files.sort();

        let mut summary = ImportSummary::default();
        for file in files {
            let content = fs::read_to_string(&file)
                .with_context(|| format!("failed to read note file {}", file.display()))?;
            let relative = file.strip_prefix(dir).unwrap_or(&file);
            let path = relative.to_string_lossy().replace('\\', "/");
            let name = file
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());

            let (frontmatter, body) = split_frontmatter(&content);
            let metrics = match frontmatter {
                Some(raw) => match parse_frontmatter_metrics(raw) {
                    Ok(metrics) => metrics,
                    Err(err) => {
                        tracing::warn!(path = %path, error = %err, "skipping unparseable frontmatter");
                        summary.invalid_frontmatter += 1;
                        BTreeMap::new()
                    }
                },
                None => BTreeMap::new(),
            };

            self.upsert_note(&path, &name, body)?;
            for (metric, value) in &metrics {
                self.set_metric_value(&path, metric, value)?;
                summary.imported_metric_values += 1;
            }
            summary.imported_notes += 1;
        }

        tracing::debug!(
            notes = summary.imported_notes,
            values = summary.imported_metric_values,
            "imported notes from directory"
        );
        Ok(summary)
    }
}

impl RecordStore for SqliteStore {
    fn list_candidates(&self, metric: &str) -> Result<Vec<Candidate>, StoreError> {
        let values = self
            .metric_values(metric)
            .map_err(|err| StoreError(format!("{err:#}")))?;
        Ok(values
            .into_iter()
            .map(|(path, name, value)| Candidate::new(path, name, value))
            .collect())
    }

    fn read_content(&self, id: &str) -> Result<String, StoreError> {
        let note = self.get_note(id).map_err(|err| StoreError(format!("{err:#}")))?;
        match note {
            Some(detail) => Ok(detail.body),
            None => Err(StoreError(format!("note not found: {id}"))),
        }
    }

    fn write_metric(&mut self, id: &str, metric: &str, value: &str) -> Result<(), StoreError> {
        self.set_metric_value(id, metric, value)
            .map_err(|err| StoreError(format!("{err:#}")))
    }
}

/// Split a `---`-fenced YAML frontmatter block off the start of a note.
/// Returns the raw YAML (without fences) and the remaining body. Content
/// without a leading fence, or with an unterminated one, is all body.
#[must_use]
pub fn split_frontmatter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    let Some(after_open) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (None, content);
    };

    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }

    (None, content)
}

fn parse_frontmatter_metrics(raw: &str) -> Result<BTreeMap<String, String>> {
    let parsed: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(raw).context("frontmatter is not a YAML mapping")?;

    let mut metrics = BTreeMap::new();
    for (key, value) in parsed {
        if let Some(scalar) = yaml_scalar_to_string(&value) {
            metrics.insert(key, scalar);
        }
    }
    Ok(metrics)
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text.clone()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn collect_markdown_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_markdown_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .prepare("SELECT MAX(version) FROM schema_migrations")?
        .query_row([], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format current timestamp")
}
