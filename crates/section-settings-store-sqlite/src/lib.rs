use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};
use section_settings_core::{
    SectionId, SectionNode, SectionRepository, SectionSettings, SettingsError, UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// `parent_id` carries no foreign key: sections are created and deleted by
// other components, and a dangling parent is tolerated as a root.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sections (
  section_id TEXT PRIMARY KEY,
  parent_id TEXT,
  title TEXT NOT NULL,
  settings_json TEXT NOT NULL,
  visible_assignees_json TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 0),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sections_parent ON sections(parent_id);
";

const SELECT_SECTION_COLUMNS: &str =
    "SELECT section_id, parent_id, title, settings_json, visible_assignees_json, revision
     FROM sections";

pub struct SqliteSectionStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DanglingParent {
    pub section_id: SectionId,
    pub parent_id: SectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub dangling_parents: Vec<DanglingParent>,
    pub schema_status: SchemaStatus,
}

impl SqliteSectionStore {
    /// Open a SQLite-backed section store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
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
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied section store migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, dangling-parent, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let dangling_parents = if table_exists(&self.conn, "sections")? {
            self.dangling_parents()?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            dangling_parents,
            schema_status,
        })
    }

    fn dangling_parents(&self) -> Result<Vec<DanglingParent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT child.section_id, child.parent_id
                 FROM sections AS child
                 LEFT JOIN sections AS parent ON parent.section_id = child.parent_id
                 WHERE child.parent_id IS NOT NULL AND parent.section_id IS NULL
                 ORDER BY child.section_id ASC",
            )
            .context("failed to prepare dangling parent probe")?;
        let mut rows = stmt.query([])?;

        let mut dangling = Vec::new();
        while let Some(row) = rows.next()? {
            let section_id: String = row.get(0)?;
            let parent_id: String = row.get(1)?;
            dangling.push(DanglingParent {
                section_id: section_id.parse()?,
                parent_id: parent_id.parse()?,
            });
        }
        Ok(dangling)
    }

    fn load_sections(&self, filter: Option<SectionId>) -> Result<Vec<SectionNode>> {
        let mut nodes = Vec::new();
        if let Some(section_id) = filter {
            let mut stmt = self
                .conn
                .prepare(&format!("{SELECT_SECTION_COLUMNS} WHERE section_id = ?1"))?;
            let mut rows = stmt.query(params![section_id.to_string()])?;
            while let Some(row) = rows.next()? {
                nodes.push(decode_section(row)?);
            }
        } else {
            let mut stmt =
                self.conn.prepare(&format!("{SELECT_SECTION_COLUMNS} ORDER BY section_id ASC"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                nodes.push(decode_section(row)?);
            }
        }
        Ok(nodes)
    }

    fn stored_revision(&self, section_id: SectionId) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT revision FROM sections WHERE section_id = ?1",
                params![section_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read section revision")
    }
}

impl SectionRepository for SqliteSectionStore {
    fn fetch_by_id(&self, id: SectionId) -> Result<Option<SectionNode>, SettingsError> {
        let mut nodes = self
            .load_sections(Some(id))
            .with_context(|| format!("failed to load forum section {id}"))?;
        Ok(nodes.pop())
    }

    fn fetch_all(&self) -> Result<Vec<SectionNode>, SettingsError> {
        Ok(self.load_sections(None).context("failed to load forum sections")?)
    }

    fn save(&self, node: &SectionNode) -> Result<u64, SettingsError> {
        let expected = revision_to_sql(node.revision)?;
        let next_revision = node.revision + 1;
        let updated = self
            .conn
            .execute(
                "UPDATE sections
                 SET parent_id = ?1, title = ?2, settings_json = ?3,
                     visible_assignees_json = ?4, revision = ?5, updated_at = ?6
                 WHERE section_id = ?7 AND revision = ?8",
                params![
                    node.parent.map(|parent| parent.to_string()),
                    node.title,
                    encode_settings(&node.settings)?,
                    encode_assignees(&node.visible_assignees)?,
                    revision_to_sql(next_revision)?,
                    now_rfc3339()?,
                    node.id.to_string(),
                    expected,
                ],
            )
            .with_context(|| format!("failed to save forum section {}", node.id))?;

        if updated == 0 {
            return match self.stored_revision(node.id)? {
                Some(_) => Err(SettingsError::Conflict {
                    section_id: node.id,
                    expected_revision: node.revision,
                }),
                None => Err(SettingsError::NotFound(node.id)),
            };
        }

        tracing::debug!(section_id = %node.id, revision = next_revision, "saved forum section");
        Ok(next_revision)
    }

    fn insert(&self, node: &SectionNode) -> Result<(), SettingsError> {
        if self.stored_revision(node.id)?.is_some() {
            return Err(SettingsError::Validation(format!("section {} already exists", node.id)));
        }

        self.conn
            .execute(
                "INSERT INTO sections(
                    section_id, parent_id, title, settings_json, visible_assignees_json,
                    revision, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    node.id.to_string(),
                    node.parent.map(|parent| parent.to_string()),
                    node.title,
                    encode_settings(&node.settings)?,
                    encode_assignees(&node.visible_assignees)?,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| format!("failed to insert forum section {}", node.id))?;
        Ok(())
    }
}

fn decode_section(row: &Row<'_>) -> Result<SectionNode> {
    let section_id_raw: String = row.get(0)?;
    let parent_raw: Option<String> = row.get(1)?;
    let settings_json: String = row.get(3)?;
    let assignees_json: String = row.get(4)?;
    let revision: i64 = row.get(5)?;

    let id: SectionId = section_id_raw.parse()?;
    let parent = parent_raw.map(|raw| raw.parse::<SectionId>()).transpose()?;
    let settings: SectionSettings = serde_json::from_str(&settings_json)
        .with_context(|| format!("failed to deserialize settings of section {id}"))?;
    let visible_assignees: Vec<UserId> = serde_json::from_str(&assignees_json)
        .with_context(|| format!("failed to deserialize visible assignees of section {id}"))?;

    Ok(SectionNode {
        id,
        parent,
        title: row.get(2)?,
        settings,
        visible_assignees,
        revision: u64::try_from(revision)
            .with_context(|| format!("negative revision {revision} for section {id}"))?,
    })
}

fn encode_settings(settings: &SectionSettings) -> Result<String> {
    serde_json::to_string(settings).context("failed to serialize section settings")
}

fn encode_assignees(assignees: &[UserId]) -> Result<String> {
    let unique = assignees.iter().collect::<BTreeSet<_>>();
    serde_json::to_string(&unique).context("failed to serialize visible assignees")
}

fn revision_to_sql(revision: u64) -> Result<i64> {
    i64::try_from(revision).with_context(|| format!("revision {revision} exceeds sqlite range"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "sections")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
