use std::path::Path;

use anyhow::{anyhow, Context, Result};
use contact_identity_core::{
    creation_order, Contact, ContactCluster, ContactId, ContactStore, LinkPrecedence, StoreError,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const CREATE_CONTACTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK ((link_precedence = 'primary') = (linked_id IS NULL)),
  CHECK (linked_id IS NULL OR linked_id <> id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at";

/// [`ContactStore`] over a single SQLite connection.
///
/// Calls are serialized on the connection; `create` additionally runs inside an
/// immediate transaction so other processes sharing the file cannot interleave
/// id and timestamp assignment.
pub struct SqliteContactStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub contact_count: i64,
}

impl SqliteContactStore {
    /// Open a SQLite-backed contact store, configure runtime pragmas, and
    /// bootstrap the `contacts` table.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let display = path.display();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {display}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(CREATE_CONTACTS_SQL)
            .context("failed to apply contacts schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run quick-check and foreign-key-check health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let contact_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))
            .context("failed to count contacts")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            contact_count,
        })
    }

    fn load_matching(&self, email: Option<&str>, phone: Option<&str>) -> Result<Vec<Contact>> {
        if email.is_none() && phone.is_none() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        query_contacts(
            &conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE (?1 IS NOT NULL AND email = ?1)
                    OR (?2 IS NOT NULL AND phone_number = ?2)"
            ),
            params![email, phone],
        )
    }

    fn insert_contact(&self, email: Option<&str>, phone: Option<&str>) -> Result<Contact> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin contact insert transaction")?;

        let previous: Option<String> = tx
            .query_row("SELECT created_at FROM contacts ORDER BY id DESC LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()
            .context("failed to read latest created_at")?;
        let mut created_at = OffsetDateTime::now_utc();
        if let Some(previous) = previous {
            created_at = created_at.max(parse_rfc3339(&previous)?);
        }
        let stamp = rfc3339(created_at)?;

        tx.execute(
            "INSERT INTO contacts(
                email, phone_number, linked_id, link_precedence, created_at, updated_at
            ) VALUES (?1, ?2, NULL, 'primary', ?3, ?3)",
            params![email, phone, stamp],
        )
        .context("failed to insert contact")?;
        let id = tx.last_insert_rowid();

        let contact = query_contacts(
            &tx,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id],
        )?
        .pop()
        .ok_or_else(|| anyhow!("inserted contact {id} could not be read back"))?;
        tx.commit().context("failed to commit contact insert")?;

        tracing::debug!(contact_id = id, "inserted primary contact");
        Ok(contact)
    }

    fn write_link(
        &self,
        id: ContactId,
        linked_id: Option<ContactId>,
        precedence: LinkPrecedence,
    ) -> Result<()> {
        let linked = linked_id.map(|target| target.0);
        let stamp = now_rfc3339()?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE contacts
                 SET linked_id = ?2, link_precedence = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id.0, linked, precedence.as_str(), stamp],
            )
            .with_context(|| format!("failed to update link of contact {id}"))?;
        if changed == 0 {
            return Err(anyhow!("contact {id} does not exist"));
        }

        tracing::debug!(
            contact_id = id.0,
            linked_id = linked,
            precedence = precedence.as_str(),
            "updated contact link"
        );
        Ok(())
    }

    fn load_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        let conn = self.conn.lock();
        Ok(query_contacts(
            &conn,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id.0],
        )?
        .pop())
    }

    fn load_cluster(&self, primary_id: ContactId) -> Result<Option<ContactCluster>> {
        let conn = self.conn.lock();
        let Some(primary) = query_contacts(
            &conn,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![primary_id.0],
        )?
        .pop() else {
            return Ok(None);
        };
        let secondaries = query_contacts(
            &conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE linked_id = ?1"
            ),
            params![primary_id.0],
        )?;
        Ok(Some(ContactCluster {
            primary,
            secondaries,
        }))
    }

    fn load_all(&self) -> Result<Vec<Contact>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts");
        query_contacts(&conn, &sql, [])
    }
}

impl ContactStore for SqliteContactStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        self.load_matching(email, phone).map_err(store_err)
    }

    fn create(&self, email: Option<&str>, phone: Option<&str>) -> Result<Contact, StoreError> {
        self.insert_contact(email, phone).map_err(store_err)
    }

    fn update_link(
        &self,
        id: ContactId,
        linked_id: Option<ContactId>,
        precedence: LinkPrecedence,
    ) -> Result<(), StoreError> {
        self.write_link(id, linked_id, precedence)
            .map_err(store_err)
    }

    fn get_by_id(&self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        self.load_contact(id).map_err(store_err)
    }

    fn get_cluster(&self, primary_id: ContactId) -> Result<Option<ContactCluster>, StoreError> {
        self.load_cluster(primary_id).map_err(store_err)
    }

    fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.load_all().map_err(store_err)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_err(err: anyhow::Error) -> StoreError {
    StoreError::new(format!("{err:#}"))
}

struct ContactRow {
    id: i64,
    email: Option<String>,
    phone: Option<String>,
    linked_id: Option<i64>,
    precedence: String,
    created_at: String,
    updated_at: String,
}

impl ContactRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            phone: row.get(2)?,
            linked_id: row.get(3)?,
            precedence: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_contact(self) -> Result<Contact> {
        let Some(precedence) = LinkPrecedence::parse(&self.precedence) else {
            let (value, id) = (&self.precedence, self.id);
            return Err(anyhow!("invalid precedence `{value}` on contact {id}"));
        };
        Ok(Contact {
            id: ContactId(self.id),
            email: self.email,
            phone: self.phone,
            linked_id: self.linked_id.map(ContactId),
            precedence,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn query_contacts(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<Contact>> {
    let mut stmt = conn
        .prepare(sql)
        .context("failed to prepare contact query")?;
    let rows = stmt
        .query_map(params, ContactRow::from_row)
        .context("failed to query contacts")?;

    let mut contacts = Vec::new();
    for row in rows {
        contacts.push(row.context("failed to read contact row")?.into_contact()?);
    }
    contacts.sort_by(creation_order);
    Ok(contacts)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
