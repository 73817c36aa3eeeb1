//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes go through a
//! single async lock so multi-statement transactions on the shared
//! connection never interleave.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ItemPrice, NewProposal, NewRfp, NewVendor, Proposal, ProposalAnalysis, ProposalStatus, Rfp,
    RfpItem, RfpStatus, Vendor, VendorCategory, VendorUpdate,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_items(&self, rfp_id: &str) -> Result<Vec<RfpItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, quantity, specifications FROM rfp_items WHERE rfp_id = ?1 ORDER BY position ASC",
                params![rfp_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_items: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_items row: {e}")))?
        {
            let specs: String = row.get(3).map_err(row_err)?;
            items.push(RfpItem {
                id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
                name: row.get(1).map_err(row_err)?,
                quantity: u32::try_from(row.get::<i64>(2).map_err(row_err)?).unwrap_or(1),
                specifications: serde_json::from_str(&specs).unwrap_or_default(),
            });
        }
        Ok(items)
    }

    /// Run an RFP query and attach items to every row.
    async fn query_rfps(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Rfp>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut rfps = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            rfps.push(row_to_rfp(&row)?);
        }

        for rfp in &mut rfps {
            rfp.items = self.load_items(&rfp.id.to_string()).await?;
        }
        Ok(rfps)
    }

    async fn query_proposals(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Proposal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut proposals = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            proposals.push(row_to_proposal(&row)?);
        }
        Ok(proposals)
    }

    async fn query_vendors(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Vendor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut vendors = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            vendors.push(row_to_vendor(&row)?);
        }
        Ok(vendors)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Normalize an email for storage and lookup.
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

const VENDOR_COLUMNS: &str = "id, name, email, phone, is_active, category_id, created_at";

const RFP_COLUMNS: &str = "id, title, description, raw_input, budget, delivery_deadline, payment_terms, warranty, additional_requirements, status, created_at, updated_at";

const PROPOSAL_COLUMNS: &str = "id, rfp_id, vendor_id, raw_content, email_subject, status, proposed_price, delivery_days, warranty, payment_terms, item_pricing, strengths, weaknesses, score, recommendation, is_recommended, analyzed_at, received_at, created_at, updated_at";

fn row_to_vendor(row: &libsql::Row) -> Result<Vendor, DatabaseError> {
    let created: String = row.get(6).map_err(row_err)?;
    Ok(Vendor {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        name: row.get(1).map_err(row_err)?,
        email: row.get(2).map_err(row_err)?,
        phone: row.get(3).ok(),
        is_active: row.get::<i64>(4).map_err(row_err)? != 0,
        category_id: parse_uuid(&row.get::<String>(5).map_err(row_err)?)?,
        created_at: parse_datetime(&created),
    })
}

/// Map a row to an RFP without items; callers attach them.
fn row_to_rfp(row: &libsql::Row) -> Result<Rfp, DatabaseError> {
    let budget: Option<String> = row.get(4).ok();
    let deadline: Option<String> = row.get(5).ok();
    let requirements: String = row.get(8).map_err(row_err)?;
    let status: String = row.get(9).map_err(row_err)?;
    let created: String = row.get(10).map_err(row_err)?;
    let updated: String = row.get(11).map_err(row_err)?;

    Ok(Rfp {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        title: row.get(1).map_err(row_err)?,
        description: row.get(2).map_err(row_err)?,
        raw_input: row.get(3).map_err(row_err)?,
        budget: budget.and_then(|b| Decimal::from_str(&b).ok()),
        delivery_deadline: deadline.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        payment_terms: row.get(6).ok(),
        warranty: row.get(7).ok(),
        additional_requirements: serde_json::from_str(&requirements).unwrap_or_default(),
        status: RfpStatus::from_str(&status).map_err(DatabaseError::Serialization)?,
        items: Vec::new(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_proposal(row: &libsql::Row) -> Result<Proposal, DatabaseError> {
    let status: String = row.get(5).map_err(row_err)?;
    let item_pricing: String = row.get(10).map_err(row_err)?;
    let strengths: String = row.get(11).map_err(row_err)?;
    let weaknesses: String = row.get(12).map_err(row_err)?;
    let analyzed_at: Option<String> = row.get(16).ok();
    let received: String = row.get(17).map_err(row_err)?;
    let created: String = row.get(18).map_err(row_err)?;
    let updated: String = row.get(19).map_err(row_err)?;

    Ok(Proposal {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        rfp_id: parse_uuid(&row.get::<String>(1).map_err(row_err)?)?,
        vendor_id: parse_uuid(&row.get::<String>(2).map_err(row_err)?)?,
        raw_content: row.get(3).map_err(row_err)?,
        email_subject: row.get(4).ok(),
        status: ProposalStatus::from_str(&status).map_err(DatabaseError::Serialization)?,
        proposed_price: row.get::<f64>(6).ok(),
        delivery_days: row
            .get::<i64>(7)
            .ok()
            .and_then(|d| u32::try_from(d).ok()),
        warranty: row.get(8).ok(),
        payment_terms: row.get(9).ok(),
        item_pricing: serde_json::from_str::<Vec<ItemPrice>>(&item_pricing).unwrap_or_default(),
        strengths: serde_json::from_str(&strengths).unwrap_or_default(),
        weaknesses: serde_json::from_str(&weaknesses).unwrap_or_default(),
        score: row.get::<f64>(13).ok(),
        recommendation: row.get(14).ok(),
        is_recommended: row.get::<i64>(15).map_err(row_err)? != 0,
        analyzed_at: analyzed_at.as_deref().map(parse_datetime),
        received_at: parse_datetime(&received),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

async fn begin(conn: &Connection, op: &str) -> Result<Transaction, DatabaseError> {
    conn.transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
}

/// Commit on success, roll back on error.
async fn finish<T>(
    tx: Transaction,
    op: &str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Owning RFP of a proposal, if the proposal exists.
async fn proposal_rfp_id(conn: &Connection, id: &str) -> Result<Option<String>, DatabaseError> {
    let mut rows = conn
        .query("SELECT rfp_id FROM proposals WHERE id = ?1", params![id])
        .await
        .map_err(|e| DatabaseError::Query(format!("proposal_rfp_id: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("proposal_rfp_id row: {e}")))?
    {
        Some(row) => Ok(Some(row.get::<String>(0).map_err(row_err)?)),
        None => Ok(None),
    }
}

/// Flag the top analyzed proposal of an RFP (highest score, earliest
/// analysis on ties) and clear every other flag. Callers run this inside
/// a transaction.
async fn recompute_in(conn: &Connection, rfp_id: &str) -> Result<Option<String>, DatabaseError> {
    let top = {
        let mut rows = conn
            .query(
                "SELECT id FROM proposals
                 WHERE rfp_id = ?1 AND status = 'analyzed' AND score IS NOT NULL
                 ORDER BY score DESC, analysis_seq ASC
                 LIMIT 1",
                params![rfp_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recompute_recommendation: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recompute_recommendation row: {e}")))?
        {
            Some(row) => Some(row.get::<String>(0).map_err(row_err)?),
            None => None,
        }
    };

    // A NULL ?2 matches no row, which clears every flag.
    conn.execute(
        "UPDATE proposals SET
            is_recommended = CASE WHEN id = ?2 THEN 1 ELSE 0 END,
            updated_at = ?3
         WHERE rfp_id = ?1 AND is_recommended <> CASE WHEN id = ?2 THEN 1 ELSE 0 END",
        params![rfp_id, top.clone(), Utc::now().to_rfc3339()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("recompute_recommendation update: {e}")))?;

    Ok(top)
}

/// Insert items in list order. Callers run this inside a transaction.
async fn insert_items(conn: &Connection, rfp_id: Uuid, items: &[RfpItem]) -> Result<(), DatabaseError> {
    for (position, item) in items.iter().enumerate() {
        conn.execute(
            "INSERT INTO rfp_items (id, rfp_id, position, name, quantity, specifications)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id.to_string(),
                rfp_id.to_string(),
                position as i64,
                item.name.as_str(),
                i64::from(item.quantity),
                to_json(&item.specifications)?,
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_write("insert rfp item", e))?;
    }
    Ok(())
}

fn new_items(rfp: &NewRfp) -> Vec<RfpItem> {
    rfp.items
        .iter()
        .map(|item| RfpItem {
            id: Uuid::new_v4(),
            name: item.name.clone(),
            quantity: item.quantity,
            specifications: item.specifications.clone(),
        })
        .collect()
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Categories ──────────────────────────────────────────────────

    async fn create_category(&self, name: &str) -> Result<VendorCategory, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let category = VendorCategory {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
        };
        self.conn()
            .execute(
                "INSERT INTO vendor_categories (id, name) VALUES (?1, ?2)",
                params![category.id.to_string(), category.name.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_write("create_category", e))?;
        debug!(id = %category.id, name = %category.name, "Category created");
        Ok(category)
    }

    async fn list_categories(&self) -> Result<Vec<VendorCategory>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id, name FROM vendor_categories ORDER BY name ASC", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_categories: {e}")))?;

        let mut categories = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_categories row: {e}")))?
        {
            categories.push(VendorCategory {
                id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
                name: row.get(1).map_err(row_err)?,
            });
        }
        Ok(categories)
    }

    // ── Vendors ─────────────────────────────────────────────────────

    async fn create_vendor(&self, vendor: &NewVendor) -> Result<Vendor, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let created = Vendor {
            id: Uuid::new_v4(),
            name: vendor.name.trim().to_string(),
            email: normalize_email(&vendor.email),
            phone: vendor.phone.clone(),
            is_active: true,
            category_id: vendor.category_id,
            created_at: now,
        };

        self.conn()
            .execute(
                "INSERT INTO vendors (id, name, email, phone, is_active, category_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)",
                params![
                    created.id.to_string(),
                    created.name.as_str(),
                    created.email.as_str(),
                    created.phone.clone(),
                    created.category_id.to_string(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("create_vendor", e))?;

        debug!(id = %created.id, email = %created.email, "Vendor created");
        Ok(created)
    }

    async fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, DatabaseError> {
        let vendors = self
            .query_vendors(
                "get_vendor",
                &format!("SELECT {VENDOR_COLUMNS} FROM vendors WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(vendors.into_iter().next())
    }

    async fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, DatabaseError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Ok(None);
        }
        let vendors = self
            .query_vendors(
                "find_vendor_by_email",
                &format!("SELECT {VENDOR_COLUMNS} FROM vendors WHERE email = ?1 COLLATE NOCASE"),
                params![email],
            )
            .await?;
        Ok(vendors.into_iter().next())
    }

    async fn list_vendors(&self) -> Result<Vec<Vendor>, DatabaseError> {
        self.query_vendors(
            "list_vendors",
            &format!("SELECT {VENDOR_COLUMNS} FROM vendors ORDER BY name ASC"),
            (),
        )
        .await
    }

    async fn update_vendor(
        &self,
        id: Uuid,
        update: &VendorUpdate,
    ) -> Result<Option<Vendor>, DatabaseError> {
        let Some(mut vendor) = self.get_vendor(id).await? else {
            return Ok(None);
        };

        if let Some(name) = &update.name {
            vendor.name = name.trim().to_string();
        }
        if let Some(email) = &update.email {
            vendor.email = normalize_email(email);
        }
        if let Some(phone) = &update.phone {
            vendor.phone = Some(phone.clone());
        }
        if let Some(category_id) = update.category_id {
            vendor.category_id = category_id;
        }
        if let Some(is_active) = update.is_active {
            vendor.is_active = is_active;
        }

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE vendors SET name = ?2, email = ?3, phone = ?4, category_id = ?5, is_active = ?6, updated_at = ?7 WHERE id = ?1",
                params![
                    id.to_string(),
                    vendor.name.as_str(),
                    vendor.email.as_str(),
                    vendor.phone.clone(),
                    vendor.category_id.to_string(),
                    vendor.is_active as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("update_vendor", e))?;

        debug!(id = %id, "Vendor updated");
        Ok(Some(vendor))
    }

    async fn delete_vendor(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "delete_vendor").await?;

        let result: Result<(bool, usize), DatabaseError> = async {
            let mut affected = Vec::new();
            {
                let mut rows = tx
                    .query(
                        "SELECT DISTINCT rfp_id FROM proposals WHERE vendor_id = ?1",
                        params![id.to_string()],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_vendor: {e}")))?;
                while let Some(row) = rows
                    .next()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_vendor row: {e}")))?
                {
                    affected.push(row.get::<String>(0).map_err(row_err)?);
                }
            }

            let count = tx
                .execute("DELETE FROM vendors WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::from_write("delete_vendor", e))?;
            for rfp_id in &affected {
                recompute_in(&tx, rfp_id).await?;
            }
            Ok((count > 0, affected.len()))
        }
        .await;

        let (deleted, affected) = finish(tx, "delete_vendor", result).await?;
        debug!(id = %id, affected_rfps = affected, "Vendor deleted");
        Ok(deleted)
    }

    // ── RFPs ────────────────────────────────────────────────────────

    async fn create_rfp(&self, rfp: &NewRfp) -> Result<Rfp, DatabaseError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let items = new_items(rfp);

        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "create_rfp").await?;

        let result: Result<(), DatabaseError> = async {
            tx.execute(
                "INSERT INTO rfps (id, title, description, raw_input, budget, delivery_deadline, payment_terms, warranty, additional_requirements, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'draft', ?10, ?10)",
                params![
                    id.to_string(),
                    rfp.title.as_str(),
                    rfp.description.as_str(),
                    rfp.raw_input.as_str(),
                    rfp.budget.map(|b| b.to_string()),
                    rfp.delivery_deadline.map(|d| d.format("%Y-%m-%d").to_string()),
                    rfp.payment_terms.clone(),
                    rfp.warranty.clone(),
                    to_json(&rfp.additional_requirements)?,
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("create_rfp", e))?;

            insert_items(&tx, id, &items).await
        }
        .await;
        finish(tx, "create_rfp", result).await?;

        debug!(id = %id, items = items.len(), "RFP created");
        Ok(Rfp {
            id,
            title: rfp.title.clone(),
            description: rfp.description.clone(),
            raw_input: rfp.raw_input.clone(),
            budget: rfp.budget,
            delivery_deadline: rfp.delivery_deadline,
            payment_terms: rfp.payment_terms.clone(),
            warranty: rfp.warranty.clone(),
            additional_requirements: rfp.additional_requirements.clone(),
            status: RfpStatus::Draft,
            items,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_rfp(&self, id: Uuid) -> Result<Option<Rfp>, DatabaseError> {
        let rfps = self
            .query_rfps(
                "get_rfp",
                &format!("SELECT {RFP_COLUMNS} FROM rfps WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(rfps.into_iter().next())
    }

    async fn list_rfps(&self) -> Result<Vec<Rfp>, DatabaseError> {
        self.query_rfps(
            "list_rfps",
            &format!("SELECT {RFP_COLUMNS} FROM rfps ORDER BY created_at DESC"),
            (),
        )
        .await
    }

    async fn list_rfps_by_status(&self, status: RfpStatus) -> Result<Vec<Rfp>, DatabaseError> {
        self.query_rfps(
            "list_rfps_by_status",
            &format!(
                "SELECT {RFP_COLUMNS} FROM rfps WHERE status = ?1 ORDER BY updated_at DESC, created_at DESC"
            ),
            params![status.to_string()],
        )
        .await
    }

    async fn update_rfp(&self, id: Uuid, rfp: &NewRfp) -> Result<Option<Rfp>, DatabaseError> {
        let items = new_items(rfp);

        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "update_rfp").await?;

        let result: Result<bool, DatabaseError> = async {
            let count = tx
                .execute(
                    "UPDATE rfps SET title = ?2, description = ?3, raw_input = ?4, budget = ?5,
                        delivery_deadline = ?6, payment_terms = ?7, warranty = ?8,
                        additional_requirements = ?9, updated_at = ?10
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        rfp.title.as_str(),
                        rfp.description.as_str(),
                        rfp.raw_input.as_str(),
                        rfp.budget.map(|b| b.to_string()),
                        rfp.delivery_deadline.map(|d| d.format("%Y-%m-%d").to_string()),
                        rfp.payment_terms.clone(),
                        rfp.warranty.clone(),
                        to_json(&rfp.additional_requirements)?,
                        Utc::now().to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::from_write("update_rfp", e))?;
            if count == 0 {
                return Ok(false);
            }

            tx.execute("DELETE FROM rfp_items WHERE rfp_id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("update_rfp items: {e}")))?;
            insert_items(&tx, id, &items).await?;
            Ok(true)
        }
        .await;

        if !finish(tx, "update_rfp", result).await? {
            return Ok(None);
        }
        debug!(id = %id, items = items.len(), "RFP updated");
        self.get_rfp(id).await
    }

    async fn update_rfp_status(&self, id: Uuid, status: RfpStatus) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE rfps SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_rfp_status: {e}")))?;
        debug!(id = %id, status = %status, "RFP status updated");
        Ok(count > 0)
    }

    async fn delete_rfp(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute("DELETE FROM rfps WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rfp: {e}")))?;
        Ok(count > 0)
    }

    // ── Proposals ───────────────────────────────────────────────────

    async fn insert_proposal(&self, proposal: &NewProposal) -> Result<Proposal, DatabaseError> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO proposals (id, rfp_id, vendor_id, raw_content, email_subject, status, received_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    proposal.rfp_id.to_string(),
                    proposal.vendor_id.to_string(),
                    proposal.raw_content.as_str(),
                    proposal.email_subject.clone(),
                    proposal.received_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_write("insert_proposal", e))?;

        debug!(id = %id, rfp_id = %proposal.rfp_id, vendor_id = %proposal.vendor_id, "Proposal inserted");
        Ok(Proposal {
            id,
            rfp_id: proposal.rfp_id,
            vendor_id: proposal.vendor_id,
            raw_content: proposal.raw_content.clone(),
            email_subject: proposal.email_subject.clone(),
            status: ProposalStatus::Pending,
            proposed_price: None,
            delivery_days: None,
            warranty: None,
            payment_terms: None,
            item_pricing: Vec::new(),
            strengths: Vec::new(),
            weaknesses: Vec::new(),
            score: None,
            recommendation: None,
            is_recommended: false,
            analyzed_at: None,
            received_at: proposal.received_at,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, DatabaseError> {
        let proposals = self
            .query_proposals(
                "get_proposal",
                &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(proposals.into_iter().next())
    }

    async fn find_proposal(
        &self,
        rfp_id: Uuid,
        vendor_id: Uuid,
    ) -> Result<Option<Proposal>, DatabaseError> {
        let proposals = self
            .query_proposals(
                "find_proposal",
                &format!(
                    "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE rfp_id = ?1 AND vendor_id = ?2"
                ),
                params![rfp_id.to_string(), vendor_id.to_string()],
            )
            .await?;
        Ok(proposals.into_iter().next())
    }

    async fn list_proposals_for_rfp(&self, rfp_id: Uuid) -> Result<Vec<Proposal>, DatabaseError> {
        self.query_proposals(
            "list_proposals_for_rfp",
            &format!(
                "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE rfp_id = ?1
                 ORDER BY is_recommended DESC, score DESC, analysis_seq IS NULL, analysis_seq ASC, received_at ASC"
            ),
            params![rfp_id.to_string()],
        )
        .await
    }

    async fn get_recommended_proposal(
        &self,
        rfp_id: Uuid,
    ) -> Result<Option<Proposal>, DatabaseError> {
        let proposals = self
            .query_proposals(
                "get_recommended_proposal",
                &format!(
                    "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE rfp_id = ?1 AND is_recommended = 1 LIMIT 1"
                ),
                params![rfp_id.to_string()],
            )
            .await?;
        Ok(proposals.into_iter().next())
    }

    async fn apply_analysis(
        &self,
        id: Uuid,
        analysis: &ProposalAnalysis,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let item_pricing = to_json(&analysis.item_pricing)?;
        let strengths = to_json(&analysis.strengths)?;
        let weaknesses = to_json(&analysis.weaknesses)?;

        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "apply_analysis").await?;

        let result: Result<Option<Option<String>>, DatabaseError> = async {
            let Some(rfp_id) = proposal_rfp_id(&tx, &id.to_string()).await? else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE proposals SET
                    proposed_price = ?2, delivery_days = ?3, warranty = ?4, payment_terms = ?5,
                    item_pricing = ?6, strengths = ?7, weaknesses = ?8, score = ?9, recommendation = ?10,
                    status = 'analyzed',
                    analysis_seq = COALESCE(analysis_seq, (SELECT COALESCE(MAX(analysis_seq), 0) + 1 FROM proposals)),
                    analyzed_at = COALESCE(analyzed_at, ?11),
                    updated_at = ?11
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    analysis.proposed_price,
                    analysis.delivery_days.map(i64::from),
                    analysis.warranty.clone(),
                    analysis.payment_terms.clone(),
                    item_pricing,
                    strengths,
                    weaknesses,
                    analysis.score,
                    analysis.recommendation.as_str(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_analysis: {e}")))?;

            recompute_in(&tx, &rfp_id).await.map(Some)
        }
        .await;

        let Some(recommended) = finish(tx, "apply_analysis", result).await? else {
            return Ok(false);
        };
        debug!(id = %id, score = analysis.score, recommended = ?recommended, "Analysis stored");
        Ok(true)
    }

    async fn update_proposal_status(
        &self,
        id: Uuid,
        status: ProposalStatus,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "update_proposal_status").await?;

        let result: Result<bool, DatabaseError> = async {
            let Some(rfp_id) = proposal_rfp_id(&tx, &id.to_string()).await? else {
                return Ok(false);
            };

            tx.execute(
                "UPDATE proposals SET
                    status = ?2,
                    is_recommended = CASE WHEN ?2 = 'analyzed' THEN is_recommended ELSE 0 END,
                    updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), status.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_proposal_status: {e}")))?;

            recompute_in(&tx, &rfp_id).await?;
            Ok(true)
        }
        .await;

        let updated = finish(tx, "update_proposal_status", result).await?;
        if updated {
            debug!(id = %id, status = %status, "Proposal status updated");
        }
        Ok(updated)
    }

    async fn set_recommended_exclusive(
        &self,
        rfp_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "set_recommended_exclusive").await?;

        let result: Result<bool, DatabaseError> = async {
            let eligible = {
                let mut rows = tx
                    .query(
                        "SELECT 1 FROM proposals WHERE id = ?1 AND rfp_id = ?2 AND status = 'analyzed'",
                        params![proposal_id.to_string(), rfp_id.to_string()],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("set_recommended_exclusive: {e}")))?;
                rows.next()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("set_recommended_exclusive row: {e}")))?
                    .is_some()
            };
            if !eligible {
                return Ok(false);
            }

            tx.execute(
                "UPDATE proposals SET
                    is_recommended = CASE WHEN id = ?2 THEN 1 ELSE 0 END,
                    updated_at = ?3
                 WHERE rfp_id = ?1 AND is_recommended <> CASE WHEN id = ?2 THEN 1 ELSE 0 END",
                params![rfp_id.to_string(), proposal_id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_recommended_exclusive update: {e}")))?;
            Ok(true)
        }
        .await;

        let flagged = finish(tx, "set_recommended_exclusive", result).await?;
        debug!(rfp_id = %rfp_id, proposal_id = %proposal_id, flagged, "Recommendation override");
        Ok(flagged)
    }

    async fn clear_recommended(&self, id: Uuid) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE proposals SET is_recommended = 0, updated_at = ?2 WHERE id = ?1 AND is_recommended = 1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_recommended: {e}")))?;
        Ok(())
    }

    async fn recompute_recommendation(&self, rfp_id: Uuid) -> Result<Option<Uuid>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "recompute_recommendation").await?;
        let result = recompute_in(&tx, &rfp_id.to_string()).await;
        let top = finish(tx, "recompute_recommendation", result).await?;

        let top = top.as_deref().map(parse_uuid).transpose()?;
        debug!(rfp_id = %rfp_id, recommended = ?top, "Recommendation recomputed");
        Ok(top)
    }

    async fn delete_proposal(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "delete_proposal").await?;

        let result: Result<Option<(String, Option<String>)>, DatabaseError> = async {
            let Some(rfp_id) = proposal_rfp_id(&tx, &id.to_string()).await? else {
                return Ok(None);
            };

            tx.execute("DELETE FROM proposals WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("delete_proposal: {e}")))?;
            let recommended = recompute_in(&tx, &rfp_id).await?;
            Ok(Some((rfp_id, recommended)))
        }
        .await;

        let Some((rfp_id, recommended)) = finish(tx, "delete_proposal", result).await? else {
            return Ok(false);
        };
        debug!(id = %id, rfp_id = %rfp_id, recommended = ?recommended, "Proposal deleted");
        Ok(true)
    }
}
