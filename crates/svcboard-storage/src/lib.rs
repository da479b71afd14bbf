//! Listing storage backends, CSV export and the listing lifecycle service.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use svcboard_core::{
    validate_submission, FormConfiguration, ListingFields, ListingId, ListingSummary, NewListing,
    ServiceListing, SessionContext, CSV_COLUMNS,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

mod postgres;
mod reference;

pub use postgres::PgListingStore;
pub use reference::{load_form_configuration, AGENCIES_FILE, SERVICES_FILE};

pub const CRATE_NAME: &str = "svcboard-storage";

/// Record store behind the lifecycle service. Identifiers come from the store and are
/// never handed out twice, even after a delete.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn insert(&self, fields: ListingFields) -> anyhow::Result<ServiceListing>;
    async fn list(&self) -> anyhow::Result<Vec<ServiceListing>>;
    async fn get(&self, id: ListingId) -> anyhow::Result<Option<ServiceListing>>;
    /// Returns whether a record was removed.
    async fn delete(&self, id: ListingId) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAccount {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
}

/// Lookup of administrator accounts by login.
#[async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn find_account(&self, login: &str) -> anyhow::Result<Option<AdminAccount>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<ListingId, ServiceListing>,
}

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: RwLock<MemoryState>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn insert(&self, fields: ListingFields) -> anyhow::Result<ServiceListing> {
        let mut state = self.state.write().await;
        state.next_id = state
            .next_id
            .checked_add(1)
            .ok_or_else(|| anyhow!("listing identifier space exhausted"))?;
        let listing = ServiceListing {
            id: ListingId(state.next_id),
            created_at: Utc::now(),
            fields,
        };
        state.rows.insert(listing.id, listing.clone());
        Ok(listing)
    }

    async fn list(&self) -> anyhow::Result<Vec<ServiceListing>> {
        // Newest first, matching the Postgres ordering.
        Ok(self.state.read().await.rows.values().rev().cloned().collect())
    }

    async fn get(&self, id: ListingId) -> anyhow::Result<Option<ServiceListing>> {
        Ok(self.state.read().await.rows.get(&id).cloned())
    }

    async fn delete(&self, id: ListingId) -> anyhow::Result<bool> {
        Ok(self.state.write().await.rows.remove(&id).is_some())
    }
}

/// Fixed set of accounts, used when no database is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticAdminDirectory {
    accounts: Vec<AdminAccount>,
}

impl StaticAdminDirectory {
    pub fn new(accounts: Vec<AdminAccount>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AdminDirectory for StaticAdminDirectory {
    async fn find_account(&self, login: &str) -> anyhow::Result<Option<AdminAccount>> {
        Ok(self.accounts.iter().find(|a| a.login == login).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    pub filename: String,
    pub body: Vec<u8>,
}

/// Render listings as UTF-8 CSV: a header row of [`CSV_COLUMNS`], then one row per listing.
pub fn render_csv<'a>(rows: impl IntoIterator<Item = &'a ListingFields>) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_COLUMNS)?;
    for fields in rows {
        writer.write_record(fields.csv_record())?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing csv export: {}", err.error()))
}

/// `<slug>_<YYYYMMDD_HHMMSS>.csv`
pub fn export_filename(title: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.csv", safe_slug(title), at.format("%Y%m%d_%H%M%S"))
}

fn safe_slug(text: &str) -> String {
    let slug = text
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(80)
        .collect::<String>();
    if slug.is_empty() {
        "vaga".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("submission rejected: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("listing {0} not found")]
    NotFound(ListingId),
    #[error("an authenticated admin session is required")]
    Unauthorized,
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Owns creation, retrieval, enumeration, deletion and export of listings.
#[derive(Clone)]
pub struct ListingService {
    store: Arc<dyn ListingStore>,
    config: Arc<FormConfiguration>,
}

impl ListingService {
    pub fn new(store: Arc<dyn ListingStore>, config: FormConfiguration) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Reference data for the submission form, stamped with the caller's notion of today.
    pub fn form_configuration(&self, today: NaiveDate) -> FormConfiguration {
        self.config.as_ref().clone().with_today(today)
    }

    pub async fn create(&self, input: &NewListing) -> Result<ServiceListing, ListingError> {
        let fields = validate_submission(input, &self.config).map_err(|errors| {
            warn!(errors = errors.len(), "listing submission rejected");
            ListingError::Invalid(errors)
        })?;
        let listing = self.store.insert(fields).await?;
        info!(listing_id = %listing.id, title = %listing.fields.title, "listing created");
        Ok(listing)
    }

    pub async fn list(&self) -> Result<Vec<ListingSummary>, ListingError> {
        let rows = self.store.list().await?;
        Ok(rows.iter().map(ListingSummary::from).collect())
    }

    pub async fn get(&self, id: ListingId) -> Result<ServiceListing, ListingError> {
        self.store.get(id).await?.ok_or(ListingError::NotFound(id))
    }

    /// Authorization is settled before the store is touched, so anonymous callers learn
    /// nothing about which identifiers exist.
    pub async fn delete(&self, session: &SessionContext, id: ListingId) -> Result<(), ListingError> {
        let admin = authorize(session)?;
        if !self.store.delete(id).await? {
            return Err(ListingError::NotFound(id));
        }
        info!(listing_id = %id, admin = %admin, "listing deleted");
        Ok(())
    }

    pub async fn export_csv(&self, id: ListingId, now: DateTime<Utc>) -> Result<CsvExport, ListingError> {
        let listing = self.get(id).await?;
        let body = render_csv([&listing.fields])?;
        Ok(CsvExport {
            filename: export_filename(&listing.fields.title, now),
            body,
        })
    }

    pub async fn export_all_csv(
        &self,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> Result<CsvExport, ListingError> {
        authorize(session)?;
        self.export_everything(now).await
    }

    /// Unchecked full export for operator tooling that already runs with store access.
    pub async fn export_everything(&self, now: DateTime<Utc>) -> Result<CsvExport, ListingError> {
        let rows = self.store.list().await?;
        let body = render_csv(rows.iter().map(|l| &l.fields))?;
        Ok(CsvExport {
            filename: export_filename("servicos", now),
            body,
        })
    }
}

fn authorize(session: &SessionContext) -> Result<&str, ListingError> {
    match session.admin() {
        Some(admin) if !admin.is_expired(Utc::now()) => Ok(admin.username.as_str()),
        _ => Err(ListingError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;
    use svcboard_core::AdminSession;

    fn config() -> FormConfiguration {
        let mut config = FormConfiguration::new(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        config.activity_types = vec!["Pintor".into()];
        config
            .specifications
            .insert("Pintor".into(), vec!["Pintura de fachada".into()]);
        config
    }

    fn submission(title: &str) -> NewListing {
        NewListing {
            requesting_agency: "Secretaria de Educação".into(),
            title: title.into(),
            activity_type: "Pintor".into(),
            activity_specification: "Pintura de fachada".into(),
            description: "Pintar a fachada da escola".into(),
            additional_information: "Levar material".into(),
            address: "Av. Brasil".into(),
            house_number: "1500".into(),
            neighborhood: "Jardim América".into(),
            payment_method: "Dinheiro".into(),
            payment_term: "15 dias".into(),
            expiration_deadline: "20/01/2024".into(),
            execution_deadline: "10/02/2024".into(),
        }
    }

    fn service() -> ListingService {
        ListingService::new(Arc::new(MemoryListingStore::new()), config())
    }

    fn admin() -> SessionContext {
        SessionContext::Admin(AdminSession {
            id: uuid::Uuid::new_v4(),
            user_id: 1,
            username: "admin".into(),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    #[tokio::test]
    async fn create_issues_fresh_ids_visible_in_list() {
        let svc = service();
        let mut seen = HashSet::new();
        for i in 0..5 {
            let listing = svc.create(&submission(&format!("Serviço {i}"))).await.unwrap();
            assert!(seen.insert(listing.id), "id reused: {}", listing.id);
            let listed = svc.list().await.unwrap();
            assert!(listed.iter().any(|s| s.id == listing.id));
        }
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_delete() {
        let svc = service();
        let first = svc.create(&submission("A")).await.unwrap();
        svc.delete(&admin(), first.id).await.unwrap();
        let second = svc.create(&submission("B")).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn invalid_pairing_creates_nothing() {
        let svc = service();
        let mut input = submission("A");
        input.activity_specification = "Encanamento".into();
        let err = svc.create(&input).await.unwrap_err();
        assert!(matches!(err, ListingError::Invalid(ref errors) if errors.len() == 1));
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_delete_removes_and_second_delete_is_not_found() {
        let svc = service();
        let listing = svc.create(&submission("A")).await.unwrap();
        let session = admin();
        svc.delete(&session, listing.id).await.unwrap();
        assert!(matches!(svc.get(listing.id).await, Err(ListingError::NotFound(_))));
        assert!(svc.list().await.unwrap().is_empty());
        assert!(matches!(
            svc.delete(&session, listing.id).await,
            Err(ListingError::NotFound(id)) if id == listing.id
        ));
    }

    #[tokio::test]
    async fn anonymous_or_expired_delete_is_unauthorized_and_keeps_record() {
        let svc = service();
        let listing = svc.create(&submission("A")).await.unwrap();
        assert!(matches!(
            svc.delete(&SessionContext::Anonymous, listing.id).await,
            Err(ListingError::Unauthorized)
        ));
        assert!(matches!(
            svc.delete(&SessionContext::Anonymous, ListingId(9999)).await,
            Err(ListingError::Unauthorized)
        ));
        let expired = SessionContext::Admin(AdminSession {
            id: uuid::Uuid::new_v4(),
            user_id: 1,
            username: "admin".into(),
            expires_at: Utc::now() - Duration::minutes(1),
        });
        assert!(matches!(
            svc.delete(&expired, listing.id).await,
            Err(ListingError::Unauthorized)
        ));
        assert_eq!(svc.get(listing.id).await.unwrap(), listing);
    }

    #[tokio::test]
    async fn export_renders_header_and_one_row() {
        let svc = service();
        let listing = svc.create(&submission("Pintura, escola \"central\"")).await.unwrap();
        let now = DateTime::parse_from_rfc3339("2024-01-10T08:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let export = svc.export_csv(listing.id, now).await.unwrap();
        assert_eq!(export.filename, "Pintura_escola_central_20240110_083005.csv");

        let mut reader = csv::Reader::from_reader(export.body.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_COLUMNS.to_vec());
        let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "Pintura, escola \"central\"");
        assert_eq!(&rows[0][11], "2024-01-20");
    }

    #[tokio::test]
    async fn export_of_unknown_id_is_not_found() {
        let svc = service();
        assert!(matches!(
            svc.export_csv(ListingId(42), Utc::now()).await,
            Err(ListingError::NotFound(ListingId(42)))
        ));
    }

    #[tokio::test]
    async fn export_all_requires_admin() {
        let svc = service();
        svc.create(&submission("A")).await.unwrap();
        svc.create(&submission("B")).await.unwrap();
        assert!(matches!(
            svc.export_all_csv(&SessionContext::Anonymous, Utc::now()).await,
            Err(ListingError::Unauthorized)
        ));
        let export = svc.export_all_csv(&admin(), Utc::now()).await.unwrap();
        let mut reader = csv::Reader::from_reader(export.body.as_slice());
        assert_eq!(reader.records().count(), 2);
        assert!(export.filename.starts_with("servicos_"));
    }

    #[test]
    fn slug_falls_back_when_nothing_survives() {
        assert_eq!(safe_slug("çãõ !!"), "_");
        assert_eq!(safe_slug("???"), "vaga");
        assert_eq!(safe_slug(&"x".repeat(200)).len(), 80);
    }

    #[tokio::test]
    async fn static_directory_finds_by_login() {
        let dir = StaticAdminDirectory::new(vec![AdminAccount {
            id: 3,
            login: "maria".into(),
            password_hash: "secret".into(),
        }]);
        assert_eq!(dir.find_account("maria").await.unwrap().unwrap().id, 3);
        assert!(dir.find_account("joao").await.unwrap().is_none());
    }
}
