use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use svcboard_core::{ListingFields, ListingId, ServiceListing};
use tracing::info;

use crate::{AdminAccount, AdminDirectory, ListingStore};

const LISTING_COLUMNS: &str = r#"
    id, orgao_demandante, titulo_servico, tipo_atividade, especificacao_atividade,
    descricao_servico, outras_informacoes, endereco, numero, bairro,
    forma_pagamento, prazo_pagamento, prazo_expiracao, data_limite_execucao, created_at
"#;

/// Postgres-backed listing store and admin directory.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying svcboard migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    /// Create or replace the password hash of an admin account; returns its id.
    pub async fn upsert_admin_account(&self, login: &str, password_hash: &str) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO admin_accounts (login, password_hash)
            VALUES ($1, $2)
            ON CONFLICT (login) DO UPDATE SET password_hash = EXCLUDED.password_hash
            RETURNING id
            "#,
        )
        .bind(login)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting admin account {login}"))?;
        Ok(row.try_get("id")?)
    }
}

fn listing_from_row(row: &PgRow) -> anyhow::Result<ServiceListing> {
    let id: i64 = row.try_get("id")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let expiration_deadline: NaiveDate = row.try_get("prazo_expiracao")?;
    let execution_deadline: NaiveDate = row.try_get("data_limite_execucao")?;
    Ok(ServiceListing {
        id: ListingId(id),
        created_at,
        fields: ListingFields {
            requesting_agency: row.try_get("orgao_demandante")?,
            title: row.try_get("titulo_servico")?,
            activity_type: row.try_get("tipo_atividade")?,
            activity_specification: row.try_get("especificacao_atividade")?,
            description: row.try_get("descricao_servico")?,
            additional_information: row.try_get("outras_informacoes")?,
            address: row.try_get("endereco")?,
            house_number: row.try_get("numero")?,
            neighborhood: row.try_get("bairro")?,
            payment_method: row.try_get("forma_pagamento")?,
            payment_term: row.try_get("prazo_pagamento")?,
            expiration_deadline,
            execution_deadline,
        },
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn insert(&self, fields: ListingFields) -> anyhow::Result<ServiceListing> {
        let sql = format!(
            r#"
            INSERT INTO service_listings (
                orgao_demandante, titulo_servico, tipo_atividade, especificacao_atividade,
                descricao_servico, outras_informacoes, endereco, numero, bairro,
                forma_pagamento, prazo_pagamento, prazo_expiracao, data_limite_execucao
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {LISTING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&fields.requesting_agency)
            .bind(&fields.title)
            .bind(&fields.activity_type)
            .bind(&fields.activity_specification)
            .bind(&fields.description)
            .bind(&fields.additional_information)
            .bind(&fields.address)
            .bind(&fields.house_number)
            .bind(&fields.neighborhood)
            .bind(&fields.payment_method)
            .bind(&fields.payment_term)
            .bind(fields.expiration_deadline)
            .bind(fields.execution_deadline)
            .fetch_one(&self.pool)
            .await
            .context("inserting service listing")?;
        listing_from_row(&row)
    }

    async fn list(&self) -> anyhow::Result<Vec<ServiceListing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM service_listings ORDER BY created_at DESC, id DESC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("listing service listings")?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn get(&self, id: ListingId) -> anyhow::Result<Option<ServiceListing>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM service_listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading service listing {id}"))?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn delete(&self, id: ListingId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM service_listings WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting service listing {id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl AdminDirectory for PgListingStore {
    async fn find_account(&self, login: &str) -> anyhow::Result<Option<AdminAccount>> {
        let row = sqlx::query("SELECT id, login, password_hash FROM admin_accounts WHERE login = $1")
            .bind(login)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading admin account {login}"))?;
        row.map(|row| -> anyhow::Result<AdminAccount> {
            Ok(AdminAccount {
                id: row.try_get("id")?,
                login: row.try_get("login")?,
                password_hash: row.try_get("password_hash")?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Runs only against a live database; CI without DATABASE_URL skips it.
    #[tokio::test]
    async fn postgres_store_round_trips_and_deletes() -> anyhow::Result<()> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return Ok(());
        };
        let store = PgListingStore::connect(&url).await?;
        store.migrate().await?;

        let fields = ListingFields {
            requesting_agency: "Secretaria de Saúde".into(),
            title: "Manutenção de ar-condicionado".into(),
            activity_type: "Técnico".into(),
            activity_specification: "Ar-condicionado".into(),
            description: "Limpeza de filtros".into(),
            additional_information: None,
            address: "Rua A".into(),
            house_number: "10".into(),
            neighborhood: "Centro".into(),
            payment_method: "Cheque".into(),
            payment_term: "30 dias".into(),
            expiration_deadline: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            execution_deadline: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        };
        let created = store.insert(fields.clone()).await?;
        assert_eq!(created.fields, fields);
        assert_eq!(store.get(created.id).await?.map(|l| l.fields), Some(fields));
        assert!(store.delete(created.id).await?);
        assert!(!store.delete(created.id).await?);
        assert!(store.get(created.id).await?.is_none());

        let admin_id = store.upsert_admin_account("svcboard-test", "plain").await?;
        let account = store.find_account("svcboard-test").await?.expect("account");
        assert_eq!(account.id, admin_id);
        Ok(())
    }
}
