//! Postgres implementations of the company and execution stores.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use harvest_core::{
    BatchStatus, CompanyRecord, JobExecutionRecord, JobInstance, JobParameters, StepCounters,
    PLACEHOLDER,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, Postgres, Row, Transaction};

use crate::company::{CompanyStore, CompanyTx};
use crate::execution::ExecutionStore;
use crate::StoreError;

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

const COMPANY_COLUMNS: &str = "id, company, key_executive, industry, address, homepage, email, \
     phone_number, sales, total_funding, logo_url, created_at, updated_at";

fn text_column(row: &PgRow, column: &str) -> Result<String, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    Ok(value.unwrap_or_else(|| PLACEHOLDER.to_string()))
}

fn company_from_row(row: &PgRow) -> Result<CompanyRecord, sqlx::Error> {
    Ok(CompanyRecord {
        id: Some(row.try_get("id")?),
        company: row.try_get("company")?,
        key_executive: text_column(row, "key_executive")?,
        industry: text_column(row, "industry")?,
        address: text_column(row, "address")?,
        homepage: text_column(row, "homepage")?,
        email: text_column(row, "email")?,
        phone_number: text_column(row, "phone_number")?,
        sales: text_column(row, "sales")?,
        total_funding: text_column(row, "total_funding")?,
        logo_url: text_column(row, "logo_url")?,
        created_at: Some(row.try_get("created_at")?),
        updated_at: Some(row.try_get("updated_at")?),
    })
}

async fn insert_company(
    conn: &mut PgConnection,
    record: &CompanyRecord,
) -> Result<CompanyRecord, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO company_data
            (company, key_executive, industry, address, homepage, email, phone_number,
             sales, total_funding, logo_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {COMPANY_COLUMNS}
        "#
    ))
    .bind(&record.company)
    .bind(&record.key_executive)
    .bind(&record.industry)
    .bind(&record.address)
    .bind(&record.homepage)
    .bind(&record.email)
    .bind(&record.phone_number)
    .bind(&record.sales)
    .bind(&record.total_funding)
    .bind(&record.logo_url)
    .fetch_one(conn)
    .await?;
    company_from_row(&row)
}

async fn update_company(
    conn: &mut PgConnection,
    id: i64,
    record: &CompanyRecord,
) -> Result<CompanyRecord, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE company_data
           SET company = $2, key_executive = $3, industry = $4, address = $5,
               homepage = $6, email = $7, phone_number = $8, sales = $9,
               total_funding = $10, logo_url = $11, updated_at = now()
         WHERE id = $1
        RETURNING {COMPANY_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(&record.company)
    .bind(&record.key_executive)
    .bind(&record.industry)
    .bind(&record.address)
    .bind(&record.homepage)
    .bind(&record.email)
    .bind(&record.phone_number)
    .bind(&record.sales)
    .bind(&record.total_funding)
    .bind(&record.logo_url)
    .fetch_one(conn)
    .await?;
    company_from_row(&row)
}

#[derive(Debug, Clone)]
pub struct PgCompanyStore {
    pool: PgPool,
}

impl PgCompanyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompanyStore for PgCompanyStore {
    async fn begin(&self) -> Result<Box<dyn CompanyTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCompanyTx { tx }))
    }
}

/// Each call runs inside its own savepoint so a failed statement only rolls back itself.
struct PgCompanyTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CompanyTx for PgCompanyTx {
    async fn find_by_company_name(
        &mut self,
        company: &str,
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let rows = sqlx::query(&format!(
            "SELECT {COMPANY_COLUMNS} FROM company_data WHERE company = $1 ORDER BY id"
        ))
        .bind(company)
        .fetch_all(&mut *savepoint)
        .await?;
        savepoint.commit().await?;
        Ok(rows
            .iter()
            .map(company_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn save(&mut self, record: &CompanyRecord) -> Result<CompanyRecord, StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let stored = match record.id {
            Some(id) => update_company(&mut savepoint, id, record).await?,
            None => insert_company(&mut savepoint, record).await?,
        };
        savepoint.commit().await?;
        Ok(stored)
    }

    async fn save_all(
        &mut self,
        records: &[CompanyRecord],
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            stored.push(insert_company(&mut savepoint, record).await?);
        }
        savepoint.commit().await?;
        Ok(stored)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const EXECUTION_COLUMNS: &str =
    "id, job_name, instance_key, status, start_time, end_time, parameters, exit_message, counters";

fn execution_from_row(row: &PgRow) -> Result<JobExecutionRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = BatchStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown batch status {status}")))?;
    let parameters: Json<JobParameters> = row.try_get("parameters")?;
    let counters: Json<StepCounters> = row.try_get("counters")?;
    Ok(JobExecutionRecord {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        instance_key: row.try_get("instance_key")?,
        status,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        parameters: parameters.0,
        exit_message: row.try_get("exit_message")?,
        counters: counters.0,
    })
}

fn executions_from_rows(rows: &[PgRow]) -> Result<Vec<JobExecutionRecord>, StoreError> {
    rows.iter().map(execution_from_row).collect()
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create_execution(&self, execution: &JobExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_executions
                (id, job_name, instance_key, status, start_time, end_time, parameters,
                 exit_message, counters)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.job_name)
        .bind(&execution.instance_key)
        .bind(execution.status.as_str())
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(Json(&execution.parameters))
        .bind(&execution.exit_message)
        .bind(Json(&execution.counters))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_execution(&self, execution: &JobExecutionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
               SET status = $2, start_time = $3, end_time = $4, exit_message = $5, counters = $6
             WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status.as_str())
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(&execution.exit_message)
        .bind(Json(&execution.counters))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Access(format!(
                "unknown execution {}",
                execution.id
            )));
        }
        Ok(())
    }

    async fn find_executions_by_job_name(
        &self,
        job_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
              FROM job_executions
             WHERE job_name = $1
             ORDER BY start_time DESC NULLS LAST
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(job_name)
        .bind(offset as i64)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        executions_from_rows(&rows)
    }

    async fn find_instances_by_job_name(
        &self,
        job_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_name, instance_key, MAX(start_time) AS last_start
              FROM job_executions
             WHERE job_name = $1
             GROUP BY job_name, instance_key
             ORDER BY last_start DESC NULLS LAST
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(job_name)
        .bind(offset as i64)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JobInstance {
                job_name: row.try_get("job_name")?,
                instance_key: row.try_get("instance_key")?,
            });
        }
        Ok(out)
    }

    async fn executions_for_instance(
        &self,
        instance: &JobInstance,
    ) -> Result<Vec<JobExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
              FROM job_executions
             WHERE job_name = $1 AND instance_key = $2
             ORDER BY start_time DESC NULLS LAST
            "#
        ))
        .bind(&instance.job_name)
        .bind(&instance.instance_key)
        .fetch_all(&self.pool)
        .await?;
        executions_from_rows(&rows)
    }

    async fn find_active_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
              FROM job_executions
             WHERE job_name = $1 AND status IN ('STARTING', 'RUNNING')
            "#
        ))
        .bind(job_name)
        .fetch_all(&self.pool)
        .await?;
        executions_from_rows(&rows)
    }
}
