use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::utils;

#[async_trait::async_trait]
pub trait Table {
    type Record<'a>;

    fn get_name(&self) -> &str;
    fn get_pool(&self) -> &SqlitePool;

    /// Column definitions used by [`Table::create`].
    fn get_schema(&self) -> &str;

    /// Inserts `record` through `conn`, so callers decide the transaction
    /// it belongs to. Returns the new row id.
    async fn insert<'a>(
        &self,
        conn: &mut SqliteConnection,
        record: Self::Record<'a>,
    ) -> Result<i64, sqlx::Error>;

    async fn create(&self) -> Result<(), sqlx::Error> {
        if !utils::is_table_exists(self.get_pool(), self.get_name()).await? {
            let query = format!("CREATE TABLE {} ({})", self.get_name(), self.get_schema());
            sqlx::query(&query).execute(self.get_pool()).await?;
            tracing::debug!("Create table {}", self.get_name());
        } else {
            tracing::debug!("Use table {}", self.get_name());
        }
        Ok(())
    }

    async fn is_exist(&self, id: i64) -> Result<bool, sqlx::Error> {
        let query = format!("SELECT id FROM {} WHERE id = ?", self.get_name());
        Ok(sqlx::query(&query)
            .bind(id)
            .fetch_optional(self.get_pool())
            .await?
            .is_some())
    }

    async fn count(&self) -> Result<u32, sqlx::Error> {
        let query = format!("SELECT COUNT(*) FROM {}", self.get_name());
        Ok(sqlx::query(&query)
            .fetch_one(self.get_pool())
            .await?
            .try_get(0)?)
    }
}
