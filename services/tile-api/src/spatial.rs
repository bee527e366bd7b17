//! Spatial database executor.
//!
//! The spatial database is an external collaborator with a narrow contract:
//! per-pixel-value histograms for masked aggregation queries, and the DDL
//! statements behind raster vectorization. Connections are opened per query
//! call (each dataset lives in its own database) and never held across
//! requests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, Row};
use tracing::debug;

use crate::config::PostgisConfig;
use tiles_common::{TileError, TileResult};

/// One row of a pixel-value histogram: value → occurrence count.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct ValueCount {
    pub value: f64,
    pub count: i64,
}

/// Narrow query contract against the spatial database.
#[async_trait]
pub trait SpatialExecutor: Send + Sync {
    /// Pixel-value histogram of a raster table, optionally clipped to a
    /// GeoJSON geometry.
    async fn value_counts_geojson(
        &self,
        database: &str,
        table: &str,
        geojson: Option<&str>,
    ) -> TileResult<Vec<ValueCount>>;

    /// Pixel-value histogram of a raster table intersected against another
    /// raster table acting as the mask.
    async fn value_counts_raster_mask(
        &self,
        database: &str,
        table: &str,
        mask_table: &str,
    ) -> TileResult<Vec<ValueCount>>;

    /// Run a DDL/DML statement, returning affected rows.
    async fn execute(&self, database: &str, sql: &str) -> TileResult<u64>;

    /// Min/max/avg statistics for every value column of a table.
    async fn column_stats(&self, database: &str, table: &str) -> TileResult<Map<String, Value>>;
}

/// Derived subquery clipping a raster table to a GeoJSON mask geometry.
///
/// Replaces the plain table reference in the renderer's data source when
/// mask filtering is requested.
pub fn mask_clip_subquery(table: &str, geojson: &str) -> String {
    let geometry = format!(
        "st_transform(st_setsrid(ST_GeomFromGeoJSON('{}'), 4326), 3857)",
        geojson.replace('\'', "''")
    );
    format!(
        "(SELECT ST_Clip(rast, {geom}) AS rast FROM {table} WHERE ST_Intersects(rast, {geom})) as subquery",
        geom = geometry,
        table = table,
    )
}

/// sqlx-backed executor.
pub struct PostgisExecutor {
    config: PostgisConfig,
}

impl PostgisExecutor {
    pub fn new(config: PostgisConfig) -> Self {
        Self { config }
    }

    async fn pool(&self, database: &str) -> TileResult<sqlx::PgPool> {
        PgPoolOptions::new()
            .max_connections(2)
            .connect(&self.config.url(database))
            .await
            .map_err(|e| TileError::Database(format!("Connection failed: {}", e)))
    }

    async fn fetch_counts(&self, database: &str, sql: &str) -> TileResult<Vec<ValueCount>> {
        let pool = self.pool(database).await?;
        debug!(database = %database, "Running histogram query");

        let rows = sqlx::query_as::<_, ValueCount>(sql)
            .fetch_all(&pool)
            .await
            .map_err(|e| TileError::Database(format!("Query failed: {}", e)));

        pool.close().await;
        rows
    }
}

#[async_trait]
impl SpatialExecutor for PostgisExecutor {
    async fn value_counts_geojson(
        &self,
        database: &str,
        table: &str,
        geojson: Option<&str>,
    ) -> TileResult<Vec<ValueCount>> {
        let sql = match geojson {
            Some(geometry) => format!(
                "SELECT (pvc).value::float8 AS value, (pvc).count::int8 AS count \
                 FROM {table}, ST_ValueCount(rast, 1) AS pvc \
                 WHERE st_intersects(st_transform(st_setsrid(ST_GeomFromGeoJSON('{geom}'), 4326), 3857), rast)",
                table = table,
                geom = geometry.replace('\'', "''"),
            ),
            None => format!(
                "SELECT (pvc).value::float8 AS value, (pvc).count::int8 AS count \
                 FROM {table}, ST_ValueCount(rast, 1) AS pvc",
                table = table,
            ),
        };

        self.fetch_counts(database, &sql).await
    }

    async fn value_counts_raster_mask(
        &self,
        database: &str,
        table: &str,
        mask_table: &str,
    ) -> TileResult<Vec<ValueCount>> {
        let sql = format!(
            "SELECT (pvc).value::float8 AS value, (pvc).count::int8 AS count \
             FROM {table} AS a INNER JOIN {mask} AS b ON ST_Intersects(a.rast, b.rast), \
             LATERAL ST_ValueCount(ST_Clip(a.rast, ST_Polygon(b.rast)), 1) AS pvc",
            table = table,
            mask = mask_table,
        );

        self.fetch_counts(database, &sql).await
    }

    async fn execute(&self, database: &str, sql: &str) -> TileResult<u64> {
        let pool = self.pool(database).await?;

        let result = sqlx::query(sql)
            .execute(&pool)
            .await
            .map_err(|e| TileError::Database(format!("Execute failed: {}", e)));

        pool.close().await;
        Ok(result?.rows_affected())
    }

    async fn column_stats(&self, database: &str, table: &str) -> TileResult<Map<String, Value>> {
        let pool = self.pool(database).await?;

        // Column discovery through a single-row probe.
        let probe = sqlx::query(&format!("SELECT * FROM {} LIMIT 1", table))
            .fetch_optional(&pool)
            .await
            .map_err(|e| TileError::Database(format!("Column probe failed: {}", e)))?;

        let mut stats = Map::new();
        let mut columns: Vec<String> = Vec::new();

        if let Some(row) = probe {
            for column in row.columns() {
                let name = column.name().to_string();
                if name != "geom" && name != "the_geom_3857" {
                    columns.push(name);
                }
            }
        }

        for column in &columns {
            let sql = format!(
                "SELECT MIN({col})::float8 AS min, MAX({col})::float8 AS max, AVG({col})::float8 AS avg FROM {table}",
                col = column,
                table = table,
            );

            let row = sqlx::query(&sql)
                .fetch_one(&pool)
                .await
                .map_err(|e| TileError::Database(format!("Stats query failed: {}", e)))?;

            let min: Option<f64> = row.try_get("min").unwrap_or(None);
            let max: Option<f64> = row.try_get("max").unwrap_or(None);
            let avg: Option<f64> = row.try_get("avg").unwrap_or(None);

            stats.insert(
                column.clone(),
                serde_json::json!({ "min": min, "max": max, "avg": avg }),
            );
        }

        stats.insert(
            "_columns".to_string(),
            Value::Array(columns.into_iter().map(Value::String).collect()),
        );

        pool.close().await;
        Ok(stats)
    }
}

/// SQL for dumping a raster into polygons under a new table.
pub fn vectorize_dump_sql(source_table: &str, target_table: &str) -> String {
    format!(
        "SELECT val, geom INTO {target} FROM (SELECT (ST_DumpAsPolygons(rast)).* FROM {source}) As foo ORDER BY val",
        target = target_table,
        source = source_table,
    )
}

/// SQL statements adding and populating the projected geometry column.
pub fn prime_geometry_sql(table: &str) -> Vec<String> {
    vec![
        format!(
            "ALTER TABLE {} ADD COLUMN the_geom_3857 geometry(Geometry, 3857)",
            table
        ),
        format!(
            "UPDATE {} SET the_geom_3857 = ST_Transform(ST_SetSRID(geom, 4326), 3857)",
            table
        ),
        format!(
            "CREATE INDEX ON {} USING GIST (the_geom_3857)",
            table
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_clip_subquery_shape() {
        let sql = mask_clip_subquery("file_abc", r#"{"type":"Polygon","coordinates":[]}"#);
        assert!(sql.starts_with("(SELECT ST_Clip(rast,"));
        assert!(sql.ends_with(") as subquery"));
        assert!(sql.contains("FROM file_abc"));
        assert!(sql.contains("ST_Intersects"));
    }

    #[test]
    fn test_mask_clip_subquery_escapes_quotes() {
        let sql = mask_clip_subquery("t", r#"{"name":"o'brien"}"#);
        assert!(sql.contains("o''brien"));
    }

    #[test]
    fn test_vectorize_sql() {
        let sql = vectorize_dump_sql("file_src", "file_dst");
        assert!(sql.contains("INTO file_dst"));
        assert!(sql.contains("ST_DumpAsPolygons"));

        let prime = prime_geometry_sql("file_dst");
        assert_eq!(prime.len(), 3);
        assert!(prime[0].contains("the_geom_3857"));
    }
}
