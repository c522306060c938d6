//! Incremental builder for the parameterized SQL the repositories run.

use arca_core::{Filter, StoreError, StoreResult};

/// Parameter value carried alongside built SQL, bound in placeholder
/// order by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Json(serde_json::Value),
}

/// Builds WHERE clauses predicate by predicate and renders the final
/// statements. The tenant discriminator always comes first; `name` and
/// `namespace` follow when the filter pins them down.
#[derive(Debug)]
pub struct QueryBuilder {
    table: String,
    predicates: Vec<String>,
    params: Vec<SqlParam>,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), predicates: Vec::new(), params: Vec::new() }
    }

    /// Tenant discriminator first, then whatever the filter constrains.
    pub fn apply_filter(&mut self, cluster_id: &str, filter: &Filter) -> &mut Self {
        self.predicate("cluster_id", cluster_id);
        if let Some(name) = filter.name() {
            self.predicate("name", name);
        }
        if let Some(ns) = filter.namespace() {
            self.predicate("namespace", ns);
        }
        self
    }

    /// Equality predicate on one column.
    pub fn predicate(&mut self, column: &str, value: &str) -> &mut Self {
        self.params.push(SqlParam::Text(value.to_string()));
        self.predicates.push(format!("{} = ${}", column, self.params.len()));
        self
    }

    fn where_clause(&self) -> String {
        if self.predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.predicates.join(" AND "))
        }
    }

    /// Point ops must constrain more than the tenant. A WHERE clause that
    /// reduces to "every row of this tenant" is a coding error, refused
    /// here instead of executed.
    fn require_point_predicates(&self, op: &str) -> StoreResult<()> {
        if self.predicates.len() < 2 {
            return Err(StoreError::InvalidFilter(format!(
                "{} on {} needs a predicate beyond cluster_id",
                op, self.table
            )));
        }
        Ok(())
    }

    /// `SELECT report ... ORDER BY name`; the sort keeps list results
    /// deterministic across repeated calls.
    pub fn build_select(&self) -> (String, Vec<SqlParam>) {
        let sql = format!(
            "SELECT report FROM {}{} ORDER BY name",
            self.table,
            self.where_clause()
        );
        (sql, self.params.clone())
    }

    /// Insert over `columns` in bind order. With `upsert`, appends an
    /// ON CONFLICT clause over the key columns that rewrites every
    /// non-key column from EXCLUDED. Strict create paths must pass
    /// `upsert = false` and rely on a preceding existence check.
    pub fn build_insert(&self, columns: &[&str], key_columns: &[&str], upsert: bool) -> String {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        if upsert {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !key_columns.contains(c))
                .map(|c| format!("{} = EXCLUDED.{}", c, c))
                .collect();
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                key_columns.join(", "),
                updates.join(", ")
            ));
        }
        sql
    }

    /// `UPDATE ... SET report = $n`; the new report value is appended to
    /// the returned params so binding stays in placeholder order.
    pub fn build_update(&self, report: SqlParam) -> StoreResult<(String, Vec<SqlParam>)> {
        self.require_point_predicates("update")?;
        let sql = format!(
            "UPDATE {} SET report = ${}{}",
            self.table,
            self.params.len() + 1,
            self.where_clause()
        );
        let mut params = self.params.clone();
        params.push(report);
        Ok((sql, params))
    }

    pub fn build_delete(&self) -> StoreResult<(String, Vec<SqlParam>)> {
        self.require_point_predicates("delete")?;
        let sql = format!("DELETE FROM {}{}", self.table, self.where_clause());
        Ok((sql, self.params.clone()))
    }
}
