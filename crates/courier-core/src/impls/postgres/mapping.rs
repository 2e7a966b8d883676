//! Table / column mapping and the SQL text built from it.
//!
//! SQL は起動時のマッピングから組み立てる。識別子は必ず `quote_ident` を通す。

use serde::{Deserialize, Serialize};

use crate::domain::{ItemFeatures, OutboxItemStatus};
use crate::ports::{LockDiscipline, RepositoryMode};

/// Where an outbox lives and what its columns are called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbMapping {
    pub schema: Option<String>,
    pub table: String,
    pub id: String,
    pub status: String,
    pub retry_count: String,
    pub retry_after: String,
    pub priority: String,
}

impl DbMapping {
    /// Default column names on `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// `"schema"."table"` or `"table"`.
    pub fn qualified_table(&self) -> String {
        self.qualified(&self.table)
    }

    /// A sibling relation in the same schema (partitions).
    pub fn qualified(&self, relation: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(relation)),
            None => quote_ident(relation),
        }
    }
}

impl Default for DbMapping {
    fn default() -> Self {
        Self {
            schema: None,
            table: "outbox".to_string(),
            id: "id".to_string(),
            status: "status".to_string(),
            retry_count: "retry_count".to_string(),
            retry_after: "retry_after".to_string(),
            priority: "priority".to_string(),
        }
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Lock-and-fetch query.
///
/// Binds: `$1` now, `$2` limit when the item has a status; only `$1` limit
/// otherwise.
pub fn fetch_query(mapping: &DbMapping, features: ItemFeatures, mode: RepositoryMode) -> String {
    let id = quote_ident(&mapping.id);
    let mut sql = format!("SELECT * FROM {}", mapping.qualified_table());

    let mut order = Vec::with_capacity(3);
    if features.priority {
        order.push(format!("{} DESC", quote_ident(&mapping.priority)));
    }
    order.push(format!("{id} ASC"));

    let limit = if features.status {
        let retry_after = quote_ident(&mapping.retry_after);
        sql.push_str(&format!(
            " WHERE ({retry_after} IS NULL OR {retry_after} <= $1)"
        ));
        if mode.partitioned {
            sql.push_str(&format!(
                " AND {} <> {}",
                quote_ident(&mapping.status),
                OutboxItemStatus::Completed.as_i32()
            ));
        }
        order.push(format!("{retry_after} ASC"));
        "$2"
    } else {
        "$1"
    };

    let lock = match mode.discipline {
        LockDiscipline::SkipLocked => "SKIP LOCKED",
        LockDiscipline::NoWait => "NOWAIT",
    };
    sql.push_str(&format!(
        " ORDER BY {} LIMIT {limit} FOR UPDATE {lock}",
        order.join(", ")
    ));
    sql
}

/// Binds: `$1` uuid[].
pub fn delete_query(mapping: &DbMapping) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ANY($1)",
        mapping.qualified_table(),
        quote_ident(&mapping.id)
    )
}

/// Binds: `$1` uuid[].
pub fn complete_query(mapping: &DbMapping) -> String {
    format!(
        "UPDATE {} SET {} = {} WHERE {} = ANY($1)",
        mapping.qualified_table(),
        quote_ident(&mapping.status),
        OutboxItemStatus::Completed.as_i32(),
        quote_ident(&mapping.id)
    )
}

/// Writes the status fields of many rows in one statement.
///
/// Binds: `$1` uuid[], `$2` int4[] status, `$3` int4[] retry_count,
/// `$4` timestamptz[] retry_after.
pub fn retry_update_query(mapping: &DbMapping) -> String {
    format!(
        "UPDATE {table} AS t \
         SET {status} = u.status, {count} = u.retry_count, {after} = u.retry_after \
         FROM UNNEST($1::uuid[], $2::int4[], $3::int4[], $4::timestamptz[]) \
         AS u(id, status, retry_count, retry_after) \
         WHERE t.{id} = u.id",
        table = mapping.qualified_table(),
        status = quote_ident(&mapping.status),
        count = quote_ident(&mapping.retry_count),
        after = quote_ident(&mapping.retry_after),
        id = quote_ident(&mapping.id),
    )
}

/// Binds: `$1` limit, `$2` offset.
pub fn chunk_query(mapping: &DbMapping) -> String {
    format!(
        "SELECT * FROM {} ORDER BY {} ASC LIMIT $1 OFFSET $2",
        mapping.qualified_table(),
        quote_ident(&mapping.id)
    )
}

/// Binds: `$1` uuid[].
pub fn restart_query(mapping: &DbMapping) -> String {
    format!(
        "UPDATE {} SET {} = {}, {} = NULL WHERE {} = ANY($1)",
        mapping.qualified_table(),
        quote_ident(&mapping.status),
        OutboxItemStatus::Ready.as_i32(),
        quote_ident(&mapping.retry_after),
        quote_ident(&mapping.id)
    )
}
