//! SQL classification used for routing.
//!
//! Classification never fails: text that does not parse is treated as a write
//! touching no known tables, which forces full-roster synchronization instead
//! of risking a stale read.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_relations, Expr, Ident, ObjectName, SelectItem, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::types::QueryKind;

/// Routing metadata derived from query text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub kind: QueryKind,
    pub tables: BTreeSet<String>,
}

impl Classification {
    fn conservative() -> Self {
        Self {
            kind: QueryKind::Write,
            tables: BTreeSet::new(),
        }
    }
}

fn parse_sql(sql: &str) -> Result<Vec<Statement>, String> {
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| e.to_string())
}

/// Classify `sql` as a read or a write and collect the tables it references.
pub fn classify(sql: &str) -> Classification {
    let statements = match parse_sql(sql) {
        Ok(statements) => statements,
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse SQL, classifying as write");
            return Classification::conservative();
        }
    };
    if statements.is_empty() {
        return Classification::conservative();
    }

    let kind = if statements.iter().all(is_read) {
        QueryKind::Read
    } else {
        QueryKind::Write
    };
    Classification {
        kind,
        tables: referenced_tables(&statements),
    }
}

fn is_read(statement: &Statement) -> bool {
    let Statement::Query(query) = statement else {
        return false;
    };
    // Data-modifying CTEs make the whole statement a write.
    let ctes_read = query
        .with
        .as_ref()
        .map_or(true, |with| with.cte_tables.iter().all(|cte| is_read_body(&cte.query.body)));
    ctes_read && is_read_body(&query.body)
}

fn is_read_body(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_body(&query.body),
        SetExpr::SetOperation { left, right, .. } => is_read_body(left) && is_read_body(right),
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

fn referenced_tables(statements: &[Statement]) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    for statement in statements {
        let _ = visit_relations(statement, |relation: &ObjectName| {
            if let Some(name) = relation.0.last().map(normalize_ident) {
                tables.insert(name);
            }
            ControlFlow::<()>::Continue(())
        });
    }
    tables
}

/// Unquoted identifiers fold to lower case; quoted ones keep their spelling.
fn normalize_ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

/// Column names a statement will return, when they can be read off the SQL.
///
/// Returns `Some(vec![])` for statements that return no rows, and `None` when
/// the shape depends on the schema (`SELECT *`, `RETURNING *`) or the text
/// does not parse.
pub fn result_columns(sql: &str) -> Option<Vec<String>> {
    let statements = parse_sql(sql).ok()?;
    let [statement] = statements.as_slice() else {
        return None;
    };
    match statement {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => projection_names(&select.projection),
            _ => None,
        },
        Statement::Insert(insert) => returning_names(insert.returning.as_deref()),
        Statement::Update { returning, .. } => returning_names(returning.as_deref()),
        Statement::Delete(delete) => returning_names(delete.returning.as_deref()),
        _ => Some(Vec::new()),
    }
}

fn returning_names(returning: Option<&[SelectItem]>) -> Option<Vec<String>> {
    match returning {
        Some(items) => projection_names(items),
        None => Some(Vec::new()),
    }
}

fn projection_names(items: &[SelectItem]) -> Option<Vec<String>> {
    items
        .iter()
        .map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
            SelectItem::UnnamedExpr(expr) => Some(expr_column_name(expr)),
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => None,
        })
        .collect()
}

fn expr_column_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => normalize_ident(ident),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(normalize_ident)
            .unwrap_or_else(|| "?column?".to_string()),
        Expr::Function(func) => func
            .name
            .0
            .last()
            .map(normalize_ident)
            .unwrap_or_else(|| "?column?".to_string()),
        Expr::Nested(inner) => expr_column_name(inner),
        _ => "?column?".to_string(),
    }
}
