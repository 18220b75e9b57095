//! In-process storage engine.
//!
//! Understands the small SQL subset the relay workload uses: `CREATE TABLE`,
//! `INSERT ... VALUES`, `SELECT`, `UPDATE` and `DELETE` with equality filters,
//! and `RETURNING`. Every statement it is asked to run is logged so tests can
//! count executions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use relay_core::ResultSet;
use sqlparser::ast::{
    AssignmentTarget, BinaryOperator, Expr, FromTable, Ident, ObjectName, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::engine::StorageEngine;

type Row = Vec<Option<String>>;

#[derive(Clone, Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    fn column_index(&self, name: &str) -> anyhow::Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| anyhow::anyhow!("column \"{name}\" does not exist"))
    }
}

#[derive(Default)]
pub struct MemoryEngine {
    tables: Mutex<BTreeMap<String, Table>>,
    log: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Make every following statement fail, simulating an unhealthy database.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    fn run(&self, sql: &str) -> anyhow::Result<ResultSet> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|err| anyhow::anyhow!("syntax error: {err}"))?;
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| anyhow::anyhow!("memory engine lock poisoned"))?;
        let mut result = ResultSet::empty();
        for statement in &statements {
            result = run_statement(&mut tables, statement)?;
        }
        Ok(result)
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn execute(&self, sql: &str) -> anyhow::Result<ResultSet> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("storage engine unavailable");
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }
        self.run(sql)
    }
}

fn run_statement(
    tables: &mut BTreeMap<String, Table>,
    statement: &Statement,
) -> anyhow::Result<ResultSet> {
    match statement {
        Statement::CreateTable(create) => {
            let name = table_name(&create.name)?;
            if tables.contains_key(&name) {
                anyhow::ensure!(create.if_not_exists, "relation \"{name}\" already exists");
                return Ok(ResultSet::empty());
            }
            let columns = create.columns.iter().map(|c| ident(&c.name)).collect();
            tables.insert(name, Table { columns, rows: Vec::new() });
            Ok(ResultSet::empty())
        }
        Statement::Insert(insert) => {
            let table = lookup(tables, &table_name(&insert.table_name)?)?;
            let targets = if insert.columns.is_empty() {
                (0..table.columns.len()).collect::<Vec<_>>()
            } else {
                insert
                    .columns
                    .iter()
                    .map(|c| table.column_index(&ident(c)))
                    .collect::<anyhow::Result<Vec<_>>>()?
            };
            let source = insert
                .source
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("INSERT without VALUES is not supported"))?;
            let SetExpr::Values(values) = source.body.as_ref() else {
                anyhow::bail!("only INSERT ... VALUES is supported");
            };

            let mut inserted = Vec::with_capacity(values.rows.len());
            for exprs in &values.rows {
                anyhow::ensure!(
                    exprs.len() == targets.len(),
                    "INSERT has {} expressions but {} target columns",
                    exprs.len(),
                    targets.len()
                );
                let mut row: Row = vec![None; table.columns.len()];
                for (idx, expr) in targets.iter().zip(exprs) {
                    row[*idx] = literal(expr)?;
                }
                inserted.push(row);
            }
            table.rows.extend(inserted.iter().cloned());
            returning(table, insert.returning.as_deref(), inserted)
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                anyhow::bail!("unsupported query form");
            };
            if select.from.is_empty() {
                return constant_row(&select.projection);
            }
            let table = lookup(tables, &from_table(&select.from)?)?;
            let rows = table
                .rows
                .iter()
                .filter_map(|row| match filter(table, select.selection.as_ref(), row) {
                    Ok(true) => Some(Ok(row.clone())),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            project(table, &select.projection, rows)
        }
        Statement::Update {
            table: target,
            assignments,
            selection,
            returning: returning_items,
            ..
        } => {
            let table = lookup(tables, &from_table(std::slice::from_ref(target))?)?;
            let mut updates = Vec::with_capacity(assignments.len());
            for assignment in assignments {
                let AssignmentTarget::ColumnName(name) = &assignment.target else {
                    anyhow::bail!("tuple assignment is not supported");
                };
                updates.push((table.column_index(&table_name(name)?)?, literal(&assignment.value)?));
            }
            let mut changed = Vec::new();
            for idx in 0..table.rows.len() {
                if filter(table, selection.as_ref(), &table.rows[idx])? {
                    for (column, value) in &updates {
                        table.rows[idx][*column] = value.clone();
                    }
                    changed.push(table.rows[idx].clone());
                }
            }
            returning(table, returning_items.as_deref(), changed)
        }
        Statement::Delete(delete) => {
            let from = match &delete.from {
                FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from) => from,
            };
            let table = lookup(tables, &from_table(from)?)?;
            let mut kept = Vec::with_capacity(table.rows.len());
            let mut removed = Vec::new();
            for row in std::mem::take(&mut table.rows) {
                if filter(table, delete.selection.as_ref(), &row)? {
                    removed.push(row);
                } else {
                    kept.push(row);
                }
            }
            table.rows = kept;
            returning(table, delete.returning.as_deref(), removed)
        }
        other => anyhow::bail!("unsupported statement: {other}"),
    }
}

fn lookup<'a>(tables: &'a mut BTreeMap<String, Table>, name: &str) -> anyhow::Result<&'a mut Table> {
    tables
        .get_mut(name)
        .ok_or_else(|| anyhow::anyhow!("relation \"{name}\" does not exist"))
}

fn ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn table_name(name: &ObjectName) -> anyhow::Result<String> {
    name.0
        .last()
        .map(ident)
        .ok_or_else(|| anyhow::anyhow!("empty object name"))
}

fn from_table(from: &[TableWithJoins]) -> anyhow::Result<String> {
    let [TableWithJoins { relation, joins }] = from else {
        anyhow::bail!("exactly one table is supported");
    };
    anyhow::ensure!(joins.is_empty(), "joins are not supported");
    match relation {
        TableFactor::Table { name, .. } => table_name(name),
        _ => anyhow::bail!("unsupported table expression"),
    }
}

fn literal(expr: &Expr) -> anyhow::Result<Option<String>> {
    match expr {
        Expr::Value(Value::Null) => Ok(None),
        Expr::Value(Value::Number(n, _)) => Ok(Some(n.clone())),
        Expr::Value(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Expr::Value(Value::Boolean(b)) => Ok(Some(if *b { "t" } else { "f" }.to_string())),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|v| format!("-{v}"))),
        Expr::Nested(inner) => literal(inner),
        other => anyhow::bail!("unsupported expression: {other}"),
    }
}

fn filter(table: &Table, selection: Option<&Expr>, row: &Row) -> anyhow::Result<bool> {
    let Some(expr) = selection else {
        return Ok(true);
    };
    match expr {
        Expr::Nested(inner) => filter(table, Some(inner), row),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => Ok(filter(table, Some(left), row)? && filter(table, Some(right), row)?),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => Ok(filter(table, Some(left), row)? || filter(table, Some(right), row)?),
        Expr::BinaryOp {
            left,
            op: op @ (BinaryOperator::Eq | BinaryOperator::NotEq),
            right,
        } => {
            let (column, value) = match (left.as_ref(), right.as_ref()) {
                (Expr::Identifier(column), value) | (value, Expr::Identifier(column)) => {
                    (column, value)
                }
                _ => anyhow::bail!("comparisons must be column = literal"),
            };
            let current = &row[table.column_index(&ident(column))?];
            let wanted = literal(value)?;
            // NULL never compares equal.
            let equal = current.is_some() && *current == wanted;
            Ok(if matches!(op, BinaryOperator::Eq) {
                equal
            } else {
                current.is_some() && wanted.is_some() && !equal
            })
        }
        other => anyhow::bail!("unsupported filter: {other}"),
    }
}

fn project(table: &Table, projection: &[SelectItem], rows: Vec<Row>) -> anyhow::Result<ResultSet> {
    let mut names = Vec::new();
    let mut indexes = Vec::new();
    for item in projection {
        match item {
            SelectItem::Wildcard(_) => {
                names.extend(table.columns.iter().cloned());
                indexes.extend(0..table.columns.len());
            }
            SelectItem::UnnamedExpr(Expr::Identifier(column)) => {
                let name = ident(column);
                indexes.push(table.column_index(&name)?);
                names.push(name);
            }
            SelectItem::ExprWithAlias {
                expr: Expr::Identifier(column),
                alias,
            } => {
                indexes.push(table.column_index(&ident(column))?);
                names.push(ident(alias));
            }
            other => anyhow::bail!("unsupported projection: {other}"),
        }
    }
    let rows = rows
        .into_iter()
        .map(|row| indexes.iter().map(|idx| row[*idx].clone()).collect())
        .collect();
    Ok(ResultSet { columns: names, rows })
}

fn returning(table: &Table, items: Option<&[SelectItem]>, rows: Vec<Row>) -> anyhow::Result<ResultSet> {
    match items {
        Some(items) => project(table, items, rows),
        None => Ok(ResultSet::empty()),
    }
}

fn constant_row(projection: &[SelectItem]) -> anyhow::Result<ResultSet> {
    let mut result = ResultSet {
        columns: Vec::with_capacity(projection.len()),
        rows: vec![Vec::with_capacity(projection.len())],
    };
    for item in projection {
        let (name, expr) = match item {
            SelectItem::UnnamedExpr(expr) => ("?column?".to_string(), expr),
            SelectItem::ExprWithAlias { expr, alias } => (ident(alias), expr),
            other => anyhow::bail!("unsupported projection: {other}"),
        };
        result.columns.push(name);
        result.rows[0].push(literal(expr)?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine_with_users() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine
            .execute("CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, email TEXT)")
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn insert_returning_and_select() {
        let engine = engine_with_users().await;
        let inserted = engine
            .execute("INSERT INTO users (id, name) VALUES ('u1', 'Ada') RETURNING *")
            .await
            .unwrap();
        assert_eq!(inserted.columns, vec!["id", "name", "email"]);
        assert_eq!(
            inserted.rows,
            vec![vec![Some("u1".to_string()), Some("Ada".to_string()), None]]
        );

        let rows = engine
            .execute("SELECT name FROM users WHERE id = 'u1'")
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["name"]);
        assert_eq!(rows.rows, vec![vec![Some("Ada".to_string())]]);
    }

    #[tokio::test]
    async fn update_and_delete_filter_rows() {
        let engine = engine_with_users().await;
        engine
            .execute("INSERT INTO users (id, name) VALUES ('u1', 'a'), ('u2', 'b')")
            .await
            .unwrap();
        let updated = engine
            .execute("UPDATE users SET name = 'z' WHERE id = 'u2' RETURNING id, name")
            .await
            .unwrap();
        assert_eq!(
            updated.rows,
            vec![vec![Some("u2".to_string()), Some("z".to_string())]]
        );

        engine.execute("DELETE FROM users WHERE id = 'u1'").await.unwrap();
        assert_eq!(engine.row_count("users"), 1);
    }

    #[tokio::test]
    async fn constant_select_and_health() {
        let engine = MemoryEngine::new();
        let one = engine.execute("SELECT 1").await.unwrap();
        assert_eq!(one.rows, vec![vec![Some("1".to_string())]]);
        engine.health_check().await.unwrap();

        engine.set_failing(true);
        assert!(engine.health_check().await.is_err());
    }

    #[tokio::test]
    async fn missing_relation_is_an_error() {
        let engine = MemoryEngine::new();
        let err = engine.execute("SELECT * FROM nope").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert_eq!(engine.executed(), vec!["SELECT * FROM nope".to_string()]);
    }
}
