use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// One `VALUES` row of `assignments`:
/// `(id, engineer_id, project_id, start, "end", allocation[, status])`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub id: Ulid,
    pub engineer_id: Ulid,
    pub project_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub allocation: u32,
    pub status: AssignmentStatus,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEngineer {
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
    },
    UpdateEngineer {
        id: Ulid,
        name: Option<String>,
        max_capacity: Option<u32>,
    },
    DeleteEngineer {
        id: Ulid,
    },
    InsertAssignment(AssignmentRow),
    BatchInsertAssignments(Vec<AssignmentRow>),
    UpdateAssignment {
        id: Ulid,
        patch: AssignmentPatch,
    },
    DeleteAssignment {
        id: Ulid,
    },
    SelectEngineers,
    SelectAssignments {
        engineer_id: Ulid,
    },
    SelectConflicts {
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectCapacityCheck {
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
        allocation: u32,
        exclude_id: Option<Ulid>,
    },
    SelectUtilization {
        engineer_id: Option<Ulid>,
        as_of: Option<Ms>,
    },
    SelectAllocation {
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailableEngineers {
        start: Ms,
        end: Ms,
        allocation: u32,
    },
}

/// Default capacity for `INSERT INTO engineers (id, name)`.
const DEFAULT_MAX_CAPACITY: u32 = 100;

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "engineers" => {
            if rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT into engineers".into()));
            }
            let values = &rows[0];
            if values.is_empty() {
                return Err(SqlError::WrongArity("engineers", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = match values.get(1) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            let max_capacity = match values.get(2) {
                Some(v) => parse_u32(v)?,
                None => DEFAULT_MAX_CAPACITY,
            };
            Ok(Command::InsertEngineer {
                id,
                name,
                max_capacity,
            })
        }
        "assignments" => {
            if rows.len() == 1 {
                return Ok(Command::InsertAssignment(parse_assignment_row(&rows[0])?));
            }
            let mut batch = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                batch.push(
                    parse_assignment_row(row)
                        .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                );
            }
            Ok(Command::BatchInsertAssignments(batch))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_assignment_row(values: &[Expr]) -> Result<AssignmentRow, SqlError> {
    if values.len() < 6 {
        return Err(SqlError::WrongArity("assignments", 6, values.len()));
    }
    let status = match values.get(6) {
        Some(v) => parse_status(v)?,
        None => AssignmentStatus::Planned,
    };
    Ok(AssignmentRow {
        id: parse_ulid(&values[0])?,
        engineer_id: parse_ulid(&values[1])?,
        project_id: parse_ulid(&values[2])?,
        start: parse_i64(&values[3])?,
        end: parse_i64(&values[4])?,
        allocation: parse_u32(&values[5])?,
        status,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((col, &a.value));
    }

    match table.as_str() {
        "engineers" => {
            let (mut name, mut max_capacity) = (None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "name" => name = parse_string_or_null(value)?,
                    "max_capacity" => max_capacity = Some(parse_u32(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn("engineers", col)),
                }
            }
            Ok(Command::UpdateEngineer {
                id,
                name,
                max_capacity,
            })
        }
        "assignments" => {
            let mut patch = AssignmentPatch::default();
            for (col, value) in sets {
                match col.as_str() {
                    "project_id" => patch.project_id = Some(parse_ulid(value)?),
                    "start" => patch.start = Some(parse_i64(value)?),
                    "end" => patch.end = Some(parse_i64(value)?),
                    "allocation" => patch.allocation = Some(parse_u32(value)?),
                    "status" => patch.status = Some(parse_status(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn("assignments", col)),
                }
            }
            Ok(Command::UpdateAssignment { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "engineers" => Ok(Command::DeleteEngineer { id }),
        "assignments" => Ok(Command::DeleteAssignment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection);
    }

    match table.as_str() {
        "engineers" => Ok(Command::SelectEngineers),
        "assignments" => Ok(Command::SelectAssignments {
            engineer_id: filters.required_ulid("engineer_id")?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            engineer_id: filters.required_ulid("engineer_id")?,
            start: filters.window_start()?,
            end: filters.window_end()?,
            exclude_id: filters.ulid("exclude_id")?,
        }),
        "capacity_check" => Ok(Command::SelectCapacityCheck {
            engineer_id: filters.required_ulid("engineer_id")?,
            start: filters.window_start()?,
            end: filters.window_end()?,
            allocation: filters.required_u32("allocation")?,
            exclude_id: filters.ulid("exclude_id")?,
        }),
        "utilization" => Ok(Command::SelectUtilization {
            engineer_id: filters.ulid("engineer_id")?,
            as_of: filters.eq.get("as_of").map(|e| parse_i64(e)).transpose()?,
        }),
        "allocation" => Ok(Command::SelectAllocation {
            engineer_id: filters.required_ulid("engineer_id")?,
            start: filters.window_start()?,
            end: filters.window_end()?,
        }),
        "available_engineers" => Ok(Command::SelectAvailableEngineers {
            start: filters.window_start()?,
            end: filters.window_end()?,
            allocation: filters.required_u32("allocation")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunctive `WHERE` filters: `col = v`, `start >= v`, `"end" <= v`.
/// Anything else in the clause is ignored.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    start: Option<Expr>,
    end: Option<Expr>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) {
        let Expr::BinaryOp { left, op, right } = expr else {
            return;
        };
        match op {
            ast::BinaryOperator::And => {
                self.collect(left);
                self.collect(right);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    self.eq.insert(col, right.as_ref().clone());
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    self.start = Some(right.as_ref().clone());
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    self.end = Some(right.as_ref().clone());
                }
            }
            _ => {}
        }
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(col).map(parse_ulid).transpose()
    }

    fn required_ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn required_u32(&self, col: &'static str) -> Result<u32, SqlError> {
        let expr = self.eq.get(col).ok_or(SqlError::MissingFilter(col))?;
        parse_u32(expr)
    }

    fn window_start(&self) -> Result<Ms, SqlError> {
        parse_i64(self.start.as_ref().ok_or(SqlError::MissingFilter("start"))?)
    }

    fn window_end(&self) -> Result<Ms, SqlError> {
        parse_i64(self.end.as_ref().ok_or(SqlError::MissingFilter("end"))?)
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!(
            "expected string or NULL, got {value:?}"
        ))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<AssignmentStatus, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.parse().map_err(SqlError::Parse),
        Some(value) => Err(SqlError::Parse(format!("expected status, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    ReadOnlyColumn(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::ReadOnlyColumn(t, col) => write!(f, "{t}: column {col} cannot be updated"),
        }
    }
}

impl std::error::Error for SqlError {}
