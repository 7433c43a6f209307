use std::str::FromStr;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::directory::DirectoryKind;
use crate::model::*;

/// Column order assumed by `INSERT INTO bookings VALUES (...)` without a column list.
const BOOKING_COLUMNS: [&str; 10] = [
    "class_id",
    "teacher_id",
    "subject_id",
    "day",
    "start_time",
    "end_time",
    "academic_year",
    "room",
    "semester",
    "created_by",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterEntity {
        kind: DirectoryKind,
        id: Ulid,
        name: String,
    },
    InsertBooking {
        booking: NewBooking,
    },
    BatchInsertBookings {
        bookings: Vec<NewBooking>,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    DeactivateBooking {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectTimetable {
        kind: ResourceKind,
        resource_id: Ulid,
        academic_year: String,
    },
    SelectAvailability {
        kind: ResourceKind,
        resource_id: Ulid,
        day: DayOfWeek,
        academic_year: String,
        window: SlotFilter,
    },
    SelectCommonAvailability {
        resources: Vec<(ResourceKind, Ulid)>,
        day: DayOfWeek,
        academic_year: String,
        window: SlotFilter,
    },
}

/// Optional `start >=`, `"end" <=` and `min_duration =` filters on availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub start: Option<Secs>,
    pub end: Option<Secs>,
    pub min_duration: Option<Secs>,
}

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
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();

    let kind = match table.as_str() {
        "classes" => Some(DirectoryKind::Class),
        "teachers" => Some(DirectoryKind::Teacher),
        "subjects" => Some(DirectoryKind::Subject),
        _ => None,
    };
    if let Some(kind) = kind {
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(format!("multi-row insert into {table}")));
        }
        let row = Row::new("directory entry", &columns, &["id", "name"], &rows[0])?;
        return Ok(Command::RegisterEntity {
            kind,
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
        });
    }

    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    if rows.len() == 1 {
        let row = Row::new("bookings", &columns, &BOOKING_COLUMNS, &rows[0])?;
        return Ok(Command::InsertBooking {
            booking: parse_new_booking(&row)?,
        });
    }
    let mut bookings = Vec::with_capacity(rows.len());
    for (i, values) in rows.iter().enumerate() {
        let row = Row::new("bookings row", &columns, &BOOKING_COLUMNS, values)?;
        bookings.push(parse_new_booking(&row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
    }
    Ok(Command::BatchInsertBookings { bookings })
}

fn parse_new_booking(row: &Row<'_>) -> Result<NewBooking, SqlError> {
    Ok(NewBooking {
        class_id: parse_ulid(row.required("class_id")?)?,
        teacher_id: parse_ulid(row.required("teacher_id")?)?,
        subject_id: parse_ulid(row.required("subject_id")?)?,
        day: parse_day(row.required("day")?)?,
        start: parse_time_expr(row.required("start_time")?)?,
        end: parse_time_expr(row.required("end_time")?)?,
        academic_year: parse_string(row.required("academic_year")?)?,
        room: row.optional("room").map(parse_string_or_null).transpose()?.flatten(),
        semester: row.optional("semester").map(parse_string_or_null).transpose()?.flatten(),
        // The nil ULID marks rows created without an acting user.
        created_by: row.optional("created_by").map(parse_ulid).transpose()?.unwrap_or(Ulid::nil()),
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = BookingPatch::default();
    let mut deactivate = false;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        let value = &assignment.value;
        match column.as_str() {
            "class_id" => patch.class_id = Some(parse_ulid(value)?),
            "teacher_id" => patch.teacher_id = Some(parse_ulid(value)?),
            "subject_id" => patch.subject_id = Some(parse_ulid(value)?),
            "day" => patch.day = Some(parse_day(value)?),
            "start_time" => patch.start = Some(parse_time_expr(value)?),
            "end_time" => patch.end = Some(parse_time_expr(value)?),
            "room" => patch.room = Some(parse_string_or_null(value)?),
            "academic_year" => patch.academic_year = Some(parse_string(value)?),
            "semester" => patch.semester = Some(parse_string_or_null(value)?),
            "is_active" => {
                if parse_bool(value)? {
                    return Err(SqlError::InvalidValue("inactive bookings cannot be reactivated".into()));
                }
                deactivate = true;
            }
            "id" | "created_by" | "created_at" | "updated_at" => {
                return Err(SqlError::InvalidValue(format!("{column} is immutable")));
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    match (deactivate, patch.is_empty()) {
        (true, true) => Ok(Command::DeactivateBooking { id }),
        (true, false) => Err(SqlError::Unsupported("is_active combined with other columns".into())),
        (false, _) => Ok(Command::UpdateBooking { id, patch }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let filters = Filters(filters);

    match table.as_str() {
        "bookings" => Ok(Command::SelectBooking {
            id: parse_ulid(filters.eq("id")?)?,
        }),
        "class_timetable" => Ok(Command::SelectTimetable {
            kind: ResourceKind::Class,
            resource_id: parse_ulid(filters.eq("class_id")?)?,
            academic_year: parse_string(filters.eq("academic_year")?)?,
        }),
        "teacher_timetable" => Ok(Command::SelectTimetable {
            kind: ResourceKind::Teacher,
            resource_id: parse_ulid(filters.eq("teacher_id")?)?,
            academic_year: parse_string(filters.eq("academic_year")?)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            kind: ResourceKind::from_str(&parse_string(filters.eq("resource_kind")?)?).map_err(SqlError::InvalidValue)?,
            resource_id: parse_ulid(filters.eq("resource_id")?)?,
            day: parse_day(filters.eq("day")?)?,
            academic_year: parse_string(filters.eq("academic_year")?)?,
            window: filters.slot_filter()?,
        }),
        "common_availability" => {
            let mut resources = Vec::new();
            for (kind, column) in [(ResourceKind::Class, "class_id"), (ResourceKind::Teacher, "teacher_id")] {
                for expr in filters.members(column) {
                    resources.push((kind, parse_ulid(expr)?));
                }
            }
            if resources.is_empty() {
                return Err(SqlError::MissingFilter("class_id or teacher_id"));
            }
            Ok(Command::SelectCommonAvailability {
                resources,
                day: parse_day(filters.eq("day")?)?,
                academic_year: parse_string(filters.eq("academic_year")?)?,
                window: filters.slot_filter()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
}

enum Filter<'a> {
    Compare(String, FilterOp, &'a Expr),
    In(String, &'a [Expr]),
}

/// Conjunction of simple column predicates.
struct Filters<'a>(Vec<Filter<'a>>);

impl<'a> Filters<'a> {
    fn find(&self, column: &str, op: FilterOp) -> Option<&'a Expr> {
        self.0.iter().find_map(|f| match f {
            Filter::Compare(c, o, e) if c == column && *o == op => Some(*e),
            _ => None,
        })
    }

    fn eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.find(column, FilterOp::Eq).ok_or(SqlError::MissingFilter(column))
    }

    /// Every value a column is pinned to, via `=` or `IN (...)`.
    fn members(&self, column: &str) -> Vec<&'a Expr> {
        let mut out = Vec::new();
        for f in &self.0 {
            match f {
                Filter::Compare(c, FilterOp::Eq, e) if c == column => out.push(*e),
                Filter::In(c, list) if c == column => out.extend((*list).iter()),
                _ => {}
            }
        }
        out
    }

    fn slot_filter(&self) -> Result<SlotFilter, SqlError> {
        Ok(SlotFilter {
            start: self.find("start", FilterOp::GtEq).map(parse_time_expr).transpose()?,
            end: self.find("end", FilterOp::LtEq).map(parse_time_expr).transpose()?,
            min_duration: self.find("min_duration", FilterOp::Eq).map(parse_secs).transpose()?,
        })
    }
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
            };
            let column = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push(Filter::Compare(column, op, right));
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let column = expr_column_name(expr).ok_or_else(|| SqlError::Parse(format!("expected column, got {expr}")))?;
            out.push(Filter::In(column, list));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

/// One VALUES row addressed by column name. Without a column list the
/// table's default column order applies.
struct Row<'a> {
    values: Vec<(&'a str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        columns: &'a [String],
        defaults: &'a [&'static str],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<&'a str> = if columns.is_empty() {
            defaults.iter().copied().collect()
        } else {
            columns.iter().map(String::as_str).collect()
        };
        if values.len() > names.len() || (!columns.is_empty() && values.len() != names.len()) {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !defaults.iter().any(|d| d == *n)) {
            return Err(SqlError::UnknownColumn(unknown.to_string()));
        }
        Ok(Self {
            values: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(column))
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
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
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
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
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
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_day(expr: &Expr) -> Result<DayOfWeek, SqlError> {
    DayOfWeek::from_str(&parse_string(expr)?).map_err(SqlError::InvalidValue)
}

/// `'HH:MM[:SS]'` or a bare number of seconds since midnight.
fn parse_time_expr(expr: &Expr) -> Result<Secs, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) if !s.trim().chars().all(|c| c.is_ascii_digit()) => {
            parse_time(s).map_err(SqlError::InvalidValue)
        }
        Some(Value::Number(..) | Value::SingleQuotedString(_)) => {
            let secs = parse_secs(expr)?;
            if secs > DAY_SECS {
                return Err(SqlError::InvalidValue(format!("{secs} is past 24:00")));
            }
            Ok(secs)
        }
        Some(value) => Err(SqlError::Parse(format!("expected time of day, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// A number of seconds, bare or quoted (extended-protocol parameters arrive quoted).
fn parse_secs(expr: &Expr) -> Result<Secs, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::InvalidValue(format!("bad seconds {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the scheduler can't accept.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const C: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_register_teacher() {
        let sql = format!("INSERT INTO teachers (id, name) VALUES ('{A}', 'Ms Okafor')");
        match parse_sql(&sql).unwrap() {
            Command::RegisterEntity { kind, id, name } => {
                assert_eq!(kind, DirectoryKind::Teacher);
                assert_eq!(id, ulid(A));
                assert_eq!(name, "Ms Okafor");
            }
            cmd => panic!("expected RegisterEntity, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_by_column_name() {
        let sql = format!(
            "INSERT INTO bookings (academic_year, day, class_id, teacher_id, subject_id, start_time, end_time, room) \
             VALUES ('2024-2025', 'Mon', '{A}', '{B}', '{C}', '09:00', '10:30', 'Lab 2')"
        );
        let cmd = parse_sql(&sql).unwrap();
        let Command::InsertBooking { booking } = cmd else {
            panic!("expected InsertBooking, got {cmd:?}");
        };
        assert_eq!(booking.class_id, ulid(A));
        assert_eq!(booking.teacher_id, ulid(B));
        assert_eq!(booking.subject_id, ulid(C));
        assert_eq!(booking.day, DayOfWeek::Monday);
        assert_eq!(booking.start, 9 * 3600);
        assert_eq!(booking.end, 10 * 3600 + 1800);
        assert_eq!(booking.room.as_deref(), Some("Lab 2"));
        assert_eq!(booking.semester, None);
        assert_eq!(booking.created_by, Ulid::nil());
    }

    #[test]
    fn parse_insert_booking_positional() {
        let sql = format!(
            "INSERT INTO bookings VALUES ('{A}', '{B}', '{C}', 'friday', 32400, '10:00', '2024-2025', NULL, 'spring', '{A}')"
        );
        let Command::InsertBooking { booking } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(booking.day, DayOfWeek::Friday);
        assert_eq!(booking.start, 32400);
        assert_eq!(booking.room, None);
        assert_eq!(booking.semester.as_deref(), Some("spring"));
        assert_eq!(booking.created_by, ulid(A));
    }

    #[test]
    fn parse_batch_insert_bookings() {
        let sql = format!(
            "INSERT INTO bookings (class_id, teacher_id, subject_id, day, start_time, end_time, academic_year) VALUES \
             ('{A}', '{B}', '{C}', 'tue', '09:00', '10:00', '2024-2025'), \
             ('{A}', '{B}', '{C}', 'tue', '10:00', '11:00', '2024-2025')"
        );
        match parse_sql(&sql).unwrap() {
            Command::BatchInsertBookings { bookings } => {
                assert_eq!(bookings.len(), 2);
                assert_eq!(bookings[1].start, 10 * 3600);
            }
            cmd => panic!("expected BatchInsertBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_errors() {
        let missing = format!("INSERT INTO bookings (class_id, teacher_id) VALUES ('{A}', '{B}')");
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingColumn("subject_id"))));

        let bad_day = format!(
            "INSERT INTO bookings VALUES ('{A}', '{B}', '{C}', 'someday', '09:00', '10:00', '2024-2025')"
        );
        assert!(matches!(parse_sql(&bad_day), Err(SqlError::InvalidValue(_))));

        let bad_time = format!(
            "INSERT INTO bookings VALUES ('{A}', '{B}', '{C}', 'mon', '25:00', '26:00', '2024-2025')"
        );
        assert!(matches!(parse_sql(&bad_time), Err(SqlError::InvalidValue(_))));

        let unknown = format!("INSERT INTO bookings (class_id, colour) VALUES ('{A}', 'red')");
        assert!(matches!(parse_sql(&unknown), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_update_booking() {
        let sql = format!(
            "UPDATE bookings SET start_time = '11:00', end_time = '12:00', room = NULL, teacher_id = '{B}' WHERE id = '{A}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { id, patch } => {
                assert_eq!(id, ulid(A));
                assert_eq!(patch.start, Some(11 * 3600));
                assert_eq!(patch.end, Some(12 * 3600));
                assert_eq!(patch.room, Some(None));
                assert_eq!(patch.teacher_id, Some(ulid(B)));
                assert_eq!(patch.day, None);
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_deactivate_booking() {
        let sql = format!("UPDATE bookings SET is_active = false WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeactivateBooking { id: ulid(A) });

        let reactivate = format!("UPDATE bookings SET is_active = true WHERE id = '{A}'");
        assert!(matches!(parse_sql(&reactivate), Err(SqlError::InvalidValue(_))));

        let mixed = format!("UPDATE bookings SET is_active = false, room = 'X' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&mixed), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_immutable_column_rejected() {
        let sql = format!("UPDATE bookings SET created_by = '{B}' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE bookings SET room = 'X'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_delete_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(A) });
    }

    #[test]
    fn parse_select_booking() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectBooking { id: ulid(A) });
    }

    #[test]
    fn parse_select_timetables() {
        let sql = format!("SELECT * FROM class_timetable WHERE class_id = '{A}' AND academic_year = '2024-2025'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectTimetable {
                kind: ResourceKind::Class,
                resource_id: ulid(A),
                academic_year: "2024-2025".into(),
            }
        );

        let sql = format!("SELECT * FROM teacher_timetable WHERE academic_year = '2024-2025' AND teacher_id = '{B}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectTimetable { kind: ResourceKind::Teacher, .. }
        ));

        let missing_year = format!("SELECT * FROM class_timetable WHERE class_id = '{A}'");
        assert!(matches!(parse_sql(&missing_year), Err(SqlError::MissingFilter("academic_year"))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_kind = 'teacher' AND resource_id = '{A}' \
             AND day = 'Wednesday' AND academic_year = '2024-2025'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability {
                kind,
                resource_id,
                day,
                academic_year,
                window,
            } => {
                assert_eq!(kind, ResourceKind::Teacher);
                assert_eq!(resource_id, ulid(A));
                assert_eq!(day, DayOfWeek::Wednesday);
                assert_eq!(academic_year, "2024-2025");
                assert_eq!(window, SlotFilter::default());
            }
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_with_window() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_kind = 'class' AND resource_id = '{A}' AND day = 'mon' \
             AND academic_year = '2024-2025' AND start >= '07:30' AND \"end\" <= '12:00' AND min_duration = 2700"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability { window, .. } => {
                assert_eq!(
                    window,
                    SlotFilter {
                        start: Some(7 * 3600 + 1800),
                        end: Some(12 * 3600),
                        min_duration: Some(2700),
                    }
                );
            }
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn availability_accepts_quoted_numbers() {
        // Bound parameters reach the parser as quoted strings
        let sql = format!(
            "SELECT * FROM availability WHERE resource_kind = 'class' AND resource_id = '{A}' AND day = 'mon' \
             AND academic_year = '2024-2025' AND start >= '27000' AND min_duration = '2700'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability { window, .. } => {
                assert_eq!(window.start, Some(27000));
                assert_eq!(window.min_duration, Some(2700));
            }
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }

        let bad = sql.replace("'2700'", "'long'");
        assert!(matches!(parse_sql(&bad), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_select_common_availability() {
        let sql = format!(
            "SELECT * FROM common_availability WHERE class_id = '{A}' AND teacher_id IN ('{B}', '{C}') \
             AND day = 'thu' AND academic_year = '2024-2025'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectCommonAvailability { resources, day, .. } => {
                assert_eq!(
                    resources,
                    vec![
                        (ResourceKind::Class, ulid(A)),
                        (ResourceKind::Teacher, ulid(B)),
                        (ResourceKind::Teacher, ulid(C)),
                    ]
                );
                assert_eq!(day, DayOfWeek::Thursday);
            }
            cmd => panic!("expected SelectCommonAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_or_in_where_unsupported() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{A}' OR id = '{B}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO rooms (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM holidays"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_bad_ulid_is_invalid_value() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
