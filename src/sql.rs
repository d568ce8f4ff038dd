use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingRequest, WindowRequest};
use crate::limits::*;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectServices,
    InsertServices {
        services: Vec<Service>,
    },
    DeleteService {
        id: ServiceId,
    },
    InsertWindows {
        windows: Vec<WindowRequest>,
    },
    DeleteWindow {
        id: Ulid,
    },
    SelectAvailability {
        service_id: ServiceId,
        date: String,
    },
    InsertBooking {
        request: BookingRequest,
    },
    SelectBookings {
        service_id: Option<ServiceId>,
    },
    CancelBooking {
        id: Ulid,
    },
}

const SERVICE_COLUMNS: &[&str] = &["id", "name", "session_minutes", "active"];
const WINDOW_COLUMNS: &[&str] = &["id", "service_id", "date", "start_time", "end_time"];
const BOOKING_COLUMNS: &[&str] = &["service_id", "date", "start_time", "sessions", "note"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => {
            return Err(SqlError::Unsupported(format!(
                "{} statements in one query; send them separately",
                stmts.len()
            )));
        }
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "services" => {
            let mut services = Vec::with_capacity(rows.len());
            for values in &rows {
                let row = InsertRow::new("services", SERVICE_COLUMNS, &columns, values)?;
                let name = row.optional("name").map(parse_string_or_null).transpose()?.flatten();
                if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
                    return Err(SqlError::InvalidValue("name", "too long".into()));
                }
                services.push(Service {
                    id: parse_ulid_expr(row.required("id")?)?,
                    name,
                    session_minutes: parse_u32(row.required("session_minutes")?)?,
                    active: row.optional("active").map(parse_bool).transpose()?.unwrap_or(true),
                });
            }
            Ok(Command::InsertServices { services })
        }
        "windows" => {
            if rows.len() > MAX_WINDOWS_PER_INSERT {
                return Err(SqlError::TooManyRows(MAX_WINDOWS_PER_INSERT));
            }
            let mut windows = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = InsertRow::new("windows", WINDOW_COLUMNS, &columns, values)?;
                windows.push(window_from_row(&row).map_err(|e| e.in_row(i))?);
            }
            Ok(Command::InsertWindows { windows })
        }
        "bookings" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported(
                    "one booking per INSERT; use sessions for back-to-back slots".into(),
                ));
            }
            let row = InsertRow::new("bookings", BOOKING_COLUMNS, &columns, &rows[0])?;
            let sessions = parse_u32(row.required("sessions")?)?;
            if sessions == 0 || sessions > MAX_SESSIONS_PER_BOOKING {
                return Err(SqlError::InvalidValue(
                    "sessions",
                    format!("must be between 1 and {MAX_SESSIONS_PER_BOOKING}"),
                ));
            }
            let note = row.optional("note").map(parse_string_or_null).transpose()?.flatten();
            if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
                return Err(SqlError::InvalidValue("note", "too long".into()));
            }
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    service_id: parse_ulid_expr(row.required("service_id")?)?,
                    date: parse_date_text(row.required("date")?)?,
                    start_time: parse_time_text("start_time", row.required("start_time")?)?,
                    sessions,
                    note,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn window_from_row(row: &InsertRow<'_>) -> Result<WindowRequest, SqlError> {
    Ok(WindowRequest {
        id: parse_ulid_expr(row.required("id")?)?,
        service_id: parse_ulid_expr(row.required("service_id")?)?,
        date: parse_date_text(row.required("date")?)?,
        start_time: parse_time_text("start_time", row.required("start_time")?)?,
        end_time: parse_time_text("end_time", row.required("end_time")?)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "windows" => Ok(Command::DeleteWindow { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
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
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "services" => Ok(Command::SelectServices),
        "availability" => Ok(Command::SelectAvailability {
            service_id: parse_ulid_expr(filter("service_id").ok_or(SqlError::MissingFilter("service_id"))?)?,
            date: parse_date_text(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            service_id: filter("service_id").map(parse_ulid_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` pairs from a conjunction.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right.as_ref()));
                }
            }
            other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        _ => return Err(SqlError::Unsupported("WHERE supports col = value [AND ...]".into())),
    }
    Ok(())
}

/// One VALUES tuple, addressed by column name. Without an explicit column
/// list, values are taken in the table's canonical column order.
struct InsertRow<'a> {
    table: &'static str,
    values: Vec<(&'a str, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    fn new(
        table: &'static str,
        canonical: &'static [&'static str],
        columns: &'a [String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<&'a str> = if columns.is_empty() {
            canonical.iter().take(values.len()).copied().collect()
        } else {
            columns.iter().map(String::as_str).collect()
        };
        if names.len() != values.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !canonical.iter().any(|c| c == *n)) {
            return Err(SqlError::UnknownColumn(table, (*unknown).to_string()));
        }
        Ok(Self {
            table,
            values: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s,
        Some(value) => return Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => return Err(SqlError::Parse(format!("expected value, got {expr}"))),
    };
    text.parse()
        .map_err(|_| SqlError::Parse(format!("{text} is not a non-negative 32-bit integer")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `YYYY-MM-DD` by shape only; calendar validity is checked downstream.
fn parse_date_text(expr: &Expr) -> Result<String, SqlError> {
    let s = parse_string(expr)?;
    if has_shape(&s, "dddd-dd-dd") {
        Ok(s)
    } else {
        Err(SqlError::InvalidValue("date", format!("{s:?} is not YYYY-MM-DD")))
    }
}

/// `HH:MM` by shape only.
fn parse_time_text(column: &'static str, expr: &Expr) -> Result<String, SqlError> {
    let s = parse_string(expr)?;
    if has_shape(&s, "dd:dd") {
        Ok(s)
    } else {
        Err(SqlError::InvalidValue(column, format!("{s:?} is not HH:MM")))
    }
}

/// `d` in the pattern matches an ASCII digit, anything else matches itself.
fn has_shape(s: &str, pattern: &str) -> bool {
    s.len() == pattern.len()
        && s.bytes().zip(pattern.bytes()).all(|(c, p)| match p {
            b'd' => c.is_ascii_digit(),
            _ => c == p,
        })
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// Field present but malformed (bad date/time shape, out-of-range count).
    InvalidValue(&'static str, String),
    TooManyRows(usize),
    InRow(usize, Box<SqlError>),
}

impl SqlError {
    fn in_row(self, row: usize) -> Self {
        SqlError::InRow(row, Box::new(self))
    }

    /// The innermost error, skipping row context.
    pub fn root(&self) -> &SqlError {
        match self {
            SqlError::InRow(_, inner) => inner.root(),
            other => other,
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(col, msg) => write!(f, "invalid {col}: {msg}"),
            SqlError::TooManyRows(max) => write!(f, "at most {max} rows per statement"),
            SqlError::InRow(i, e) => write!(f, "row {i}: {e}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const SID: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_select_services() {
        assert_eq!(parse_sql("SELECT * FROM services").unwrap(), Command::SelectServices);
    }

    #[test]
    fn parse_insert_service() {
        let sql = format!("INSERT INTO services (id, name, session_minutes) VALUES ('{ID}', 'Consultation', 15)");
        match parse_sql(&sql).unwrap() {
            Command::InsertServices { services } => {
                assert_eq!(services.len(), 1);
                assert_eq!(services[0].id.to_string(), ID);
                assert_eq!(services[0].name.as_deref(), Some("Consultation"));
                assert_eq!(services[0].session_minutes, 15);
                assert!(services[0].active);
            }
            cmd => panic!("expected InsertServices, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_inactive_service_with_null_name() {
        let sql = format!("INSERT INTO services (id, name, session_minutes, active) VALUES ('{ID}', NULL, 15, false)");
        match parse_sql(&sql).unwrap() {
            Command::InsertServices { services } => {
                assert_eq!(services[0].name, None);
                assert!(!services[0].active);
            }
            cmd => panic!("expected InsertServices, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO services VALUES ('{ID}', 'Haircut', 15, true)");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertServices { .. }));
    }

    #[test]
    fn parse_insert_windows_multi_row() {
        let sql = format!(
            "INSERT INTO windows (id, service_id, date, start_time, end_time) VALUES \
             ('{ID}', '{SID}', '2031-06-10', '09:00', '12:00'), \
             ('{SID}', '{SID}', '2031-06-10', '13:00', '15:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWindows { windows } => {
                assert_eq!(windows.len(), 2);
                assert_eq!(windows[0].start_time, "09:00");
                assert_eq!(windows[1].end_time, "15:00");
                assert_eq!(windows[1].service_id.to_string(), SID);
            }
            cmd => panic!("expected InsertWindows, got {cmd:?}"),
        }
    }

    #[test]
    fn window_row_errors_name_the_row() {
        let sql = format!(
            "INSERT INTO windows (id, service_id, date, start_time, end_time) VALUES \
             ('{ID}', '{SID}', '2031-06-10', '09:00', '12:00'), \
             ('{ID}', '{SID}', '2031-06-10', '9am', '12:00')"
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(matches!(err, SqlError::InRow(1, _)));
        assert!(matches!(err.root(), SqlError::InvalidValue("start_time", _)));
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            "INSERT INTO bookings (service_id, date, start_time, sessions, note) \
             VALUES ('{SID}', '2031-06-10', '11:00', 2, 'first visit')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request } => {
                assert_eq!(request.service_id.to_string(), SID);
                assert_eq!(request.date, "2031-06-10");
                assert_eq!(request.start_time, "11:00");
                assert_eq!(request.sessions, 2);
                assert_eq!(request.note.as_deref(), Some("first visit"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_columns_may_come_in_any_order() {
        let sql = format!(
            "INSERT INTO bookings (sessions, start_time, date, service_id) \
             VALUES ('1', '08:00', '2031-06-10', '{SID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { request } => {
                assert_eq!(request.sessions, 1);
                assert_eq!(request.start_time, "08:00");
                assert_eq!(request.note, None);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_shape_validation() {
        let bad_date = format!("INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{SID}', '10/06/2031', '11:00', 1)");
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::InvalidValue("date", _))));

        let bad_time = format!("INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{SID}', '2031-06-10', '11:00:00', 1)");
        assert!(matches!(parse_sql(&bad_time), Err(SqlError::InvalidValue("start_time", _))));

        let zero = format!("INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{SID}', '2031-06-10', '11:00', 0)");
        assert!(matches!(parse_sql(&zero), Err(SqlError::InvalidValue("sessions", _))));

        let many = format!("INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{SID}', '2031-06-10', '11:00', 1441)");
        assert!(matches!(parse_sql(&many), Err(SqlError::InvalidValue("sessions", _))));

        let missing = format!("INSERT INTO bookings (service_id, date, sessions) VALUES ('{SID}', '2031-06-10', 1)");
        assert_eq!(parse_sql(&missing), Err(SqlError::MissingColumn("bookings", "start_time")));
    }

    #[test]
    fn booking_insert_is_single_row() {
        let sql = format!(
            "INSERT INTO bookings (service_id, date, start_time, sessions) VALUES \
             ('{SID}', '2031-06-10', '11:00', 1), ('{SID}', '2031-06-10', '12:00', 1)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn unknown_column_rejected() {
        let sql = format!("INSERT INTO bookings (service_id, date, start_time, sessions, user_id) VALUES ('{SID}', '2031-06-10', '11:00', 1, 'x')");
        assert_eq!(
            parse_sql(&sql),
            Err(SqlError::UnknownColumn("bookings", "user_id".into()))
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE service_id = '{SID}' AND date = '2031-06-10'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                service_id: Ulid::from_string(SID).unwrap(),
                date: "2031-06-10".into(),
            }
        );
    }

    #[test]
    fn availability_needs_both_filters() {
        let sql = format!("SELECT * FROM availability WHERE service_id = '{SID}'");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingFilter("date")));
    }

    #[test]
    fn parse_select_bookings() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { service_id: None }
        );
        let sql = format!("SELECT * FROM bookings WHERE service_id = '{SID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings { service_id: Some(_) }
        ));
    }

    #[test]
    fn parse_deletes() {
        assert!(matches!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")).unwrap(),
            Command::CancelBooking { .. }
        ));
        assert!(matches!(
            parse_sql(&format!("DELETE FROM windows WHERE id = '{ID}'")).unwrap(),
            Command::DeleteWindow { .. }
        ));
        assert!(matches!(
            parse_sql(&format!("DELETE FROM services WHERE id = '{ID}'")).unwrap(),
            Command::DeleteService { .. }
        ));
        assert_eq!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert_eq!(parse_sql(&sql), Err(SqlError::UnknownTable("foobar".into())));
    }

    #[test]
    fn parse_bad_ulid_errors() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn parse_rejects_multiple_statements() {
        let sql = format!("SELECT * FROM services; DELETE FROM bookings WHERE id = '{SID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        // A trailing semicolon is still one statement.
        assert!(matches!(parse_sql("SELECT * FROM services;"), Ok(Command::SelectServices)));
    }

    #[test]
    fn shape_matcher() {
        assert!(has_shape("2031-06-10", "dddd-dd-dd"));
        assert!(!has_shape("2031-6-10", "dddd-dd-dd"));
        assert!(has_shape("08:00", "dd:dd"));
        assert!(!has_shape("8:00", "dd:dd"));
        assert!(!has_shape("08-00", "dd:dd"));
    }
}
