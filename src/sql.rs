use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Session variable holding the caller's access token.
pub const TOKEN_SETTING: &str = "hotdesk.token";

/// One row of a (possibly multi-row) booking insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub id: Ulid,
    pub seat_id: Ulid,
    pub span: Span,
    pub duration_type: DurationType,
    /// Defaults to the caller.
    pub customer_id: Option<Ulid>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBranch {
        id: Ulid,
        name: String,
        opening_hour: u8,
        closing_hour: u8,
    },
    InsertSeatingType {
        id: Ulid,
        name: String,
        rates: Rates,
        is_meeting_room: bool,
    },
    InsertSeat {
        id: Ulid,
        branch_id: Ulid,
        seating_type_id: Ulid,
        label: String,
    },
    DeleteSeat {
        id: Ulid,
    },
    StartMaintenance {
        seat_id: Ulid,
    },
    EndMaintenance {
        seat_id: Ulid,
    },
    InsertAccount {
        id: Ulid,
        email: String,
        name: String,
        password: String,
        role: Option<Role>,
    },
    InsertBookings {
        bookings: Vec<BookingRow>,
    },
    InsertPayment {
        booking_id: Ulid,
        reference: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    GenerateTimeSlots {
        seat_id: Ulid,
        date: NaiveDate,
        slot_minutes: Option<u32>,
    },
    SelectBranches,
    SelectSeatingTypes,
    SelectSeats {
        branch_id: Option<Ulid>,
    },
    SelectBookings {
        seat_id: Option<Ulid>,
        customer_id: Option<Ulid>,
    },
    SelectAccounts,
    SelectMe,
    SelectTimeSlots {
        seat_id: Ulid,
        window: Span,
    },
    SelectFreeSeats {
        seating_type_id: Ulid,
        window: Span,
        branch_id: Option<Ulid>,
    },
    VerifyBooking {
        request: VerifyRequest,
    },
    ReconcileExpired,
    Login {
        email: String,
        password: String,
    },
    Refresh {
        token: String,
    },
    Logout {
        token: String,
    },
    SetToken {
        token: String,
    },
    ResetToken,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(cmd) = parse_session_command(sql)? {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [stmt] => match stmt {
            Statement::Insert(insert) => parse_insert(insert),
            Statement::Delete(delete) => parse_delete(delete),
            Statement::Query(query) => parse_select(query),
            other => Err(SqlError::Unsupported(format!("{other}"))),
        },
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

/// Relation a SELECT reads from, if the statement is one. Placeholders are
/// allowed, so this works on unbound prepared statements.
pub fn select_target(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

/// `SET hotdesk.token = '..'` and `RESET hotdesk.token`, matched by hand
/// because custom settings are not part of the parser's grammar.
fn parse_session_command(sql: &str) -> Result<Option<Command>, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let mut words = trimmed.splitn(2, char::is_whitespace);
    let verb = words.next().unwrap_or_default().to_ascii_uppercase();
    let rest = words.next().unwrap_or_default().trim_start();

    let Some(after_name) = strip_prefix_ignore_case(rest, TOKEN_SETTING) else {
        return Ok(None);
    };
    match verb.as_str() {
        "RESET" if after_name.trim().is_empty() => Ok(Some(Command::ResetToken)),
        "SET" => {
            let value = after_name.trim_start();
            let value = if let Some(v) = value.strip_prefix('=') {
                v
            } else if let Some(v) = strip_prefix_ignore_case(value, "TO") {
                v
            } else {
                return Err(SqlError::Parse(format!("expected = after {TOKEN_SETTING}")));
            };
            let value = value.trim();
            let token = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(|| SqlError::Parse("token must be a quoted string".into()))?;
            if token.is_empty() {
                return Ok(Some(Command::ResetToken));
            }
            Ok(Some(Command::SetToken {
                token: token.replace("''", "'"),
            }))
        }
        _ => Ok(None),
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    if table == "bookings" {
        let mut bookings = Vec::with_capacity(rows.len());
        for (i, values) in rows.iter().enumerate() {
            let row = Row::new("bookings", &columns, values, BOOKING_COLUMNS)?;
            let booking = booking_row(&row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
            bookings.push(booking);
        }
        return Ok(Command::InsertBookings { bookings });
    }

    let [values] = rows else {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table}"
        )));
    };

    match table.as_str() {
        "branches" => {
            let row = Row::new("branches", &columns, values, &["id", "name", "opening_hour", "closing_hour"])?;
            Ok(Command::InsertBranch {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                opening_hour: parse_int(row.required("opening_hour")?)?,
                closing_hour: parse_int(row.required("closing_hour")?)?,
            })
        }
        "seating_types" => {
            let row = Row::new(
                "seating_types",
                &columns,
                values,
                &["id", "name", "hourly_rate", "daily_rate", "monthly_rate", "is_meeting_room"],
            )?;
            Ok(Command::InsertSeatingType {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                rates: Rates {
                    hourly: parse_int(row.required("hourly_rate")?)?,
                    daily: parse_int(row.required("daily_rate")?)?,
                    monthly: parse_int(row.required("monthly_rate")?)?,
                },
                is_meeting_room: match row.optional("is_meeting_room") {
                    Some(expr) => parse_bool(expr)?,
                    None => false,
                },
            })
        }
        "seats" => {
            let row = Row::new("seats", &columns, values, &["id", "branch_id", "seating_type_id", "label"])?;
            Ok(Command::InsertSeat {
                id: parse_ulid(row.required("id")?)?,
                branch_id: parse_ulid(row.required("branch_id")?)?,
                seating_type_id: parse_ulid(row.required("seating_type_id")?)?,
                label: parse_string(row.required("label")?)?,
            })
        }
        "maintenance" => {
            let row = Row::new("maintenance", &columns, values, &["seat_id"])?;
            Ok(Command::StartMaintenance {
                seat_id: parse_ulid(row.required("seat_id")?)?,
            })
        }
        "accounts" => {
            let row = Row::new("accounts", &columns, values, &["id", "email", "name", "password", "role"])?;
            let role = match row.optional("role") {
                Some(expr) => parse_opt_string(expr)?
                    .map(|s| Role::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad role: {s}"))))
                    .transpose()?,
                None => None,
            };
            Ok(Command::InsertAccount {
                id: parse_ulid(row.required("id")?)?,
                email: parse_string(row.required("email")?)?,
                name: parse_string(row.required("name")?)?,
                password: parse_string(row.required("password")?)?,
                role,
            })
        }
        "payments" => {
            let row = Row::new("payments", &columns, values, &["booking_id", "reference"])?;
            Ok(Command::InsertPayment {
                booking_id: parse_ulid(row.required("booking_id")?)?,
                reference: match row.optional("reference") {
                    Some(expr) => parse_opt_string(expr)?,
                    None => None,
                },
            })
        }
        "time_slots" => {
            let row = Row::new("time_slots", &columns, values, &["seat_id", "date", "slot_minutes"])?;
            Ok(Command::GenerateTimeSlots {
                seat_id: parse_ulid(row.required("seat_id")?)?,
                date: parse_date(row.required("date")?)?,
                slot_minutes: match row.optional("slot_minutes") {
                    Some(expr) if !is_null(expr) => Some(parse_int(expr)?),
                    _ => None,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

const BOOKING_COLUMNS: &[&str] = &["id", "seat_id", "start", "end", "duration_type", "customer_id"];

fn booking_row(row: &Row<'_>) -> Result<BookingRow, SqlError> {
    let start = parse_ms(row.required("start")?)?;
    let end = parse_ms(row.required("end")?)?;
    let duration = parse_string(row.required("duration_type")?)?;
    Ok(BookingRow {
        id: parse_ulid(row.required("id")?)?,
        seat_id: parse_ulid(row.required("seat_id")?)?,
        span: span(start, end)?,
        duration_type: DurationType::parse(&duration)
            .ok_or_else(|| SqlError::Parse(format!("bad duration_type: {duration}")))?,
        customer_id: match row.optional("customer_id") {
            Some(expr) => parse_ulid_or_null(expr)?,
            None => None,
        },
    })
}

/// VALUES of one row, addressed by column name. Without an explicit column
/// list the values are taken in the table's declared order.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(&'a str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        columns: &'a [String],
        values: &'a [Expr],
        declared: &'static [&'static str],
    ) -> Result<Self, SqlError> {
        let cells: Vec<(&'a str, &'a Expr)> = if columns.is_empty() {
            if values.len() > declared.len() {
                return Err(SqlError::WrongArity(table, declared.len(), values.len()));
            }
            declared.iter().copied().zip(values).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            for col in columns {
                if !declared.contains(&col.as_str()) {
                    return Err(SqlError::UnknownColumn(table, col.clone()));
                }
            }
            columns.iter().map(String::as_str).zip(values).collect()
        };
        Ok(Self { table, cells })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;

    match table.as_str() {
        "seats" => Ok(Command::DeleteSeat {
            id: filters.require_ulid("id")?,
        }),
        "maintenance" => {
            let seat_id = match filters.eq("seat_id") {
                Some(expr) => parse_ulid(expr)?,
                None => filters.require_ulid("id")?,
            };
            Ok(Command::EndMaintenance { seat_id })
        }
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.require_ulid("id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "branches" => {
            filters.only(&[])?;
            Command::SelectBranches
        }
        "seating_types" => {
            filters.only(&[])?;
            Command::SelectSeatingTypes
        }
        "accounts" => {
            filters.only(&[])?;
            Command::SelectAccounts
        }
        "me" => {
            filters.only(&[])?;
            Command::SelectMe
        }
        "reconcile_expired" => {
            filters.only(&[])?;
            Command::ReconcileExpired
        }
        "seats" => {
            filters.only(&["branch_id"])?;
            Command::SelectSeats {
                branch_id: filters.opt_ulid("branch_id")?,
            }
        }
        "bookings" => {
            filters.only(&["seat_id", "customer_id"])?;
            Command::SelectBookings {
                seat_id: filters.opt_ulid("seat_id")?,
                customer_id: filters.opt_ulid("customer_id")?,
            }
        }
        "time_slots" => {
            filters.only(&["seat_id", "start", "end"])?;
            Command::SelectTimeSlots {
                seat_id: filters.require_ulid("seat_id")?,
                window: filters.window()?,
            }
        }
        "free_seats" => {
            filters.only(&["seating_type_id", "branch_id", "start", "end"])?;
            Command::SelectFreeSeats {
                seating_type_id: filters.require_ulid("seating_type_id")?,
                window: filters.window()?,
                branch_id: filters.opt_ulid("branch_id")?,
            }
        }
        "verify_booking" => {
            filters.only(&["seating_type_id", "branch_id", "seat_count", "start", "end", "duration_type"])?;
            let duration = parse_string(filters.require_eq("duration_type")?)?;
            Command::VerifyBooking {
                request: VerifyRequest {
                    seating_type_id: filters.require_ulid("seating_type_id")?,
                    branch_id: filters.opt_ulid("branch_id")?,
                    seat_count: parse_int(filters.require_eq("seat_count")?)?,
                    span: filters.window()?,
                    duration_type: DurationType::parse(&duration)
                        .ok_or_else(|| SqlError::Parse(format!("bad duration_type: {duration}")))?,
                },
            }
        }
        "login" => {
            filters.only(&["email", "password"])?;
            Command::Login {
                email: parse_string(filters.require_eq("email")?)?,
                password: parse_string(filters.require_eq("password")?)?,
            }
        }
        "refresh" => {
            filters.only(&["token"])?;
            Command::Refresh {
                token: parse_string(filters.require_eq("token")?)?,
            }
        }
        "logout" => {
            filters.only(&["token"])?;
            Command::Logout {
                token: parse_string(filters.require_eq("token")?)?,
            }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(cmd)
}

/// Conjunction of `column <op> value` terms from a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.push(expr)?;
        }
        Ok(filters)
    }

    fn push(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.push(inner),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.push(left)?;
                self.push(right)
            }
            Expr::BinaryOp { left, op, right }
                if matches!(op, BinaryOperator::Eq | BinaryOperator::GtEq | BinaryOperator::LtEq) =>
            {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.terms.push((col, op.clone(), right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    /// Reject columns the target does not filter on.
    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.terms.iter().find(|(col, _, _)| !allowed.contains(&col.as_str())) {
            Some((col, _, _)) => Err(SqlError::Unsupported(format!("filter on {col}"))),
            None => Ok(()),
        }
    }

    fn find(&self, column: &str, op: &BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(col, o, _)| col == column && o == op)
            .map(|(_, _, expr)| *expr)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, &BinaryOperator::Eq)
    }

    fn require_eq(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(column))
    }

    fn require_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require_eq(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(column).map(parse_ulid).transpose()
    }

    /// `start >= a AND "end" <= b`.
    fn window(&self) -> Result<Span, SqlError> {
        let start = self
            .find("start", &BinaryOperator::GtEq)
            .ok_or(SqlError::MissingFilter("start"))?;
        let end = self
            .find("end", &BinaryOperator::LtEq)
            .ok_or(SqlError::MissingFilter("end"))?;
        span(parse_ms(start)?, parse_ms(end)?)
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn span(start: Ms, end: Ms) -> Result<Span, SqlError> {
    Span::try_new(start, end)
        .ok_or_else(|| SqlError::Parse(format!("start {start} must be before end {end}")))
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. })) => {
            Ok(Some(s.clone()))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_opt_string(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected ULID, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match expr {
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("number out of range".into())),
        _ => match extract_value(expr) {
            Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
            None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_int<T: TryFrom<i64>>(expr: &Expr) -> Result<T, SqlError> {
    let v = parse_i64(expr)?;
    T::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// Epoch milliseconds, or an RFC 3339 timestamp string.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.trim().parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {1} in {0}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_branch() {
        let sql = format!("INSERT INTO branches (id, name, opening_hour, closing_hour) VALUES ('{A}', 'Central', 8, 20)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBranch {
                id: ulid(A),
                name: "Central".into(),
                opening_hour: 8,
                closing_hour: 20,
            }
        );
    }

    #[test]
    fn columns_may_come_in_any_order() {
        let sql = format!("INSERT INTO seats (label, seating_type_id, branch_id, id) VALUES ('D-1', '{B}', '{A}', '{A}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertSeat {
                id: ulid(A),
                branch_id: ulid(A),
                seating_type_id: ulid(B),
                label: "D-1".into(),
            }
        );
    }

    #[test]
    fn values_without_column_list_are_positional() {
        let sql = format!("INSERT INTO seating_types VALUES ('{A}', 'Hot desk', 25, 150, 5000)");
        match parse_sql(&sql).unwrap() {
            Command::InsertSeatingType { rates, is_meeting_room, .. } => {
                assert_eq!(rates, Rates { hourly: 25, daily: 150, monthly: 5000 });
                assert!(!is_meeting_room);
            }
            cmd => panic!("expected InsertSeatingType, got {cmd:?}"),
        }
    }

    #[test]
    fn meeting_room_flag() {
        let sql = format!(
            "INSERT INTO seating_types (id, name, hourly_rate, daily_rate, monthly_rate, is_meeting_room) \
             VALUES ('{A}', 'Room', 80, 500, 9000, true)"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertSeatingType { is_meeting_room: true, .. }
        ));
    }

    #[test]
    fn unknown_column_rejected() {
        let sql = format!("INSERT INTO seats (id, colour) VALUES ('{A}', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("seats", _))));
    }

    #[test]
    fn missing_column_reported() {
        let sql = format!("INSERT INTO branches (id, name) VALUES ('{A}', 'Central')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("branches", "opening_hour"))
        ));
    }

    #[test]
    fn hour_out_of_range() {
        let sql = format!("INSERT INTO branches VALUES ('{A}', 'Central', 8, 300)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_account_with_and_without_role() {
        let sql = format!("INSERT INTO accounts (id, email, name, password) VALUES ('{A}', 'sam@example.com', 'Sam', 'hunter22')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertAccount { role: None, .. }));

        let sql = format!("INSERT INTO accounts (id, email, name, password, role) VALUES ('{A}', 'sam@example.com', 'Sam', 'hunter22', 'admin')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertAccount { role: Some(Role::Admin), .. }
        ));

        let sql = format!("INSERT INTO accounts (id, email, name, password, role) VALUES ('{A}', 'sam@example.com', 'Sam', 'hunter22', 'owner')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_booking_batch() {
        let sql = format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type) VALUES
               ('{A}', '{B}', 1000, 3601000, 'hourly'),
               ('{B}', '{B}', 3601000, 7201000, 'HOURLY')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBookings { bookings } => {
                assert_eq!(bookings.len(), 2);
                assert_eq!(bookings[0].span, Span::new(1000, 3_601_000));
                assert_eq!(bookings[1].id, ulid(B));
                assert_eq!(bookings[1].duration_type, DurationType::Hourly);
                assert_eq!(bookings[0].customer_id, None);
            }
            cmd => panic!("expected InsertBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_for_named_customer() {
        let sql = format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type, customer_id) VALUES ('{A}', '{A}', 0, 1000, 'DAILY', '{B}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBookings { bookings } => {
                assert_eq!(bookings[0].customer_id, Some(ulid(B)));
                assert_eq!(bookings[0].duration_type, DurationType::Daily);
            }
            cmd => panic!("expected InsertBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_accepts_rfc3339() {
        let sql = format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type) VALUES ('{A}', '{A}', '2030-01-01T09:00:00Z', '2030-01-01T10:00:00Z', 'HOURLY')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBookings { bookings } => {
                assert_eq!(bookings[0].span, Span::new(1_893_488_400_000, 1_893_492_000_000));
            }
            cmd => panic!("expected InsertBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn booking_row_errors_name_the_row() {
        let sql = format!(
            r#"INSERT INTO bookings (id, seat_id, start, "end", duration_type) VALUES
               ('{A}', '{A}', 0, 1000, 'HOURLY'),
               ('{B}', '{A}', 2000, 1000, 'HOURLY')"#
        );
        let err = parse_sql(&sql).unwrap_err();
        assert!(err.to_string().contains("row 1"), "{err}");
    }

    #[test]
    fn parse_payment_and_cancel() {
        let sql = format!("INSERT INTO payments (booking_id, reference) VALUES ('{A}', 'txn-42')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertPayment {
                booking_id: ulid(A),
                reference: Some("txn-42".into()),
            }
        );
        let sql = format!("DELETE FROM bookings WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(A) });
    }

    #[test]
    fn parse_maintenance() {
        let sql = format!("INSERT INTO maintenance (seat_id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql).unwrap(), Command::StartMaintenance { seat_id: ulid(A) });
        let sql = format!("DELETE FROM maintenance WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::EndMaintenance { seat_id: ulid(A) });
        let sql = format!("DELETE FROM maintenance WHERE seat_id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::EndMaintenance { seat_id: ulid(A) });
    }

    #[test]
    fn parse_delete_seat() {
        let sql = format!("DELETE FROM seats WHERE id = '{A}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteSeat { id: ulid(A) });
        assert!(matches!(
            parse_sql("DELETE FROM seats"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_generate_slots() {
        let sql = format!("INSERT INTO time_slots (seat_id, date) VALUES ('{A}', '2030-01-01')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::GenerateTimeSlots {
                seat_id: ulid(A),
                date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
                slot_minutes: None,
            }
        );
        let sql = format!("INSERT INTO time_slots (seat_id, date, slot_minutes) VALUES ('{A}', '2030-01-01', 30)");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::GenerateTimeSlots { slot_minutes: Some(30), .. }
        ));
        let sql = format!("INSERT INTO time_slots (seat_id, date) VALUES ('{A}', '2030-02-30')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_listings() {
        assert_eq!(parse_sql("SELECT * FROM branches").unwrap(), Command::SelectBranches);
        assert_eq!(parse_sql("select * from SEATING_TYPES;").unwrap(), Command::SelectSeatingTypes);
        assert_eq!(parse_sql("SELECT * FROM me").unwrap(), Command::SelectMe);
        assert_eq!(parse_sql("SELECT * FROM accounts").unwrap(), Command::SelectAccounts);
        assert_eq!(parse_sql("SELECT * FROM reconcile_expired").unwrap(), Command::ReconcileExpired);
        assert_eq!(
            parse_sql("SELECT * FROM seats").unwrap(),
            Command::SelectSeats { branch_id: None }
        );
        let sql = format!("SELECT * FROM bookings WHERE customer_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                seat_id: None,
                customer_id: Some(ulid(A)),
            }
        );
    }

    #[test]
    fn unknown_filter_rejected() {
        let sql = format!("SELECT * FROM bookings WHERE customer = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        assert!(parse_sql("SELECT * FROM branches WHERE id = 1 OR id = 2").is_err());
    }

    #[test]
    fn parse_time_slot_window() {
        let sql = format!(r#"SELECT * FROM time_slots WHERE seat_id = '{A}' AND start >= 1000 AND "end" <= 2000"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectTimeSlots {
                seat_id: ulid(A),
                window: Span::new(1000, 2000),
            }
        );
        let sql = format!("SELECT * FROM time_slots WHERE seat_id = '{A}' AND start >= 1000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_free_seats() {
        let sql = format!(
            r#"SELECT * FROM free_seats WHERE seating_type_id = '{A}' AND branch_id = '{B}' AND start >= 0 AND "end" <= 3600000"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectFreeSeats {
                seating_type_id: ulid(A),
                window: Span::new(0, 3_600_000),
                branch_id: Some(ulid(B)),
            }
        );
    }

    #[test]
    fn parse_verify_booking() {
        let sql = format!(
            r#"SELECT * FROM verify_booking WHERE seating_type_id = '{A}' AND seat_count = 3
               AND start >= 0 AND "end" <= 86400000 AND duration_type = 'daily'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::VerifyBooking {
                request: VerifyRequest {
                    seating_type_id: ulid(A),
                    branch_id: None,
                    seat_count: 3,
                    span: Span::new(0, 86_400_000),
                    duration_type: DurationType::Daily,
                },
            }
        );
        let sql = format!(
            r#"SELECT * FROM verify_booking WHERE seating_type_id = '{A}' AND seat_count = -1
               AND start >= 0 AND "end" <= 1 AND duration_type = 'daily'"#
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_auth_statements() {
        assert_eq!(
            parse_sql("SELECT * FROM login WHERE email = 'sam@example.com' AND password = 'it''s secret'").unwrap(),
            Command::Login {
                email: "sam@example.com".into(),
                password: "it's secret".into(),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM refresh WHERE token = 'abc'").unwrap(),
            Command::Refresh { token: "abc".into() }
        );
        assert_eq!(
            parse_sql("SELECT * FROM logout WHERE token = 'abc'").unwrap(),
            Command::Logout { token: "abc".into() }
        );
    }

    #[test]
    fn parse_session_token() {
        assert_eq!(
            parse_sql("SET hotdesk.token = 'aaa.bbb.ccc'").unwrap(),
            Command::SetToken { token: "aaa.bbb.ccc".into() }
        );
        assert_eq!(
            parse_sql("set HOTDESK.TOKEN to 'aaa.bbb.ccc';").unwrap(),
            Command::SetToken { token: "aaa.bbb.ccc".into() }
        );
        assert_eq!(parse_sql("RESET hotdesk.token").unwrap(), Command::ResetToken);
        assert_eq!(parse_sql("SET hotdesk.token = ''").unwrap(), Command::ResetToken);
        assert!(parse_sql("SET hotdesk.token = aaa").is_err());
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM foobar"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn multi_row_only_for_bookings() {
        let sql = format!("INSERT INTO seats VALUES ('{A}', '{A}', '{A}', 'x'), ('{B}', '{A}', '{A}', 'y')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn select_target_of_prepared_statement() {
        assert_eq!(
            select_target(r#"SELECT * FROM free_seats WHERE seating_type_id = $1 AND start >= $2 AND "end" <= $3"#).as_deref(),
            Some("free_seats")
        );
        assert_eq!(select_target("INSERT INTO seats VALUES ($1, $2, $3, $4)"), None);
        assert_eq!(select_target("SET hotdesk.token = $1"), None);
    }
}
