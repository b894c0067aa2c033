use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::auth::{self, AuthError, Identity, ServiceAuthSource, TokenPair, TokenService};
use crate::engine::{BookingFilter, Engine, EngineError};
use crate::limits::DEFAULT_SLOT_MINUTES;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError, TOKEN_SETTING};
use crate::tenant::{TenantError, TenantManager};

/// What one statement runs against.
struct Session {
    engine: Arc<Engine>,
    tenant: String,
    token: Option<String>,
}

pub struct HotdeskHandler {
    tenants: Arc<TenantManager>,
    tokens: Arc<TokenService>,
    query_parser: Arc<HotdeskQueryParser>,
}

impl HotdeskHandler {
    pub fn new(tenants: Arc<TenantManager>, tokens: Arc<TokenService>) -> Self {
        Self {
            tenants,
            tokens,
            query_parser: Arc::new(HotdeskQueryParser),
        }
    }

    /// Parse, authorize and execute one statement, recording RED metrics.
    async fn run<C>(&self, client: &mut C, query: &str, format: &Format) -> PgWireResult<Response>
    where
        C: ClientInfo + Send + Sync,
    {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.dispatch(client, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!(command = label, status, "query");
        result
    }

    async fn dispatch<C>(&self, client: &mut C, cmd: Command, format: &Format) -> PgWireResult<Response>
    where
        C: ClientInfo + Send + Sync,
    {
        let tenant = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());

        match cmd {
            Command::SetToken { token } => {
                let engine = self.tenants.get_or_create(&tenant).await.map_err(tenant_err)?;
                self.tokens
                    .verify_access(&token, &tenant, &*engine)
                    .map_err(auth_err)?;
                client.metadata_mut().insert(TOKEN_SETTING.to_string(), token);
                Ok(Response::Execution(Tag::new("SET")))
            }
            Command::ResetToken => {
                client.metadata_mut().remove(TOKEN_SETTING);
                Ok(Response::Execution(Tag::new("RESET")))
            }
            cmd => {
                let engine = self.tenants.get_or_create(&tenant).await.map_err(tenant_err)?;
                let session = Session {
                    engine,
                    tenant,
                    token: client.metadata().get(TOKEN_SETTING).cloned(),
                };
                self.execute_command(&session, cmd, format).await
            }
        }
    }

    /// The caller behind the session token. Checked on every statement so
    /// expiry and logout take effect mid-session.
    fn identity(&self, session: &Session) -> PgWireResult<Identity> {
        let token = session
            .token
            .as_deref()
            .ok_or(AuthError::Unauthenticated)
            .map_err(auth_err)?;
        self.tokens
            .verify_access(token, &session.tenant, &*session.engine)
            .map_err(auth_err)
    }

    fn admin(&self, session: &Session) -> PgWireResult<Identity> {
        let who = self.identity(session)?;
        who.require_admin().map_err(auth_err)?;
        Ok(who)
    }

    /// A booking the caller may act on: their own, or any for admins.
    async fn owned_booking(&self, session: &Session, id: ulid::Ulid) -> PgWireResult<Booking> {
        let who = self.identity(session)?;
        let booking = session
            .engine
            .booking(&id)
            .await
            .ok_or(EngineError::NotFound(id))
            .map_err(engine_err)?;
        who.require_self_or_admin(booking.customer_id)
            .map_err(auth_err)?;
        Ok(booking)
    }

    async fn execute_command(
        &self,
        session: &Session,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &session.engine;
        match cmd {
            Command::InsertBranch {
                id,
                name,
                opening_hour,
                closing_hour,
            } => {
                self.admin(session)?;
                engine
                    .create_branch(Branch {
                        id,
                        name,
                        opening_hour,
                        closing_hour,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSeatingType {
                id,
                name,
                rates,
                is_meeting_room,
            } => {
                self.admin(session)?;
                engine
                    .create_seating_type(SeatingType {
                        id,
                        name,
                        rates,
                        is_meeting_room,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSeat {
                id,
                branch_id,
                seating_type_id,
                label,
            } => {
                self.admin(session)?;
                engine
                    .create_seat(id, branch_id, seating_type_id, label)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteSeat { id } => {
                self.admin(session)?;
                engine.delete_seat(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::StartMaintenance { seat_id } => {
                self.admin(session)?;
                engine
                    .set_seat_maintenance(seat_id, true)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::EndMaintenance { seat_id } => {
                self.admin(session)?;
                engine
                    .set_seat_maintenance(seat_id, false)
                    .await
                    .map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertAccount {
                id,
                email,
                name,
                password,
                role,
            } => {
                let role = role.unwrap_or(Role::Customer);
                if role == Role::Admin {
                    self.admin(session)?;
                }
                auth::check_password_policy(&password).map_err(auth_err)?;
                let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
                    .await
                    .map_err(|e| AuthError::Hash(e.to_string()))
                    .and_then(|r| r)
                    .map_err(auth_err)?;
                engine
                    .register_account(id, &email, &name, hash, role)
                    .await
                    .map_err(engine_err)?;
                info!(account = %id, %role, "account registered");
                Ok(inserted(1))
            }
            Command::InsertBookings { bookings } => {
                let who = self.identity(session)?;
                let mut requests = Vec::with_capacity(bookings.len());
                for row in bookings {
                    let customer_id = row.customer_id.unwrap_or(who.account_id);
                    who.require_self_or_admin(customer_id).map_err(auth_err)?;
                    requests.push(BookingRequest {
                        id: row.id,
                        seat_id: row.seat_id,
                        customer_id,
                        span: row.span,
                        duration_type: row.duration_type,
                    });
                }
                let placed = engine.place_bookings(requests).await.map_err(engine_err)?;
                Ok(inserted(placed.len()))
            }
            Command::InsertPayment {
                booking_id,
                reference,
            } => {
                self.owned_booking(session, booking_id).await?;
                let booking = engine
                    .confirm_booking(booking_id)
                    .await
                    .map_err(engine_err)?;
                info!(
                    booking = %booking.id,
                    price = booking.price,
                    reference = reference.as_deref().unwrap_or("-"),
                    "payment recorded"
                );
                Ok(inserted(1))
            }
            Command::DeleteBooking { id } => {
                self.owned_booking(session, id).await?;
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::GenerateTimeSlots {
                seat_id,
                date,
                slot_minutes,
            } => {
                self.admin(session)?;
                let created = engine
                    .generate_time_slots(seat_id, date, slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES))
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(created.len()))
            }
            Command::SelectBranches => Ok(rows(
                ResultSet::Branches,
                format,
                &engine.list_branches(),
                encode_branch,
            )),
            Command::SelectSeatingTypes => Ok(rows(
                ResultSet::SeatingTypes,
                format,
                &engine.list_seating_types(),
                encode_seating_type,
            )),
            Command::SelectSeats { branch_id } => {
                let seats = engine.list_seats(branch_id).await;
                Ok(rows(ResultSet::Seats, format, &seats, encode_seat))
            }
            Command::SelectBookings {
                seat_id,
                customer_id,
            } => {
                let who = self.identity(session)?;
                let customer_id = if who.is_admin() {
                    customer_id
                } else {
                    if let Some(other) = customer_id {
                        who.require_self_or_admin(other).map_err(auth_err)?;
                    }
                    Some(who.account_id)
                };
                let bookings = engine
                    .list_bookings(BookingFilter {
                        seat_id,
                        customer_id,
                    })
                    .await;
                Ok(rows(ResultSet::Bookings, format, &bookings, encode_booking))
            }
            Command::SelectAccounts => {
                self.admin(session)?;
                Ok(rows(
                    ResultSet::Accounts,
                    format,
                    &engine.list_accounts(),
                    encode_account,
                ))
            }
            Command::SelectMe => {
                let who = self.identity(session)?;
                let account = engine
                    .account(&who.account_id)
                    .ok_or(EngineError::NotFound(who.account_id))
                    .map_err(engine_err)?;
                Ok(rows(ResultSet::Accounts, format, &[account], encode_account))
            }
            Command::SelectTimeSlots { seat_id, window } => {
                let slots = engine
                    .time_slots(seat_id, window)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(ResultSet::TimeSlots, format, &slots, encode_slot))
            }
            Command::SelectFreeSeats {
                seating_type_id,
                window,
                branch_id,
            } => {
                let seats = engine
                    .free_seats(seating_type_id, window, branch_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(ResultSet::Seats, format, &seats, encode_seat))
            }
            Command::VerifyBooking { request } => {
                let quote = engine.verify_booking(request).await.map_err(engine_err)?;
                Ok(rows(ResultSet::Quote, format, &[quote], encode_quote))
            }
            Command::ReconcileExpired => {
                self.admin(session)?;
                let report = engine.reconcile_expired().await.map_err(engine_err)?;
                Ok(rows(ResultSet::Reconcile, format, &[report], encode_report))
            }
            Command::Login { email, password } => {
                let account = engine.account_by_email(&email);
                let hash = account.as_ref().map(|a| a.password_hash.clone());
                let verified = match hash {
                    Some(hash) => tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
                        .await
                        .map_err(|e| AuthError::Hash(e.to_string()))
                        .and_then(|r| r)
                        .map_err(auth_err)?,
                    None => false,
                };
                let account = match account {
                    Some(account) if verified => account,
                    _ => return Err(auth_err(AuthError::InvalidCredentials)),
                };
                let pair = self
                    .tokens
                    .issue_pair(account.id, account.role, &session.tenant)
                    .map_err(auth_err)?;
                info!(account = %account.id, "login");
                let issued = Issued {
                    account_id: account.id,
                    role: account.role,
                    pair,
                };
                Ok(rows(ResultSet::Tokens, format, &[issued], encode_tokens))
            }
            Command::Refresh { token } => {
                let (who, pair) = self
                    .tokens
                    .rotate(&token, &session.tenant, &*session.engine)
                    .await
                    .map_err(auth_err)?;
                let issued = Issued {
                    account_id: who.account_id,
                    role: who.role,
                    pair,
                };
                Ok(rows(ResultSet::Tokens, format, &[issued], encode_tokens))
            }
            Command::Logout { token } => {
                let revoked = self
                    .tokens
                    .revoke(&token, &session.tenant, &*session.engine)
                    .await
                    .map_err(auth_err)?;
                Ok(rows(ResultSet::Logout, format, &[revoked], |enc, revoked| {
                    enc.encode_field(revoked)
                }))
            }
            Command::SetToken { .. } | Command::ResetToken => Err(sql_err(SqlError::Unsupported(
                "session command outside a session".into(),
            ))),
        }
    }
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn deleted(n: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(n))
}

// ── Result sets ──────────────────────────────────────────────────

/// Shapes of the rows the server returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultSet {
    Branches,
    SeatingTypes,
    Seats,
    Bookings,
    Accounts,
    TimeSlots,
    Quote,
    Reconcile,
    Tokens,
    Logout,
}

impl ResultSet {
    /// Result set of a SELECT on the given relation.
    fn for_table(table: &str) -> Option<Self> {
        Some(match table {
            "branches" => Self::Branches,
            "seating_types" => Self::SeatingTypes,
            "seats" | "free_seats" => Self::Seats,
            "bookings" => Self::Bookings,
            "accounts" | "me" => Self::Accounts,
            "time_slots" => Self::TimeSlots,
            "verify_booking" => Self::Quote,
            "reconcile_expired" => Self::Reconcile,
            "login" | "refresh" => Self::Tokens,
            "logout" => Self::Logout,
            _ => return None,
        })
    }

    fn for_sql(sql: &str) -> Option<Self> {
        sql::select_target(sql).and_then(|t| Self::for_table(&t))
    }

    fn columns(self) -> Vec<(&'static str, Type)> {
        match self {
            Self::Branches => vec![
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("opening_hour", Type::INT4),
                ("closing_hour", Type::INT4),
            ],
            Self::SeatingTypes => vec![
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("hourly_rate", Type::INT8),
                ("daily_rate", Type::INT8),
                ("monthly_rate", Type::INT8),
                ("is_meeting_room", Type::BOOL),
            ],
            Self::Seats => vec![
                ("id", Type::VARCHAR),
                ("branch_id", Type::VARCHAR),
                ("seating_type_id", Type::VARCHAR),
                ("label", Type::VARCHAR),
                ("status", Type::VARCHAR),
            ],
            Self::Bookings => vec![
                ("id", Type::VARCHAR),
                ("seat_id", Type::VARCHAR),
                ("customer_id", Type::VARCHAR),
                ("kind", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("duration_type", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("price", Type::INT8),
                ("coins", Type::INT8),
                ("created_at", Type::INT8),
            ],
            Self::Accounts => vec![
                ("id", Type::VARCHAR),
                ("email", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("role", Type::VARCHAR),
                ("coins", Type::INT8),
            ],
            Self::TimeSlots => vec![
                ("id", Type::VARCHAR),
                ("seat_id", Type::VARCHAR),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("is_available", Type::BOOL),
                ("booking_id", Type::VARCHAR),
            ],
            Self::Quote => vec![
                ("seating_type_id", Type::VARCHAR),
                ("requested", Type::INT8),
                ("available", Type::INT8),
                ("bookable", Type::INT8),
                ("can_book", Type::BOOL),
                ("duration_type", Type::VARCHAR),
                ("units", Type::INT8),
                ("rate", Type::INT8),
                ("total_price", Type::INT8),
            ],
            Self::Reconcile => vec![
                ("seat_bookings_completed", Type::INT8),
                ("meeting_bookings_completed", Type::INT8),
                ("slots_released", Type::INT8),
                ("seats_released", Type::INT8),
                ("seats_activated", Type::INT8),
            ],
            Self::Tokens => vec![
                ("account_id", Type::VARCHAR),
                ("role", Type::VARCHAR),
                ("access_token", Type::VARCHAR),
                ("refresh_token", Type::VARCHAR),
                ("access_expires_at", Type::INT8),
                ("refresh_expires_at", Type::INT8),
            ],
            Self::Logout => vec![("revoked", Type::BOOL)],
        }
    }

    fn fields(self, format: &Format) -> Vec<FieldInfo> {
        self.columns()
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
            .collect()
    }
}

fn rows<T>(
    set: ResultSet,
    format: &Format,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(set.fields(format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Postgres has no unsigned integers.
fn int8(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn encode_branch(enc: &mut DataRowEncoder, b: &Branch) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.name)?;
    enc.encode_field(&i32::from(b.opening_hour))?;
    enc.encode_field(&i32::from(b.closing_hour))
}

fn encode_seating_type(enc: &mut DataRowEncoder, t: &SeatingType) -> PgWireResult<()> {
    enc.encode_field(&t.id.to_string())?;
    enc.encode_field(&t.name)?;
    enc.encode_field(&int8(t.rates.hourly))?;
    enc.encode_field(&int8(t.rates.daily))?;
    enc.encode_field(&int8(t.rates.monthly))?;
    enc.encode_field(&t.is_meeting_room)
}

fn encode_seat(enc: &mut DataRowEncoder, s: &Seat) -> PgWireResult<()> {
    enc.encode_field(&s.id.to_string())?;
    enc.encode_field(&s.branch_id.to_string())?;
    enc.encode_field(&s.seating_type_id.to_string())?;
    enc.encode_field(&s.label)?;
    enc.encode_field(&s.status.as_str())
}

fn encode_booking(enc: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.seat_id.to_string())?;
    enc.encode_field(&b.customer_id.to_string())?;
    enc.encode_field(&b.kind.as_str())?;
    enc.encode_field(&b.span.start)?;
    enc.encode_field(&b.span.end)?;
    enc.encode_field(&b.duration_type.as_str())?;
    enc.encode_field(&b.status.as_str())?;
    enc.encode_field(&int8(b.price))?;
    enc.encode_field(&int8(b.coins))?;
    enc.encode_field(&b.created_at)
}

fn encode_account(enc: &mut DataRowEncoder, a: &Account) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.email)?;
    enc.encode_field(&a.name)?;
    enc.encode_field(&a.role.as_str())?;
    enc.encode_field(&int8(a.coins))
}

fn encode_slot(enc: &mut DataRowEncoder, s: &TimeSlot) -> PgWireResult<()> {
    enc.encode_field(&s.id.to_string())?;
    enc.encode_field(&s.seat_id.to_string())?;
    enc.encode_field(&s.span.start)?;
    enc.encode_field(&s.span.end)?;
    enc.encode_field(&s.is_available)?;
    enc.encode_field(&s.booking_id.map(|id| id.to_string()))
}

fn encode_quote(enc: &mut DataRowEncoder, q: &BookingQuote) -> PgWireResult<()> {
    enc.encode_field(&q.seating_type_id.to_string())?;
    enc.encode_field(&i64::from(q.requested))?;
    enc.encode_field(&i64::from(q.available))?;
    enc.encode_field(&i64::from(q.bookable))?;
    enc.encode_field(&q.can_book)?;
    enc.encode_field(&q.duration_type.as_str())?;
    enc.encode_field(&int8(q.units))?;
    enc.encode_field(&int8(q.rate))?;
    enc.encode_field(&int8(q.total_price))
}

fn encode_report(enc: &mut DataRowEncoder, r: &ReconcileReport) -> PgWireResult<()> {
    enc.encode_field(&i64::from(r.seat_bookings_completed))?;
    enc.encode_field(&i64::from(r.meeting_bookings_completed))?;
    enc.encode_field(&i64::from(r.slots_released))?;
    enc.encode_field(&i64::from(r.seats_released))?;
    enc.encode_field(&i64::from(r.seats_activated))
}

/// A token pair and whom it was issued to.
struct Issued {
    account_id: ulid::Ulid,
    role: Role,
    pair: TokenPair,
}

fn encode_tokens(enc: &mut DataRowEncoder, issued: &Issued) -> PgWireResult<()> {
    enc.encode_field(&issued.account_id.to_string())?;
    enc.encode_field(&issued.role.as_str())?;
    enc.encode_field(&issued.pair.access_token)?;
    enc.encode_field(&issued.pair.refresh_token)?;
    enc.encode_field(&issued.pair.access_expires_at)?;
    enc.encode_field(&issued.pair.refresh_expires_at)
}

#[async_trait]
impl SimpleQueryHandler for HotdeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HotdeskQueryParser;

#[async_trait]
impl QueryParser for HotdeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(ResultSet::for_sql(stmt).map_or_else(Vec::new, |set| set.fields(format)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HotdeskHandler {
    type Statement = String;
    type QueryParser = HotdeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let fields = ResultSet::for_sql(&target.statement)
            .map_or_else(Vec::new, |set| set.fields(&Format::UnifiedText));
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let fields = ResultSet::for_sql(&target.statement.statement)
            .map_or_else(Vec::new, |set| set.fields(&target.result_column_format));
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Copy `sql`, handing each `$N` placeholder outside quoted strings and
/// identifiers to `on_param` instead. Single pass, so text a callback emits
/// is never scanned again.
fn scan_params(sql: &str, mut on_param: impl FnMut(usize, &mut String)) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        match quote {
            // A doubled quote closes and reopens, which lands in the same state.
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$' => {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                match sql[start..end].parse::<usize>() {
                    Ok(n) if n > 0 => on_param(n, &mut out),
                    _ => out.push_str(&sql[i..end]),
                }
            }
            None => out.push(c),
        }
    }
    out
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    scan_params(sql, |n, _| max = max.max(n));
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

/// Values become quoted literals; unbound placeholders are left for the
/// parser to reject.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    scan_params(sql, |n, out| match params.get(n - 1) {
        Some(Some(text)) => {
            out.push('\'');
            out.push_str(&text.replace('\'', "''"));
            out.push('\'');
        }
        Some(None) => out.push_str("NULL"),
        None => {
            out.push('$');
            out.push_str(&n.to_string());
        }
    })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HotdeskFactory {
    handler: Arc<HotdeskHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ServiceAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HotdeskFactory {
    pub fn new(tenants: Arc<TenantManager>, tokens: Arc<TokenService>, password: String) -> Self {
        let auth_source = ServiceAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(HotdeskHandler::new(tenants, tokens)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HotdeskFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    tokens: Arc<TokenService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(HotdeskFactory::new(tenants, tokens, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Conflict(_) | EngineError::SlotUnavailable(_) => "23P01",
        EngineError::AlreadyExists(_) | EngineError::EmailTaken(_) => "23505",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn auth_sqlstate(e: &AuthError) -> (&'static str, Option<&'static str>) {
    match e {
        AuthError::InvalidCredentials => ("28000", Some("login")),
        AuthError::InvalidToken(_)
        | AuthError::Expired
        | AuthError::Revoked
        | AuthError::WrongKind { .. }
        | AuthError::WrongTenant
        | AuthError::Unauthenticated => ("28000", Some("token")),
        AuthError::Forbidden(_) => ("42501", Some("authorize")),
        AuthError::PasswordPolicy { .. } => ("P0001", None),
        AuthError::WeakSecret(_) | AuthError::Hash(_) | AuthError::Storage(_) => ("XX000", None),
    }
}

fn auth_err(e: AuthError) -> PgWireError {
    let (code, stage) = auth_sqlstate(&e);
    if let Some(stage) = stage {
        metrics::counter!(observability::AUTH_FAILURES_TOTAL, "stage" => stage).increment(1);
    }
    user_error(code, e.to_string())
}

fn tenant_err(e: TenantError) -> PgWireError {
    user_error("08006", format!("tenant error: {e}"))
}
