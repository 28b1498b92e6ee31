pub mod budget;

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;

pub const DB_FILE: &str = "tokfence.db";

/// One durable row per handled request. Written once, never mutated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestRecord {
	pub id: String,
	pub timestamp: DateTime<Utc>,
	pub provider: String,
	pub model: String,
	pub endpoint: String,
	pub method: String,
	pub input_tokens: i64,
	pub output_tokens: i64,
	pub cache_read_tokens: i64,
	pub cache_creation_tokens: i64,
	pub estimated_cost_cents: i64,
	pub status_code: i64,
	pub latency_ms: i64,
	pub ttft_ms: i64,
	pub caller_pid: i64,
	pub caller_name: String,
	pub is_streaming: bool,
	pub error_type: String,
	pub error_message: String,
	pub request_hash: String,
}

#[derive(Debug, Default, Clone)]
pub struct ListFilter {
	pub provider: Option<String>,
	pub model: Option<String>,
	pub since: Option<DateTime<Utc>>,
	pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
	Provider,
	Model,
	Hour,
}

impl std::str::FromStr for GroupBy {
	type Err = StoreError;
	fn from_str(s: &str) -> Result<Self, StoreError> {
		match s {
			"provider" => Ok(GroupBy::Provider),
			"model" => Ok(GroupBy::Model),
			"hour" => Ok(GroupBy::Hour),
			other => Err(StoreError::InvalidGroupBy(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
	pub key: String,
	pub request_count: i64,
	pub input_tokens: i64,
	pub output_tokens: i64,
	pub estimated_cost_cents: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("database error: {0}")]
	Sqlite(#[from] rusqlite::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid group_by {0:?}, expected provider|model|hour")]
	InvalidGroupBy(String),
	#[error("rpm must be positive, got {0}")]
	InvalidRpm(i64),
}

/// Single shared handle over the on-disk state: the requests log plus the
/// provider_status / ratelimits / budgets control tables, all in one SQLite
/// file. Callers clone the `Arc` wrapping this; writers serialize on the
/// connection mutex and SQLite's busy handler bounds any cross-process wait
/// at five seconds.
pub struct Store {
	conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
	id TEXT PRIMARY KEY,
	timestamp TEXT NOT NULL,
	provider TEXT NOT NULL,
	model TEXT NOT NULL DEFAULT '',
	endpoint TEXT NOT NULL DEFAULT '',
	method TEXT NOT NULL DEFAULT '',
	input_tokens INTEGER NOT NULL DEFAULT 0,
	output_tokens INTEGER NOT NULL DEFAULT 0,
	cache_read_tokens INTEGER NOT NULL DEFAULT 0,
	cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
	estimated_cost_cents INTEGER NOT NULL DEFAULT 0,
	status_code INTEGER NOT NULL DEFAULT 0,
	latency_ms INTEGER NOT NULL DEFAULT 0,
	ttft_ms INTEGER NOT NULL DEFAULT 0,
	caller_pid INTEGER NOT NULL DEFAULT 0,
	caller_name TEXT NOT NULL DEFAULT '',
	is_streaming INTEGER NOT NULL DEFAULT 0,
	error_type TEXT NOT NULL DEFAULT '',
	error_message TEXT NOT NULL DEFAULT '',
	request_hash TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp);
CREATE INDEX IF NOT EXISTS idx_requests_provider ON requests(provider);
CREATE INDEX IF NOT EXISTS idx_requests_model ON requests(model);

CREATE TABLE IF NOT EXISTS provider_status (
	provider TEXT PRIMARY KEY,
	revoked INTEGER NOT NULL DEFAULT 0,
	revoked_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS ratelimits (
	provider TEXT PRIMARY KEY,
	rpm INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS budgets (
	provider TEXT PRIMARY KEY,
	limit_cents INTEGER NOT NULL,
	period TEXT NOT NULL,
	current_spend_cents INTEGER NOT NULL DEFAULT 0,
	period_start TEXT NOT NULL,
	enabled INTEGER NOT NULL DEFAULT 1
);
";

pub fn rfc3339(ts: DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Store {
	/// Open (creating if needed) the database under `data_dir`. The directory
	/// is forced to 0700 and the database file to 0600; the vault key cache
	/// and request log both live here and are private to the user.
	pub fn open(data_dir: &Path) -> Result<Store, StoreError> {
		fs::create_dir_all(data_dir)?;
		let db_path = data_dir.join(DB_FILE);
		let conn = Connection::open(&db_path)?;
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			fs::set_permissions(data_dir, fs::Permissions::from_mode(0o700))?;
			fs::set_permissions(&db_path, fs::Permissions::from_mode(0o600))?;
		}
		conn.busy_timeout(Duration::from_secs(5))?;
		conn.pragma_update(None, "journal_mode", "WAL")?;
		conn.pragma_update(None, "synchronous", "NORMAL")?;
		conn.execute_batch(SCHEMA)?;
		Ok(Store {
			conn: Mutex::new(conn),
		})
	}

	#[cfg(test)]
	pub fn open_in_memory() -> Result<Store, StoreError> {
		let conn = Connection::open_in_memory()?;
		conn.execute_batch(SCHEMA)?;
		Ok(Store {
			conn: Mutex::new(conn),
		})
	}

	pub fn append(&self, rec: &RequestRecord) -> Result<(), StoreError> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO requests (id, timestamp, provider, model, endpoint, method,
				input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
				estimated_cost_cents, status_code, latency_ms, ttft_ms,
				caller_pid, caller_name, is_streaming, error_type, error_message, request_hash)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
			params![
				rec.id,
				rfc3339(rec.timestamp),
				rec.provider,
				rec.model,
				rec.endpoint,
				rec.method,
				rec.input_tokens,
				rec.output_tokens,
				rec.cache_read_tokens,
				rec.cache_creation_tokens,
				rec.estimated_cost_cents,
				rec.status_code,
				rec.latency_ms,
				rec.ttft_ms,
				rec.caller_pid,
				rec.caller_name,
				rec.is_streaming,
				rec.error_type,
				rec.error_message,
				rec.request_hash,
			],
		)?;
		Ok(())
	}

	pub fn get(&self, id: &str) -> Result<Option<RequestRecord>, StoreError> {
		let conn = self.conn.lock();
		let rec = conn
			.query_row(
				&format!("SELECT {COLUMNS} FROM requests WHERE id = ?1"),
				params![id],
				row_to_record,
			)
			.optional()?;
		Ok(rec)
	}

	pub fn list(&self, filter: &ListFilter) -> Result<Vec<RequestRecord>, StoreError> {
		let mut sql = format!("SELECT {COLUMNS} FROM requests");
		let (clauses, args) = filter_clauses(filter);
		if !clauses.is_empty() {
			sql.push_str(" WHERE ");
			sql.push_str(&clauses.join(" AND "));
		}
		let limit = filter.limit.unwrap_or(50).min(500);
		sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

		let conn = self.conn.lock();
		let mut stmt = conn.prepare(&sql)?;
		let rows = stmt
			.query_map(params_from_iter(args.iter()), row_to_record)?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	}

	pub fn stats(&self, filter: &ListFilter, group_by: GroupBy) -> Result<Vec<StatsRow>, StoreError> {
		let key = match group_by {
			GroupBy::Provider => "provider",
			GroupBy::Model => "model",
			// Timestamps are stored RFC3339 UTC; the first 13 chars are the hour.
			GroupBy::Hour => "substr(timestamp, 1, 13) || ':00:00Z'",
		};
		let mut sql = format!(
			"SELECT {key} AS k, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(estimated_cost_cents)
			 FROM requests"
		);
		let (clauses, args) = filter_clauses(filter);
		if !clauses.is_empty() {
			sql.push_str(" WHERE ");
			sql.push_str(&clauses.join(" AND "));
		}
		sql.push_str(" GROUP BY k ORDER BY COUNT(*) DESC");

		let conn = self.conn.lock();
		let mut stmt = conn.prepare(&sql)?;
		let rows = stmt
			.query_map(params_from_iter(args.iter()), |row| {
				Ok(StatsRow {
					key: row.get(0)?,
					request_count: row.get(1)?,
					input_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
					output_tokens: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
					estimated_cost_cents: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
				})
			})?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	}

	/// Retention sweep, run once at startup.
	pub fn delete_older_than(&self, days: u32) -> Result<usize, StoreError> {
		let cutoff = Utc::now() - chrono::Duration::days(days as i64);
		let conn = self.conn.lock();
		let n = conn.execute(
			"DELETE FROM requests WHERE timestamp < ?1",
			params![rfc3339(cutoff)],
		)?;
		Ok(n)
	}

	pub fn is_provider_revoked(&self, provider: &str) -> Result<bool, StoreError> {
		let conn = self.conn.lock();
		let revoked = conn
			.query_row(
				"SELECT revoked FROM provider_status WHERE provider = ?1",
				params![provider],
				|row| row.get::<_, bool>(0),
			)
			.optional()?;
		Ok(revoked.unwrap_or(false))
	}

	pub fn set_provider_revoked(&self, provider: &str, revoked: bool) -> Result<(), StoreError> {
		let conn = self.conn.lock();
		upsert_revoked(&conn, provider, revoked)?;
		Ok(())
	}

	/// Revoke or restore a whole set of providers in one transaction: either
	/// every row changes or none do.
	pub fn set_all_revoked(&self, providers: &[String], revoked: bool) -> Result<(), StoreError> {
		let mut conn = self.conn.lock();
		let tx = conn.transaction()?;
		for p in providers {
			upsert_revoked(&tx, p, revoked)?;
		}
		tx.commit()?;
		Ok(())
	}

	pub fn get_rate_limit(&self, provider: &str) -> Result<Option<i64>, StoreError> {
		let conn = self.conn.lock();
		let rpm = conn
			.query_row(
				"SELECT rpm FROM ratelimits WHERE provider = ?1",
				params![provider],
				|row| row.get(0),
			)
			.optional()?;
		Ok(rpm)
	}

	pub fn set_rate_limit(&self, provider: &str, rpm: i64) -> Result<(), StoreError> {
		if rpm <= 0 {
			return Err(StoreError::InvalidRpm(rpm));
		}
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO ratelimits (provider, rpm) VALUES (?1, ?2)
			 ON CONFLICT(provider) DO UPDATE SET rpm = excluded.rpm",
			params![provider, rpm],
		)?;
		Ok(())
	}

	pub fn clear_rate_limit(&self, provider: &str) -> Result<(), StoreError> {
		let conn = self.conn.lock();
		conn.execute("DELETE FROM ratelimits WHERE provider = ?1", params![provider])?;
		Ok(())
	}

	pub fn list_rate_limits(&self) -> Result<Vec<(String, i64)>, StoreError> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare("SELECT provider, rpm FROM ratelimits ORDER BY provider")?;
		let rows = stmt
			.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
			.collect::<Result<Vec<_>, _>>()?;
		Ok(rows)
	}

	pub(crate) fn with_conn<T>(
		&self,
		f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
	) -> Result<T, StoreError> {
		let conn = self.conn.lock();
		Ok(f(&conn)?)
	}
}

fn filter_clauses(filter: &ListFilter) -> (Vec<&'static str>, Vec<String>) {
	let mut clauses = Vec::new();
	let mut args = Vec::new();
	if let Some(p) = &filter.provider {
		clauses.push("provider = ?");
		args.push(p.clone());
	}
	if let Some(m) = &filter.model {
		clauses.push("model = ?");
		args.push(m.clone());
	}
	if let Some(since) = filter.since {
		clauses.push("timestamp >= ?");
		args.push(rfc3339(since));
	}
	(clauses, args)
}

fn upsert_revoked(conn: &Connection, provider: &str, revoked: bool) -> Result<(), rusqlite::Error> {
	let revoked_at = if revoked { rfc3339(Utc::now()) } else { String::new() };
	conn.execute(
		"INSERT INTO provider_status (provider, revoked, revoked_at) VALUES (?1, ?2, ?3)
		 ON CONFLICT(provider) DO UPDATE SET revoked = excluded.revoked, revoked_at = excluded.revoked_at",
		params![provider, revoked, revoked_at],
	)?;
	Ok(())
}

const COLUMNS: &str = "id, timestamp, provider, model, endpoint, method,
	input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
	estimated_cost_cents, status_code, latency_ms, ttft_ms,
	caller_pid, caller_name, is_streaming, error_type, error_message, request_hash";

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<RequestRecord, rusqlite::Error> {
	let ts: String = row.get(1)?;
	Ok(RequestRecord {
		id: row.get(0)?,
		timestamp: ts
			.parse::<DateTime<Utc>>()
			.unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC),
		provider: row.get(2)?,
		model: row.get(3)?,
		endpoint: row.get(4)?,
		method: row.get(5)?,
		input_tokens: row.get(6)?,
		output_tokens: row.get(7)?,
		cache_read_tokens: row.get(8)?,
		cache_creation_tokens: row.get(9)?,
		estimated_cost_cents: row.get(10)?,
		status_code: row.get(11)?,
		latency_ms: row.get(12)?,
		ttft_ms: row.get(13)?,
		caller_pid: row.get(14)?,
		caller_name: row.get(15)?,
		is_streaming: row.get(16)?,
		error_type: row.get(17)?,
		error_message: row.get(18)?,
		request_hash: row.get(19)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(id: &str, provider: &str, model: &str, cents: i64) -> RequestRecord {
		RequestRecord {
			id: id.to_string(),
			timestamp: Utc::now(),
			provider: provider.to_string(),
			model: model.to_string(),
			endpoint: "/v1/chat/completions".to_string(),
			method: "POST".to_string(),
			input_tokens: 100,
			output_tokens: 50,
			estimated_cost_cents: cents,
			status_code: 200,
			latency_ms: 42,
			..Default::default()
		}
	}

	#[test]
	fn append_then_get() {
		let store = Store::open_in_memory().unwrap();
		store.append(&record("01A", "openai", "gpt-4o", 12)).unwrap();
		let rec = store.get("01A").unwrap().unwrap();
		assert_eq!(rec.provider, "openai");
		assert_eq!(rec.input_tokens, 100);
		assert_eq!(rec.estimated_cost_cents, 12);
		assert!(store.get("01B").unwrap().is_none());
	}

	#[test]
	fn list_filters_and_limit() {
		let store = Store::open_in_memory().unwrap();
		store.append(&record("01A", "openai", "gpt-4o", 1)).unwrap();
		store.append(&record("01B", "openai", "gpt-4o-mini", 1)).unwrap();
		store.append(&record("01C", "anthropic", "claude-sonnet-4", 1)).unwrap();

		let all = store.list(&ListFilter::default()).unwrap();
		assert_eq!(all.len(), 3);
		// Newest (highest id) first.
		assert_eq!(all[0].id, "01C");

		let openai = store
			.list(&ListFilter {
				provider: Some("openai".to_string()),
				..Default::default()
			})
			.unwrap();
		assert_eq!(openai.len(), 2);

		let limited = store
			.list(&ListFilter {
				limit: Some(1),
				..Default::default()
			})
			.unwrap();
		assert_eq!(limited.len(), 1);
	}

	#[test]
	fn stats_by_provider_ordered_by_count() {
		let store = Store::open_in_memory().unwrap();
		store.append(&record("01A", "openai", "gpt-4o", 10)).unwrap();
		store.append(&record("01B", "openai", "gpt-4o", 10)).unwrap();
		store.append(&record("01C", "anthropic", "claude-sonnet-4", 5)).unwrap();

		let rows = store.stats(&ListFilter::default(), GroupBy::Provider).unwrap();
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[0].key, "openai");
		assert_eq!(rows[0].request_count, 2);
		assert_eq!(rows[0].estimated_cost_cents, 20);
		assert_eq!(rows[1].key, "anthropic");
	}

	#[test]
	fn stats_by_hour_buckets() {
		let store = Store::open_in_memory().unwrap();
		store.append(&record("01A", "openai", "gpt-4o", 1)).unwrap();
		let rows = store.stats(&ListFilter::default(), GroupBy::Hour).unwrap();
		assert_eq!(rows.len(), 1);
		assert!(rows[0].key.ends_with(":00:00Z"), "{}", rows[0].key);
	}

	#[test]
	fn revocation_roundtrip() {
		let store = Store::open_in_memory().unwrap();
		assert!(!store.is_provider_revoked("openai").unwrap());
		store.set_provider_revoked("openai", true).unwrap();
		assert!(store.is_provider_revoked("openai").unwrap());
		store.set_provider_revoked("openai", false).unwrap();
		assert!(!store.is_provider_revoked("openai").unwrap());
	}

	#[test]
	fn revoke_all_is_atomic() {
		let store = Store::open_in_memory().unwrap();
		let providers = vec!["openai".to_string(), "anthropic".to_string()];
		store.set_all_revoked(&providers, true).unwrap();
		assert!(store.is_provider_revoked("openai").unwrap());
		assert!(store.is_provider_revoked("anthropic").unwrap());
		store.set_all_revoked(&providers, false).unwrap();
		assert!(!store.is_provider_revoked("anthropic").unwrap());
	}

	#[test]
	fn rate_limit_roundtrip() {
		let store = Store::open_in_memory().unwrap();
		assert!(store.get_rate_limit("openai").unwrap().is_none());
		store.set_rate_limit("openai", 30).unwrap();
		assert_eq!(store.get_rate_limit("openai").unwrap(), Some(30));
		store.set_rate_limit("openai", 60).unwrap();
		assert_eq!(store.get_rate_limit("openai").unwrap(), Some(60));
		assert_eq!(store.list_rate_limits().unwrap(), vec![("openai".to_string(), 60)]);
		store.clear_rate_limit("openai").unwrap();
		assert!(store.get_rate_limit("openai").unwrap().is_none());
	}

	#[test]
	fn rejects_non_positive_rpm() {
		let store = Store::open_in_memory().unwrap();
		assert!(matches!(
			store.set_rate_limit("openai", 0),
			Err(StoreError::InvalidRpm(0))
		));
	}

	#[test]
	fn retention_sweep() {
		let store = Store::open_in_memory().unwrap();
		let mut old = record("01A", "openai", "gpt-4o", 1);
		old.timestamp = Utc::now() - chrono::Duration::days(120);
		store.append(&old).unwrap();
		store.append(&record("01B", "openai", "gpt-4o", 1)).unwrap();
		let deleted = store.delete_older_than(90).unwrap();
		assert_eq!(deleted, 1);
		assert!(store.get("01A").unwrap().is_none());
		assert!(store.get("01B").unwrap().is_some());
	}

	#[test]
	fn open_sets_private_permissions() {
		let dir = tempfile::tempdir().unwrap();
		let data_dir = dir.path().join("fence");
		let _store = Store::open(&data_dir).unwrap();
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let dir_mode = std::fs::metadata(&data_dir).unwrap().permissions().mode() & 0o777;
			let db_mode = std::fs::metadata(data_dir.join(DB_FILE))
				.unwrap()
				.permissions()
				.mode() & 0o777;
			assert_eq!(dir_mode, 0o700);
			assert_eq!(db_mode, 0o600);
		}
	}
}
