use chrono::{DateTime, Datelike, Duration, Months, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::store::{Store, StoreError, rfc3339};

/// Budget key that applies to every provider's traffic.
pub const GLOBAL: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
	Daily,
	Monthly,
}

impl Period {
	pub fn as_str(&self) -> &'static str {
		match self {
			Period::Daily => "daily",
			Period::Monthly => "monthly",
		}
	}
}

impl std::str::FromStr for Period {
	type Err = String;
	fn from_str(s: &str) -> Result<Self, String> {
		match s {
			"daily" => Ok(Period::Daily),
			"monthly" => Ok(Period::Monthly),
			other => Err(format!("unknown budget period {other:?}")),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetRow {
	pub provider: String,
	pub limit_cents: i64,
	pub period: Period,
	pub current_spend_cents: i64,
	pub period_start: DateTime<Utc>,
	pub enabled: bool,
}

/// Payload for a budget-denied request.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetExceeded {
	pub provider: String,
	pub limit_cents: i64,
	pub current_spend_cents: i64,
	pub resets_at: DateTime<Utc>,
}

/// Start of the period window containing `now`: UTC midnight for daily,
/// first-of-month UTC for monthly.
pub fn period_start_of(now: DateTime<Utc>, period: Period) -> DateTime<Utc> {
	let date = match period {
		Period::Daily => now.date_naive(),
		Period::Monthly => now.date_naive().with_day(1).expect("day 1 is valid"),
	};
	date.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc()
}

pub fn next_reset(period_start: DateTime<Utc>, period: Period) -> DateTime<Utc> {
	match period {
		Period::Daily => period_start + Duration::days(1),
		Period::Monthly => period_start
			.checked_add_months(Months::new(1))
			.expect("month addition in range"),
	}
}

impl Store {
	/// Upsert a budget. The period window is preserved when the period kind
	/// is unchanged; switching daily<->monthly starts a fresh window with
	/// zero spend.
	pub fn set_budget(&self, provider: &str, amount_usd: f64, period: Period) -> Result<(), StoreError> {
		let limit_cents = (amount_usd * 100.0).round() as i64;
		let now = Utc::now();
		self.with_conn(|conn| {
			let existing: Option<String> = conn
				.query_row(
					"SELECT period FROM budgets WHERE provider = ?1",
					params![provider],
					|row| row.get(0),
				)
				.optional()?;
			let same_period = existing.as_deref() == Some(period.as_str());
			if same_period {
				conn.execute(
					"UPDATE budgets SET limit_cents = ?2, enabled = 1 WHERE provider = ?1",
					params![provider, limit_cents],
				)?;
			} else {
				conn.execute(
					"INSERT INTO budgets (provider, limit_cents, period, current_spend_cents, period_start, enabled)
					 VALUES (?1, ?2, ?3, 0, ?4, 1)
					 ON CONFLICT(provider) DO UPDATE SET
						limit_cents = excluded.limit_cents,
						period = excluded.period,
						current_spend_cents = 0,
						period_start = excluded.period_start,
						enabled = 1",
					params![provider, limit_cents, period.as_str(), rfc3339(period_start_of(now, period))],
				)?;
			}
			Ok(())
		})
	}

	pub fn clear_budget(&self, provider: &str) -> Result<(), StoreError> {
		self.with_conn(|conn| {
			conn.execute("DELETE FROM budgets WHERE provider = ?1", params![provider])?;
			Ok(())
		})
	}

	/// All budget rows, freshest-window view: expired periods are rolled over
	/// before reading.
	pub fn budget_status(&self) -> Result<Vec<BudgetRow>, StoreError> {
		self.reset_expired_budgets()?;
		self.with_conn(|conn| {
			let mut stmt = conn.prepare(
				"SELECT provider, limit_cents, period, current_spend_cents, period_start, enabled
				 FROM budgets ORDER BY provider",
			)?;
			let rows = stmt
				.query_map([], row_to_budget)?
				.collect::<Result<Vec<_>, _>>()?;
			Ok(rows)
		})
	}

	/// Roll every enabled budget whose window has ended into the current
	/// window. Idempotent; precedes every limit check and spend increment.
	pub fn reset_expired_budgets(&self) -> Result<(), StoreError> {
		let now = Utc::now();
		self.with_conn(|conn| {
			let mut stmt = conn
				.prepare("SELECT provider, period, period_start FROM budgets WHERE enabled = 1")?;
			let rows = stmt
				.query_map([], |row| {
					Ok((
						row.get::<_, String>(0)?,
						row.get::<_, String>(1)?,
						row.get::<_, String>(2)?,
					))
				})?
				.collect::<Result<Vec<_>, _>>()?;
			for (provider, period, start) in rows {
				let Ok(period) = period.parse::<Period>() else {
					continue;
				};
				let Ok(start) = start.parse::<DateTime<Utc>>() else {
					continue;
				};
				if now >= next_reset(start, period) {
					conn.execute(
						"UPDATE budgets SET current_spend_cents = 0, period_start = ?2 WHERE provider = ?1",
						params![provider, rfc3339(period_start_of(now, period))],
					)?;
				}
			}
			Ok(())
		})
	}

	/// First exceeded budget gating this provider: the provider's own row,
	/// then the global row.
	pub fn check_budget(&self, provider: &str) -> Result<Option<BudgetExceeded>, StoreError> {
		self.reset_expired_budgets()?;
		for key in [provider, GLOBAL] {
			let row = self.with_conn(|conn| {
				conn
					.query_row(
						"SELECT provider, limit_cents, period, current_spend_cents, period_start, enabled
						 FROM budgets WHERE provider = ?1",
						params![key],
						row_to_budget,
					)
					.optional()
			})?;
			if let Some(row) = row
				&& row.enabled && row.current_spend_cents >= row.limit_cents
			{
				return Ok(Some(BudgetExceeded {
					provider: row.provider,
					limit_cents: row.limit_cents,
					current_spend_cents: row.current_spend_cents,
					resets_at: next_reset(row.period_start, row.period),
				}));
			}
		}
		Ok(None)
	}

	/// Record spend against the provider's budget and the global budget,
	/// whichever exist and are enabled. Plain integer adds; interleaving
	/// across requests is safe.
	pub fn add_spend(&self, provider: &str, cents: i64) -> Result<(), StoreError> {
		if cents <= 0 {
			return Ok(());
		}
		self.reset_expired_budgets()?;
		self.with_conn(|conn| {
			conn.execute(
				"UPDATE budgets SET current_spend_cents = current_spend_cents + ?3
				 WHERE provider IN (?1, ?2) AND enabled = 1",
				params![provider, GLOBAL, cents],
			)?;
			Ok(())
		})
	}
}

fn row_to_budget(row: &rusqlite::Row<'_>) -> Result<BudgetRow, rusqlite::Error> {
	let period: String = row.get(2)?;
	let start: String = row.get(4)?;
	Ok(BudgetRow {
		provider: row.get(0)?,
		limit_cents: row.get(1)?,
		period: period.parse().unwrap_or(Period::Daily),
		current_spend_cents: row.get(3)?,
		period_start: start
			.parse::<DateTime<Utc>>()
			.unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC),
		enabled: row.get(5)?,
	})
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	#[test]
	fn period_windows() {
		let now = Utc.with_ymd_and_hms(2026, 8, 1, 15, 30, 0).unwrap();
		assert_eq!(
			period_start_of(now, Period::Daily),
			Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
		);
		assert_eq!(
			period_start_of(now, Period::Monthly),
			Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
		);
		let mid_month = Utc.with_ymd_and_hms(2026, 8, 17, 3, 0, 0).unwrap();
		assert_eq!(
			period_start_of(mid_month, Period::Monthly),
			Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
		);
	}

	#[test]
	fn next_reset_daily_and_monthly() {
		let start = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
		assert_eq!(
			next_reset(start, Period::Daily),
			Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap()
		);
		assert_eq!(
			next_reset(start, Period::Monthly),
			Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
		);
		// Month arithmetic clamps the day.
		let jan31 = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
		assert_eq!(
			next_reset(jan31, Period::Monthly),
			Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap()
		);
	}

	#[test]
	fn spend_accumulates_and_trips_limit() {
		let store = Store::open_in_memory().unwrap();
		store.set_budget("openai", 1.00, Period::Daily).unwrap();
		assert!(store.check_budget("openai").unwrap().is_none());

		store.add_spend("openai", 40).unwrap();
		assert!(store.check_budget("openai").unwrap().is_none());

		store.add_spend("openai", 60).unwrap();
		let exceeded = store.check_budget("openai").unwrap().unwrap();
		assert_eq!(exceeded.limit_cents, 100);
		assert_eq!(exceeded.current_spend_cents, 100);
		assert!(exceeded.resets_at > Utc::now());
	}

	#[test]
	fn global_budget_gates_every_provider() {
		let store = Store::open_in_memory().unwrap();
		store.set_budget(GLOBAL, 0.50, Period::Monthly).unwrap();
		store.add_spend("anthropic", 50).unwrap();
		let exceeded = store.check_budget("openai").unwrap().unwrap();
		assert_eq!(exceeded.provider, GLOBAL);
	}

	#[test]
	fn provider_row_checked_before_global() {
		let store = Store::open_in_memory().unwrap();
		store.set_budget("openai", 0.10, Period::Daily).unwrap();
		store.set_budget(GLOBAL, 0.10, Period::Daily).unwrap();
		store.add_spend("openai", 20).unwrap();
		let exceeded = store.check_budget("openai").unwrap().unwrap();
		assert_eq!(exceeded.provider, "openai");
	}

	#[test]
	fn set_preserves_window_for_same_period() {
		let store = Store::open_in_memory().unwrap();
		store.set_budget("openai", 1.00, Period::Daily).unwrap();
		store.add_spend("openai", 30).unwrap();
		let before = &store.budget_status().unwrap()[0];
		let (start, spend) = (before.period_start, before.current_spend_cents);
		assert_eq!(spend, 30);

		// Raising the limit mid-window keeps the window and the spend.
		store.set_budget("openai", 2.00, Period::Daily).unwrap();
		let after = &store.budget_status().unwrap()[0];
		assert_eq!(after.limit_cents, 200);
		assert_eq!(after.current_spend_cents, 30);
		assert_eq!(after.period_start, start);

		// Switching period kinds starts a fresh window.
		store.set_budget("openai", 2.00, Period::Monthly).unwrap();
		let switched = &store.budget_status().unwrap()[0];
		assert_eq!(switched.current_spend_cents, 0);
		assert_eq!(switched.period, Period::Monthly);
	}

	#[test]
	fn expired_window_resets_on_access() {
		let store = Store::open_in_memory().unwrap();
		store.set_budget("openai", 1.00, Period::Daily).unwrap();
		store.add_spend("openai", 500).unwrap();
		// Backdate the window to yesterday.
		let yesterday = Utc::now() - Duration::days(1);
		store
			.with_conn(|conn| {
				conn.execute(
					"UPDATE budgets SET period_start = ?1",
					params![rfc3339(period_start_of(yesterday, Period::Daily))],
				)?;
				Ok(())
			})
			.unwrap();

		assert!(store.check_budget("openai").unwrap().is_none());
		let row = &store.budget_status().unwrap()[0];
		assert_eq!(row.current_spend_cents, 0);
		assert_eq!(row.period_start, period_start_of(Utc::now(), Period::Daily));
	}

	#[test]
	fn clear_removes_row() {
		let store = Store::open_in_memory().unwrap();
		store.set_budget("openai", 1.00, Period::Daily).unwrap();
		store.clear_budget("openai").unwrap();
		assert!(store.budget_status().unwrap().is_empty());
		assert!(store.check_budget("openai").unwrap().is_none());
	}

	#[test]
	fn spend_ignored_without_budget_rows() {
		let store = Store::open_in_memory().unwrap();
		store.add_spend("openai", 100).unwrap();
		assert!(store.check_budget("openai").unwrap().is_none());
	}
}
