//! Per-contributor reputation.
//!
//! Only this module writes `contributor_reputation`. Reputation is a smoothed
//! ratio of positive to total signal, `(pos + 1) / (pos + neg + 2)`, floored so
//! a contributor is never weighted to nothing.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::error::Result;
use super::types::{parse_ts, ts};

/// Reputation of a contributor with no history.
pub const DEFAULT_REPUTATION: f64 = 0.5;
const REPUTATION_FLOOR: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReputationRecord {
    pub instance_id: String,
    pub positive: f64,
    pub negative: f64,
    pub events: u64,
    pub reputation: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

fn smoothed(positive: f64, negative: f64) -> f64 {
    ((positive + 1.0) / (positive + negative + 2.0)).clamp(REPUTATION_FLOOR, 1.0)
}

pub fn reputation_of(conn: &Connection, instance_id: &str) -> Result<f64> {
    let rep: Option<f64> = conn
        .query_row(
            "SELECT reputation FROM contributor_reputation WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(rep.unwrap_or(DEFAULT_REPUTATION))
}

/// One reputation per id, in input order.
pub fn reputations_of(conn: &Connection, instance_ids: &[String]) -> Result<Vec<f64>> {
    instance_ids
        .iter()
        .map(|id| reputation_of(conn, id))
        .collect()
}

pub fn get_record(conn: &Connection, instance_id: &str) -> Result<Option<ReputationRecord>> {
    let record = conn
        .query_row(
            "SELECT instance_id, positive, negative, events, reputation, updated_at \
             FROM contributor_reputation WHERE instance_id = ?1",
            params![instance_id],
            |row| {
                let updated_at: String = row.get(5)?;
                Ok(ReputationRecord {
                    instance_id: row.get(0)?,
                    positive: row.get(1)?,
                    negative: row.get(2)?,
                    events: row.get::<_, i64>(3)? as u64,
                    reputation: row.get(4)?,
                    updated_at: parse_ts(&updated_at),
                })
            },
        )
        .optional()?;
    Ok(record)
}

/// Credit a signed signal to a contributor and return the new reputation.
///
/// Positive signals accumulate into `positive`, negative ones into `negative`.
pub fn record_signal(
    conn: &Connection,
    instance_id: &str,
    signal: f64,
    now: DateTime<Utc>,
) -> Result<f64> {
    if !signal.is_finite() {
        tracing::warn!(instance_id, "ignoring non-finite reputation signal");
        return reputation_of(conn, instance_id);
    }

    let (pos_delta, neg_delta) = if signal >= 0.0 {
        (signal, 0.0)
    } else {
        (0.0, -signal)
    };

    let (positive, negative) = match get_record(conn, instance_id)? {
        Some(r) => (r.positive + pos_delta, r.negative + neg_delta),
        None => (pos_delta, neg_delta),
    };
    let reputation = smoothed(positive, negative);

    conn.execute(
        "INSERT INTO contributor_reputation (instance_id, positive, negative, events, reputation, updated_at) \
         VALUES (?1, ?2, ?3, 1, ?4, ?5) \
         ON CONFLICT(instance_id) DO UPDATE SET \
             positive = excluded.positive, negative = excluded.negative, \
             events = events + 1, reputation = excluded.reputation, updated_at = excluded.updated_at",
        params![instance_id, positive, negative, reputation, ts(&now)],
    )?;

    tracing::debug!(instance_id, signal, reputation, "reputation updated");
    Ok(reputation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::now;

    fn test_db() -> Connection {
        crate::db::open_memory_database().unwrap()
    }

    #[test]
    fn unknown_contributor_has_default_reputation() {
        let conn = test_db();
        assert_eq!(reputation_of(&conn, "nobody").unwrap(), DEFAULT_REPUTATION);
        assert!(get_record(&conn, "nobody").unwrap().is_none());
    }

    #[test]
    fn signals_move_reputation_both_ways() {
        let conn = test_db();
        let up = record_signal(&conn, "a1", 1.0, now()).unwrap();
        assert!((up - 2.0 / 3.0).abs() < 1e-9);

        let down = record_signal(&conn, "a1", -3.0, now()).unwrap();
        assert!((down - 2.0 / 6.0).abs() < 1e-9);

        let record = get_record(&conn, "a1").unwrap().unwrap();
        assert_eq!(record.events, 2);
        assert_eq!(record.positive, 1.0);
        assert_eq!(record.negative, 3.0);
    }

    #[test]
    fn reputation_never_drops_below_floor() {
        let conn = test_db();
        let mut rep = 1.0;
        for _ in 0..50 {
            rep = record_signal(&conn, "a1", -10.0, now()).unwrap();
        }
        assert_eq!(rep, REPUTATION_FLOOR);
    }

    #[test]
    fn non_finite_signal_is_ignored() {
        let conn = test_db();
        let rep = record_signal(&conn, "a1", f64::INFINITY, now()).unwrap();
        assert_eq!(rep, DEFAULT_REPUTATION);
        assert!(get_record(&conn, "a1").unwrap().is_none());
    }
}
