use super::{enum_col, uuid_col, UnitOfWork};
use crate::{
    aml_scorer::{RiskAssessment, ScreeningFlags},
    error::CoreResult,
    types::{ts_to_secs, Timestamp, TransactionId},
};
use rusqlite::{params, OptionalExtension};

impl UnitOfWork {
    // ── Risk assessments ──────────────────────────────────────────

    pub(crate) fn insert_assessment(&self, a: &RiskAssessment, assessed_at: Timestamp) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            "INSERT INTO risk_assessment (txn_id, risk_score, risk_level, factors, sanctions_hit, pep_hit,
                                          watchlist_hit, screening_complete, recommendation, assessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                a.transaction_id.to_string(),
                a.risk_score,
                a.risk_level.as_str(),
                serde_json::to_string(&a.factors)?,
                a.screening.sanctions,
                a.screening.pep,
                a.screening.watchlist,
                a.screening_complete,
                a.recommendation.as_str(),
                ts_to_secs(&assessed_at),
            ],
        )?;
        Ok(())
    }

    pub fn assessment(&self, txn_id: TransactionId) -> CoreResult<Option<RiskAssessment>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT txn_id, risk_score, risk_level, factors, sanctions_hit, pep_hit, watchlist_hit,
                        screening_complete, recommendation
                 FROM risk_assessment WHERE txn_id = ?1",
                params![txn_id.to_string()],
                |row| {
                    Ok((
                        RiskAssessment {
                            transaction_id: uuid_col(row, 0)?,
                            risk_score: row.get(1)?,
                            risk_level: enum_col(row, 2)?,
                            factors: Vec::new(),
                            screening: ScreeningFlags {
                                sanctions: row.get(4)?,
                                pep: row.get(5)?,
                                watchlist: row.get(6)?,
                            },
                            screening_complete: row.get(7)?,
                            recommendation: enum_col(row, 8)?,
                        },
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((mut assessment, factors)) => {
                assessment.factors = serde_json::from_str(&factors)?;
                Ok(Some(assessment))
            }
            None => Ok(None),
        }
    }
}
