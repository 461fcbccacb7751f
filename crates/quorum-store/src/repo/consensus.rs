use rusqlite::{params, OptionalExtension, Row};

use quorum_types::{Decision, Proposal, ProposalRef, TokenUsage};

use crate::db::{parse_ts, ts, Store};
use crate::error::StoreResult;

/// Typed CRUD over the `proposals` table. Proposals are immutable once
/// inserted; insertion order is the rowid order.
#[derive(Clone)]
pub struct ProposalRepo {
    store: Store,
}

impl ProposalRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn insert(&self, proposal: &Proposal) -> StoreResult<()> {
        let content = serde_json::to_string(&proposal.content)?;
        let metadata = proposal
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let proposal = proposal.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO proposals (id, task_id, agent_id, input_type, content,
                        confidence, tokens_in, tokens_out, created_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        proposal.id,
                        proposal.task_id,
                        proposal.agent_id,
                        proposal.input_type,
                        content,
                        proposal.confidence,
                        proposal.token_usage.input,
                        proposal.token_usage.output,
                        ts(proposal.created_at),
                        metadata,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<Proposal>> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, task_id, agent_id, input_type, content, confidence,
                            tokens_in, tokens_out, created_at, metadata
                     FROM proposals WHERE id = ?1",
                    params![id],
                    map_proposal,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    /// All proposals for a task, in insertion order.
    pub async fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<Proposal>> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, agent_id, input_type, content, confidence,
                            tokens_in, tokens_out, created_at, metadata
                     FROM proposals WHERE task_id = ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![task_id], map_proposal)?;
                let mut proposals = Vec::new();
                for row in rows {
                    proposals.push(row??);
                }
                Ok(proposals)
            })
            .await
    }

    pub async fn count_for_task(&self, task_id: &str) -> StoreResult<u64> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM proposals WHERE task_id = ?1",
                    params![task_id],
                    |r| r.get::<_, u64>(0),
                )?)
            })
            .await
    }
}

fn map_proposal(row: &Row<'_>) -> rusqlite::Result<StoreResult<Proposal>> {
    let content: String = row.get(4)?;
    let created_at: String = row.get(8)?;
    let metadata: Option<String> = row.get(9)?;
    let proposal: StoreResult<Proposal> = (|| {
        Ok(Proposal {
            id: row_get(row, 0)?,
            task_id: row_get(row, 1)?,
            agent_id: row_get(row, 2)?,
            input_type: row_get(row, 3)?,
            content: serde_json::from_str(&content)?,
            confidence: row_get(row, 5)?,
            token_usage: TokenUsage {
                input: row_get(row, 6)?,
                output: row_get(row, 7)?,
            },
            created_at: parse_ts(&created_at)?,
            metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
        })
    })();
    Ok(proposal)
}

fn row_get<T: rusqlite::types::FromSql>(row: &Row<'_>, idx: usize) -> StoreResult<T> {
    Ok(row.get(idx)?)
}

/// Typed CRUD over the `decisions` table. Decisions may be upserted with
/// richer metadata after the fact.
#[derive(Clone)]
pub struct DecisionRepo {
    store: Store,
}

impl DecisionRepo {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, decision: &Decision) -> StoreResult<()> {
        let considered = serde_json::to_string(&decision.considered)?;
        let selected = serde_json::to_string(&decision.selected)?;
        let metadata = decision
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let decision = decision.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO decisions (id, task_id, considered, selected,
                        winner_proposal_id, agreement_rate, rationale, consensus_achieved,
                        decided_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        considered = excluded.considered,
                        selected = excluded.selected,
                        winner_proposal_id = excluded.winner_proposal_id,
                        agreement_rate = excluded.agreement_rate,
                        rationale = excluded.rationale,
                        consensus_achieved = excluded.consensus_achieved,
                        metadata = excluded.metadata",
                    params![
                        decision.id,
                        decision.task_id,
                        considered,
                        selected,
                        decision.winner_proposal_id,
                        decision.agreement_rate,
                        decision.rationale,
                        decision.consensus_achieved,
                        ts(decision.decided_at),
                        metadata,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn find_by_id(&self, id: &str) -> StoreResult<Option<Decision>> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, task_id, considered, selected, winner_proposal_id,
                            agreement_rate, rationale, consensus_achieved, decided_at, metadata
                     FROM decisions WHERE id = ?1",
                    params![id],
                    map_decision,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    pub async fn latest_for_task(&self, task_id: &str) -> StoreResult<Option<Decision>> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, task_id, considered, selected, winner_proposal_id,
                            agreement_rate, rationale, consensus_achieved, decided_at, metadata
                     FROM decisions WHERE task_id = ?1 ORDER BY rowid DESC LIMIT 1",
                    params![task_id],
                    map_decision,
                )
                .optional()?
                .transpose()
            })
            .await
    }
}

fn map_decision(row: &Row<'_>) -> rusqlite::Result<StoreResult<Decision>> {
    let considered: String = row.get(2)?;
    let selected: String = row.get(3)?;
    let decided_at: String = row.get(8)?;
    let metadata: Option<String> = row.get(9)?;
    let decision: StoreResult<Decision> = (|| {
        Ok(Decision {
            id: row_get(row, 0)?,
            task_id: row_get(row, 1)?,
            considered: serde_json::from_str::<Vec<ProposalRef>>(&considered)?,
            selected: serde_json::from_str::<Vec<String>>(&selected)?,
            winner_proposal_id: row_get(row, 4)?,
            agreement_rate: row_get(row, 5)?,
            rationale: row_get(row, 6)?,
            consensus_achieved: row_get(row, 7)?,
            decided_at: parse_ts(&decided_at)?,
            metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
        })
    })();
    Ok(decision)
}
