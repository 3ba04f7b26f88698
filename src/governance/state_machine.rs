//! Proposal state machine
//!
//! `Captured -> Approved -> Released` is the accepting path and
//! `Captured|Approved -> Declined` the rejecting one. Every transition returns
//! a fresh row for the ledger; the prior row is never touched.

use crate::error::AppError;
use crate::governance::models::{Proposal, ProposalAction, ProposalState, ProposalSubject};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

/// Open a new proposal for `subject`.
///
/// Valid when the subject has no prior row or its latest row is terminal. A
/// zero threshold releases the proposal on capture.
pub fn capture(
    prior: Option<&Proposal>,
    subject: ProposalSubject,
    action: ProposalAction,
    actor: Uuid,
    required_approvals: u32,
) -> Result<Proposal, AppError> {
    require_actor(actor, "capture")?;

    if let Some(prior) = prior {
        if !prior.is_terminal() {
            return Err(AppError::InvalidStateTransition(format!(
                "Cannot capture a new proposal for {} while proposal {} is {}",
                prior.key(),
                prior.id,
                prior.state
            )));
        }
    }

    let state = if required_approvals == 0 {
        ProposalState::Released
    } else {
        ProposalState::Captured
    };

    debug!(
        "CAPTURE {} {} by {} -> {}",
        action,
        subject.key(),
        actor,
        state
    );

    Ok(Proposal {
        id: Uuid::new_v4(),
        sequence: 0,
        subject,
        action,
        state,
        approval_count: 0,
        actor,
        created_at: Utc::now(),
    })
}

/// Record one approval on the latest row of a subject
pub fn approve(
    latest: &Proposal,
    actor: Uuid,
    required_approvals: u32,
) -> Result<Proposal, AppError> {
    require_actor(actor, "approve")?;

    if !matches!(
        latest.state,
        ProposalState::Captured | ProposalState::Approved
    ) {
        return Err(AppError::InvalidStateTransition(format!(
            "Cannot approve proposal {} for {} in state {}",
            latest.id,
            latest.key(),
            latest.state
        )));
    }

    let approval_count = latest.approval_count + 1;
    let state = if approval_count >= required_approvals {
        ProposalState::Released
    } else {
        ProposalState::Approved
    };

    debug!(
        "APPROVE {} by {} ({}/{}) -> {}",
        latest.key(),
        actor,
        approval_count,
        required_approvals,
        state
    );

    Ok(advance(latest, state, approval_count, actor))
}

/// Reject the latest row of a subject
pub fn decline(latest: &Proposal, actor: Uuid) -> Result<Proposal, AppError> {
    require_actor(actor, "decline")?;

    if latest.is_terminal() {
        return Err(AppError::InvalidStateTransition(format!(
            "Cannot decline proposal {} for {} in state {}",
            latest.id,
            latest.key(),
            latest.state
        )));
    }

    debug!("DECLINE {} by {}", latest.key(), actor);

    Ok(advance(latest, ProposalState::Declined, 0, actor))
}

fn advance(latest: &Proposal, state: ProposalState, approval_count: u32, actor: Uuid) -> Proposal {
    Proposal {
        id: Uuid::new_v4(),
        sequence: 0,
        subject: latest.subject.clone(),
        action: latest.action,
        state,
        approval_count,
        actor,
        created_at: Utc::now(),
    }
}

fn require_actor(actor: Uuid, transition: &str) -> Result<(), AppError> {
    if actor.is_nil() {
        return Err(AppError::InvalidStateTransition(format!(
            "An acting principal must be specified to {} a proposal",
            transition
        )));
    }
    Ok(())
}

/// Rows of one subject since its previous terminal state.
///
/// `rows` must be ordered by sequence. When the latest row is terminal the
/// wave ends with it.
pub fn current_wave(rows: &[Proposal]) -> &[Proposal] {
    let Some((_, earlier)) = rows.split_last() else {
        return rows;
    };
    let start = earlier
        .iter()
        .rposition(Proposal::is_terminal)
        .map_or(0, |index| index + 1);
    &rows[start..]
}

/// The latest row of a subject if it is still in flight
pub fn open_proposal(rows: &[Proposal]) -> Option<&Proposal> {
    rows.last().filter(|row| !row.is_terminal())
}

/// Actors whose approvals produced rows in `wave`
pub fn approvers(wave: &[Proposal]) -> impl Iterator<Item = Uuid> + '_ {
    wave.iter()
        .filter(|row| {
            row.approval_count > 0
                && matches!(row.state, ProposalState::Approved | ProposalState::Released)
        })
        .map(|row| row.actor)
}

/// Whether `actor` already approved within `wave`
pub fn has_approved(wave: &[Proposal], actor: Uuid) -> bool {
    approvers(wave).any(|approver| approver == actor)
}
