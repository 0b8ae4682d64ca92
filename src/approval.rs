//! Report lifecycle: Pending -> Approved | Rejected.
//!
//! Approval is ordered within a station-month: a day may only be approved
//! once every earlier report of the month is approved. Rejection carries no
//! ordering constraint. Approved reports stay approved; they only become
//! writable through the correction path, which leaves `state` untouched.
use super::error::{EngineError, Result};
use super::report::{DailyReport, ReportState};
use super::witness::{Witness, WitnessKind};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    StationManager,
    ZoneManager,
    Administrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: &str, role: Role) -> Self {
        Self {
            user_id: user_id.to_string(),
            role,
        }
    }
}

/// Station managers edit pending days; approved days are only reachable
/// through a correction by a zone manager. Rejected days are frozen.
pub fn can_edit(role: Role, state: ReportState) -> bool {
    match state {
        ReportState::Pending => matches!(role, Role::StationManager | Role::Administrator),
        ReportState::Approved => matches!(role, Role::ZoneManager | Role::Administrator),
        ReportState::Rejected => false,
    }
}

pub fn can_decide(role: Role, decision: Decision) -> bool {
    match decision {
        Decision::Approve => true,
        Decision::Reject => matches!(role, Role::ZoneManager | Role::Administrator),
    }
}

/// Fails on the first editability rule `actor` breaks for `report`.
pub fn ensure_editable(actor: &Actor, report: &DailyReport) -> Result<()> {
    if !can_edit(actor.role, report.state) {
        return Err(EngineError::Unauthorized {
            role: actor.role,
            state: report.state,
            action: "edit",
        });
    }
    Ok(())
}

/// The earliest report before `report` in `month` that is not yet approved.
pub fn first_unapproved_before<'a>(
    month: &'a [DailyReport],
    report: &DailyReport,
) -> Option<&'a DailyReport> {
    month
        .iter()
        .filter(|r| r.date < report.date && r.station_id == report.station_id)
        .filter(|r| r.state != ReportState::Approved)
        .min_by_key(|r| r.date)
}

pub fn can_approve(month: &[DailyReport], report: &DailyReport) -> Result<()> {
    match first_unapproved_before(month, report) {
        Some(blocking) => Err(EngineError::SequenceViolation {
            date: report.date,
            blocking_date: blocking.date,
            blocking_state: blocking.state,
        }),
        None => Ok(()),
    }
}

/// Applies `decision` to a pending report in place. `month` holds the
/// station-month's live reports and is only consulted for approvals.
///
/// Nothing is mutated unless every check passes.
pub fn transition(
    report: &mut DailyReport,
    decision: Decision,
    actor: &Actor,
    month: &[DailyReport],
) -> Result<()> {
    if report.state != ReportState::Pending {
        return Err(EngineError::InvalidTransition {
            report_id: report.id.clone(),
            from: report.state,
            decision,
        });
    }
    if !can_decide(actor.role, decision) {
        return Err(EngineError::Unauthorized {
            role: actor.role,
            state: report.state,
            action: match decision {
                Decision::Approve => "approve",
                Decision::Reject => "reject",
            },
        });
    }

    let (state, kind) = match decision {
        Decision::Approve => {
            can_approve(month, report)?;
            (ReportState::Approved, WitnessKind::Approved)
        }
        Decision::Reject => (ReportState::Rejected, WitnessKind::Rejected),
    };

    report.state = state;
    report.insert_witness(Witness::new(&actor.user_id, kind));
    info!(
        report_id = %report.id,
        station = %report.station_id,
        date = %report.date,
        state = ?state,
        "Report decided"
    );
    Ok(())
}
