//! Transform/rebase engine.
//!
//! When a batch of confirmed steps arrives from the authority, the client
//! holds a confirmed state plus a list of pending local steps computed on top
//! of it. Rebasing produces the new confirmed state, re-addresses the pending
//! steps so they apply after the remote ones, and yields the position mapping
//! needed to keep the local selection in place.

use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, UserId};
use doc_model::{Assoc, DocumentState, Mapping, Step};

/// A step as recorded by the authority, with its author.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedStep {
    pub step: Step,
    pub user_id: UserId,
    pub client_id: ClientId,
}

impl ConfirmedStep {
    pub fn new(step: Step, user_id: UserId, client_id: ClientId) -> Self {
        Self {
            step,
            user_id,
            client_id,
        }
    }
}

/// Outcome of a successful rebase.
#[derive(Debug, Clone)]
pub struct Rebased {
    /// Confirmed state with every incoming step applied.
    pub confirmed: DocumentState,
    /// Local view: `confirmed` plus the rebased pending steps.
    pub local: DocumentState,
    /// Pending steps that still have to be submitted.
    pub pending: Vec<Step>,
    /// Maps positions of the old local document into the new one.
    pub mapping: Mapping,
    /// How many incoming steps were this client's own echoes.
    pub confirmed_own: usize,
}

/// Reconciles incoming confirmed steps with pending local steps.
pub trait TransformEngine: Send + Sync {
    fn rebase(
        &self,
        confirmed: &DocumentState,
        pending: &[Step],
        incoming: &[ConfirmedStep],
        own_client: &ClientId,
    ) -> CollabResult<Rebased>;
}

/// Operational-transform engine built on step mapping.
///
/// Remote steps take priority at equal insertion points: a pending insertion
/// that meets a remote insertion at the same position moves after it on every
/// client, which is what makes concurrent edits converge.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtEngine;

impl OtEngine {
    pub fn new() -> Self {
        Self
    }
}

impl TransformEngine for OtEngine {
    fn rebase(
        &self,
        confirmed: &DocumentState,
        pending: &[Step],
        incoming: &[ConfirmedStep],
        own_client: &ClientId,
    ) -> CollabResult<Rebased> {
        let confirmed_own = incoming
            .iter()
            .take_while(|entry| &entry.client_id == own_client)
            .count();

        if confirmed_own > pending.len() {
            return Err(CollabError::IrreconcilableState(format!(
                "{confirmed_own} steps echoed back but only {} pending",
                pending.len()
            )));
        }
        for (echo, ours) in incoming[..confirmed_own].iter().zip(pending) {
            if &echo.step != ours {
                return Err(CollabError::IrreconcilableState(
                    "echoed step differs from the submitted one".to_string(),
                ));
            }
        }
        if let Some(stray) = incoming[confirmed_own..]
            .iter()
            .find(|entry| &entry.client_id == own_client)
        {
            return Err(CollabError::IrreconcilableState(format!(
                "own step from {} confirmed out of order",
                stray.client_id
            )));
        }

        let mut next_confirmed = confirmed.clone();
        for entry in incoming {
            next_confirmed
                .apply(&entry.step)
                .map_err(|e| CollabError::IrreconcilableState(format!("remote step: {e}")))?;
        }

        let mut remaining: Vec<Step> = pending[confirmed_own..].to_vec();
        let mut mapping = Mapping::new();
        for entry in &incoming[confirmed_own..] {
            let (remote, rebased) = transform_over(&entry.step, remaining);
            remaining = rebased;
            if let Some(remote) = remote {
                mapping.push(remote.get_map());
            }
        }

        let mut local = next_confirmed.clone();
        for step in &remaining {
            local
                .apply(step)
                .map_err(|e| CollabError::IrreconcilableState(format!("rebased step: {e}")))?;
        }

        Ok(Rebased {
            confirmed: next_confirmed,
            local,
            pending: remaining,
            mapping,
            confirmed_own,
        })
    }
}

/// Transform one remote step against the pending list.
///
/// Returns the remote step re-addressed past every pending step (`None` if
/// it became a no-op) together with the pending steps re-addressed past it.
fn transform_over(remote: &Step, pending: Vec<Step>) -> (Option<Step>, Vec<Step>) {
    let mut remote = Some(remote.clone());
    let mut rebased = Vec::with_capacity(pending.len());

    for step in pending {
        let Some(current) = remote.take() else {
            rebased.push(step);
            continue;
        };
        let remote_map = Mapping::from(current.get_map());
        let step_map = Mapping::from(step.get_map());

        remote = current.map(&step_map, Assoc::Before);
        if let Some(mapped) = step.map(&remote_map, Assoc::After) {
            rebased.push(mapped);
        }
    }

    (remote, rebased)
}
