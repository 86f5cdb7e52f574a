//! Target state transitions
//!
//! The per-target state machine behind every membership change. Transitions
//! follow a strict DAG:
//!
//! ```text
//! NEW ─► UP ─► UPIN ─► DRAIN ─► DOWNOUT
//! UPIN ─► DOWN ─► DOWNOUT
//! DOWN ─► UP (reintegrate)        DRAIN ─► UPIN (revert)
//! UP ─► NEW | DOWN | DOWNOUT (revert, by co_fseq / DOWN2UP)
//! ```
//!
//! A batch is atomic: the whole update is applied to a scratch copy and
//! committed only if every transition is legal. The map version advances at
//! most once per batch; `co_fseq`, `co_in_ver` and `co_out_ver` are stamped
//! with the new version on the transitions that set them.

use crate::component::Component;
use crate::map::PoolMap;
use rimio_common::{ComponentFlags, ComponentStatus, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Operation applied to a batch of targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStateOp {
    /// Mark failed: UP/UPIN/DRAIN → DOWN
    Exclude,
    /// Start a graceful exclude: UPIN → DRAIN
    Drain,
    /// Start reintegration: DOWN/DOWNOUT → UP
    Reint,
    /// Activate newly added components: NEW → UP
    Extend,
    /// Finish integration: UP → UPIN
    AddIn,
    /// Finish exclusion: DOWN/DRAIN → DOWNOUT
    ExcludeOut,
    /// Rebuild completed: DOWN/DRAIN → DOWNOUT, UP → UPIN
    FinishRebuild,
    /// Rebuild abandoned: undo the in-flight transition
    RevertRebuild,
}

/// Apply `op` to one target, stamping sequence fields with `next_ver`
///
/// Returns whether the target changed; errors on transitions the DAG
/// forbids.
fn update_one_tgt(tgt: &mut Component, op: TargetStateOp, next_ver: u32) -> Result<bool> {
    use ComponentStatus as St;

    let changed = match op {
        TargetStateOp::Exclude => match tgt.co_status {
            // Nothing to do, already excluded.
            St::Down | St::DownOut => false,
            St::Up | St::UpIn | St::Drain => {
                tgt.co_status = St::Down;
                tgt.co_fseq = next_ver;
                debug!(tgt = tgt.co_id, fseq = next_ver, "target is down");
                true
            }
            St::New => {
                return Err(Error::not_supported(format!(
                    "cannot exclude new target {}",
                    tgt.co_id
                )));
            }
        },
        TargetStateOp::Drain => match tgt.co_status {
            // Nothing to do, already excluded or draining.
            St::Down | St::Drain | St::DownOut => false,
            St::New => {
                return Err(Error::busy(format!("cannot drain new target {}", tgt.co_id)));
            }
            St::Up => {
                return Err(Error::busy(format!(
                    "cannot drain reintegrating target {}",
                    tgt.co_id
                )));
            }
            St::UpIn => {
                tgt.co_status = St::Drain;
                tgt.co_fseq = next_ver;
                debug!(tgt = tgt.co_id, fseq = next_ver, "target is draining");
                true
            }
        },
        TargetStateOp::Reint => match tgt.co_status {
            St::New => {
                return Err(Error::busy(format!(
                    "cannot reintegrate new target {}",
                    tgt.co_id
                )));
            }
            St::Drain => {
                return Err(Error::busy(format!(
                    "cannot reintegrate draining target {}",
                    tgt.co_id
                )));
            }
            // Nothing to do, already in.
            St::Up | St::UpIn => false,
            St::Down | St::DownOut => {
                if tgt.co_status == St::Down {
                    tgt.co_flags = tgt.co_flags.insert(ComponentFlags::DOWN_TO_UP);
                }
                tgt.co_status = St::Up;
                tgt.co_in_ver = next_ver;
                debug!(tgt = tgt.co_id, in_ver = next_ver, "target starts reintegration");
                true
            }
        },
        TargetStateOp::Extend => match tgt.co_status {
            St::New => {
                tgt.co_status = St::Up;
                tgt.co_in_ver = next_ver;
                debug!(tgt = tgt.co_id, in_ver = next_ver, "target is being extended");
                true
            }
            // Nothing to do, already added.
            St::Up | St::UpIn => false,
            St::Down | St::Drain | St::DownOut => {
                return Err(Error::busy(format!(
                    "cannot extend excluded target {}",
                    tgt.co_id
                )));
            }
        },
        TargetStateOp::AddIn => match tgt.co_status {
            St::Up => {
                up_to_upin(tgt, next_ver);
                true
            }
            _ => false,
        },
        TargetStateOp::ExcludeOut => match tgt.co_status {
            St::Down | St::Drain => {
                down_drain_to_downout(tgt, next_ver);
                true
            }
            _ => false,
        },
        TargetStateOp::FinishRebuild => match tgt.co_status {
            St::Down | St::Drain => {
                down_drain_to_downout(tgt, next_ver);
                true
            }
            St::Up => {
                up_to_upin(tgt, next_ver);
                true
            }
            _ => false,
        },
        TargetStateOp::RevertRebuild => match tgt.co_status {
            // DOWN can not be reverted.
            St::UpIn | St::DownOut | St::Down | St::New => false,
            St::Drain => {
                tgt.co_status = St::UpIn;
                tgt.co_fseq = 0;
                debug!(tgt = tgt.co_id, "drain reverted");
                true
            }
            St::Up => {
                if tgt.co_fseq == 1 {
                    tgt.co_status = St::New;
                    tgt.co_in_ver = 0;
                } else {
                    if tgt.co_flags.contains(ComponentFlags::DOWN_TO_UP) {
                        tgt.co_status = St::Down;
                    } else {
                        tgt.co_status = St::DownOut;
                    }
                    tgt.co_out_ver = next_ver;
                }
                debug!(tgt = tgt.co_id, status = %tgt.co_status, "target reverted");
                true
            }
        },
    };
    Ok(changed)
}

fn up_to_upin(tgt: &mut Component, next_ver: u32) {
    tgt.co_flags = ComponentFlags::NONE;
    tgt.co_in_ver = next_ver;
    tgt.co_status = ComponentStatus::UpIn;
    debug!(tgt = tgt.co_id, in_ver = next_ver, "target is reintegrated");
}

fn down_drain_to_downout(tgt: &mut Component, next_ver: u32) {
    if tgt.co_status == ComponentStatus::Down {
        tgt.co_flags = ComponentFlags::DOWN_TO_OUT;
    }
    tgt.co_status = ComponentStatus::DownOut;
    tgt.co_out_ver = next_ver;
    debug!(tgt = tgt.co_id, out_ver = next_ver, "target is excluded");
}

impl PoolMap {
    /// Atomically apply `op` to the targets identified by `ids`
    ///
    /// Returns the new map version, or 0 when every transition was a no-op
    /// (nothing for the upper layers to rebuild, drain or reintegrate).
    /// With `exclude_rank` set, rank-level domain state is updated
    /// alongside the targets; without it a target change never touches the
    /// rank status.
    ///
    /// On error the map is unchanged; the error names the offending target
    /// so callers can drop it and retry the rest.
    pub fn target_state_update(
        &mut self,
        ids: &[u32],
        op: TargetStateOp,
        exclude_rank: bool,
    ) -> Result<u32> {
        if ids.is_empty() {
            return Ok(0);
        }

        let next_ver = self.version() + 1;
        let mut scratch = self.clone();
        let mut changed = false;

        for &id in ids {
            let Some((tidx, _)) = scratch.find_target(id) else {
                warn!(tgt = id, "state update for nonexistent target");
                return Err(Error::not_found(format!("target {id}")));
            };
            let didx = scratch.target_parent(tidx) as usize;

            let tgt_changed = update_one_tgt(scratch.target_mut(tidx), op, next_ver)?;
            changed |= tgt_changed;

            // If the target did not change the rank status does not need to
            // change either, unless the caller opted into rank eviction.
            if !tgt_changed && !exclude_rank {
                continue;
            }
            changed |= scratch.update_one_dom(didx, op, exclude_rank, next_ver);
        }

        if !changed {
            return Ok(0);
        }
        scratch.set_version(next_ver);
        *self = scratch;
        info!(version = next_ver, ?op, targets = ids.len(), "pool map version advanced");
        Ok(next_ver)
    }

    /// Update the rank-level domain owning a changed target
    fn update_one_dom(
        &mut self,
        didx: usize,
        op: TargetStateOp,
        exclude_rank: bool,
        next_ver: u32,
    ) -> bool {
        use ComponentStatus as St;

        let status = self.domain_mut(didx).comp_mut().co_status;
        match op {
            TargetStateOp::Reint => match status {
                St::Down | St::DownOut => {
                    self.set_dom_status(didx, St::Up, next_ver);
                    true
                }
                _ => false,
            },
            TargetStateOp::Extend => match status {
                St::New => {
                    self.set_dom_status(didx, St::Up, next_ver);
                    true
                }
                _ => false,
            },
            TargetStateOp::Exclude => {
                let down_mask = St::Down as u8 | St::DownOut as u8;
                if exclude_rank
                    && !status.matches(down_mask)
                    && self.dom_targets_all_match(didx, down_mask)
                {
                    self.set_dom_status(didx, St::Down, next_ver);
                    self.copy_fseq_down(didx, next_ver);
                    true
                } else {
                    false
                }
            }
            TargetStateOp::FinishRebuild => match status {
                St::Up => {
                    self.set_dom_status(didx, St::UpIn, next_ver);
                    true
                }
                St::Down if exclude_rank => {
                    self.set_dom_status(didx, St::DownOut, next_ver);
                    true
                }
                _ => false,
            },
            TargetStateOp::RevertRebuild => match status {
                St::Up => {
                    let comp = *self.domain_mut(didx).comp_mut();
                    let revert_to = if comp.co_fseq == 1 {
                        St::New
                    } else if comp.co_flags.contains(ComponentFlags::DOWN_TO_UP) {
                        St::Down
                    } else {
                        St::DownOut
                    };
                    self.set_dom_status(didx, revert_to, next_ver);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Whether every target under the domain matches the status mask
    fn dom_targets_all_match(&mut self, didx: usize, mask: u8) -> bool {
        let targets = self.domain_mut(didx).targets_snapshot();
        targets
            .iter()
            .all(|&tidx| self.target_mut(tidx as usize).co_status.matches(mask))
    }

    fn set_dom_status(&mut self, didx: usize, status: ComponentStatus, next_ver: u32) {
        let comp = self.domain_mut(didx).comp_mut();
        comp.co_status = status;
        match status {
            ComponentStatus::Up | ComponentStatus::UpIn => comp.co_in_ver = next_ver,
            ComponentStatus::Down => comp.co_fseq = next_ver,
            ComponentStatus::DownOut => comp.co_out_ver = next_ver,
            ComponentStatus::New | ComponentStatus::Drain => {}
        }
        debug!(domain = comp.co_id, status = %status, "rank domain status changed");
    }

    /// Copy the domain failure sequence down to child targets that went
    /// down without one
    fn copy_fseq_down(&mut self, didx: usize, fseq: u32) {
        let targets = self.domain_mut(didx).targets_snapshot();
        for tidx in targets {
            let tgt = self.target_mut(tidx as usize);
            if tgt.co_status == ComponentStatus::Down && tgt.co_fseq == 0 {
                tgt.co_fseq = fseq;
            }
        }
    }
}
