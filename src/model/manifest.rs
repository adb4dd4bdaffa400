//! Model of conditional manifest publication for one shard.
//!
//! Two writers hold leadership of the same shard at different epochs (the
//! old leader has not yet noticed it was replaced). Each writer stages
//! segments, reads the latest manifest as its base and publishes
//! `base + 1` with a create-only put. Acknowledgements may be lost, in
//! which case the writer retries the same put.
//!
//! Invariants:
//! - VERSIONS_EPOCH_MONOTONIC: a published version never carries a lower
//!   leader epoch than its predecessor
//! - ACKED_DURABLE: every acknowledged segment is in the latest manifest
//! - SEGMENTS_UNIQUE: each segment is referenced by at most one publish

use stateright::{Model, Property};
use std::collections::BTreeSet;

pub type WriterId = u8;
pub type SegmentId = u8;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Published {
    pub epoch: u64,
    pub writer: WriterId,
    /// Cumulative segment set of this version
    pub segments: BTreeSet<SegmentId>,
    /// Segment added by this version
    pub added: SegmentId,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WriterState {
    pub epoch: u64,
    pub staged: u8,
    pub pending: Option<SegmentId>,
    /// Version the pending publish is based on
    pub base: Option<usize>,
    pub acked: BTreeSet<SegmentId>,
    pub fenced: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManifestState {
    /// `log[i]` is version `i + 1`
    pub log: Vec<Published>,
    pub writers: Vec<WriterState>,
    pub lost_acks: u8,
}

impl ManifestState {
    fn base_of(&self, version: usize) -> (u64, BTreeSet<SegmentId>) {
        match version {
            0 => (0, BTreeSet::new()),
            v => (self.log[v - 1].epoch, self.log[v - 1].segments.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ManifestAction {
    Stage { writer: WriterId },
    ReadBase { writer: WriterId },
    Publish { writer: WriterId, lose_ack: bool },
}

pub struct ManifestModel {
    pub epochs: Vec<u64>,
    pub segments_per_writer: u8,
    pub lost_acks_max: u8,
}

impl Default for ManifestModel {
    fn default() -> Self {
        ManifestModel {
            epochs: vec![1, 2],
            segments_per_writer: 2,
            lost_acks_max: 1,
        }
    }
}

impl Model for ManifestModel {
    type State = ManifestState;
    type Action = ManifestAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![ManifestState {
            log: Vec::new(),
            writers: self
                .epochs
                .iter()
                .map(|&epoch| WriterState {
                    epoch,
                    staged: 0,
                    pending: None,
                    base: None,
                    acked: BTreeSet::new(),
                    fenced: false,
                })
                .collect(),
            lost_acks: 0,
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (i, w) in state.writers.iter().enumerate() {
            let writer = i as WriterId;
            if w.fenced {
                continue;
            }
            match (w.pending, w.base) {
                (None, _) if w.staged < self.segments_per_writer => {
                    actions.push(ManifestAction::Stage { writer });
                }
                (Some(_), None) => actions.push(ManifestAction::ReadBase { writer }),
                (Some(_), Some(_)) => {
                    actions.push(ManifestAction::Publish {
                        writer,
                        lose_ack: false,
                    });
                    if state.lost_acks < self.lost_acks_max {
                        actions.push(ManifestAction::Publish {
                            writer,
                            lose_ack: true,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            ManifestAction::Stage { writer } => {
                let w = &mut next.writers[writer as usize];
                w.pending = Some(writer * 10 + w.staged);
                w.staged += 1;
            }
            ManifestAction::ReadBase { writer } => {
                next.writers[writer as usize].base = Some(next.log.len());
            }
            ManifestAction::Publish { writer, lose_ack } => {
                let w = next.writers[writer as usize].clone();
                let (segment, base) = (w.pending?, w.base?);
                let (base_epoch, mut segments) = next.base_of(base);
                let w = &mut next.writers[writer as usize];

                if base_epoch > w.epoch {
                    // Superseded: buffer discarded, nothing acknowledged.
                    w.fenced = true;
                    w.pending = None;
                    w.base = None;
                    return Some(next);
                }
                segments.insert(segment);
                let candidate = Published {
                    epoch: w.epoch,
                    writer,
                    segments,
                    added: segment,
                };

                if next.log.len() == base {
                    next.log.push(candidate);
                    if lose_ack {
                        next.lost_acks += 1;
                    } else {
                        let w = &mut next.writers[writer as usize];
                        w.acked.insert(segment);
                        w.pending = None;
                        w.base = None;
                    }
                } else if next.log[base] == candidate {
                    // Retried put found its own earlier write.
                    let w = &mut next.writers[writer as usize];
                    w.acked.insert(segment);
                    w.pending = None;
                    w.base = None;
                } else {
                    next.writers[writer as usize].base = None;
                }
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("versions_epoch_monotonic", |_: &ManifestModel, state: &ManifestState| {
                state.log.windows(2).all(|w| w[0].epoch <= w[1].epoch)
            }),
            Property::always("acked_durable", |_: &ManifestModel, state: &ManifestState| {
                let latest = match state.log.last() {
                    Some(p) => &p.segments,
                    None => return state.writers.iter().all(|w| w.acked.is_empty()),
                };
                state
                    .writers
                    .iter()
                    .flat_map(|w| w.acked.iter())
                    .all(|s| latest.contains(s))
            }),
            Property::always("segments_unique", |_: &ManifestModel, state: &ManifestState| {
                let mut seen = BTreeSet::new();
                state.log.iter().all(|p| seen.insert(p.added))
            }),
            Property::sometimes("both_writers_publish", |_: &ManifestModel, state: &ManifestState| {
                state.log.iter().any(|p| p.writer == 0) && state.log.iter().any(|p| p.writer == 1)
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(model: &ManifestModel, state: &ManifestState, writer: WriterId, lose_ack: bool) -> ManifestState {
        model
            .next_state(state, ManifestAction::Publish { writer, lose_ack })
            .unwrap()
    }

    fn step(model: &ManifestModel, state: &ManifestState, action: ManifestAction) -> ManifestState {
        model.next_state(state, action).unwrap()
    }

    #[test]
    fn test_newer_epoch_fences_older_writer() {
        let model = ManifestModel::default();
        let mut s = model.init_states().remove(0);
        s = step(&model, &s, ManifestAction::Stage { writer: 0 });
        s = step(&model, &s, ManifestAction::Stage { writer: 1 });
        s = step(&model, &s, ManifestAction::ReadBase { writer: 0 });
        s = step(&model, &s, ManifestAction::ReadBase { writer: 1 });
        s = publish(&model, &s, 1, false);
        assert_eq!(s.log.len(), 1);

        // Writer 0 loses the race, re-reads and finds the newer epoch.
        s = publish(&model, &s, 0, false);
        assert_eq!(s.writers[0].base, None);
        s = step(&model, &s, ManifestAction::ReadBase { writer: 0 });
        s = publish(&model, &s, 0, false);
        assert!(s.writers[0].fenced);
        assert_eq!(s.log.len(), 1);
    }

    #[test]
    fn test_lost_ack_is_recovered_by_retry() {
        let model = ManifestModel::default();
        let mut s = model.init_states().remove(0);
        s = step(&model, &s, ManifestAction::Stage { writer: 0 });
        s = step(&model, &s, ManifestAction::ReadBase { writer: 0 });
        s = publish(&model, &s, 0, true);
        assert!(s.writers[0].acked.is_empty());

        s = publish(&model, &s, 0, false);
        assert_eq!(s.log.len(), 1);
        assert!(s.writers[0].acked.contains(&0));
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_manifest -- --ignored --nocapture
    fn stateright_manifest_model_check() {
        use stateright::Checker;

        let checker = ManifestModel::default().checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }
}
