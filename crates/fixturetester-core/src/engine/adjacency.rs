//! Adjacency short-circuit detection
//!
//! While a channel is stimulated, each physically adjacent GPIO channel is
//! re-read and compared against its own pristine idle baseline; a value
//! that moved more than the configured delta means the pair is coupled.
//! Comparisons are recorded per sensing device because the two links have
//! different noise floors. Rail neighbors are noted, never compared.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::config::TestLimits;
use crate::engine::reader::{BatchError, BatchReader};
use crate::engine::session::{AdjacencyFault, NeighborComparison, RailNote};
use crate::profile::{DeviceProfile, DeviceRole, Neighbor, ReadingState};
use crate::store::ReadingStore;

/// Everything one stimulation pass produced.
#[derive(Debug, Default, Clone)]
pub struct ProbeOutcome {
    pub faults: Vec<AdjacencyFault>,
    pub notes: Vec<RailNote>,
    /// Every comparison made, for step-mode inspection
    pub comparisons: Vec<NeighborComparison>,
}

/// Probes the neighbors of stimulated channels across one session.
///
/// Remembers which pin pairs were already tested so the optional
/// skip-tested-pairs optimization can avoid re-probing a pair from its
/// other side. The optimization changes which diagnostic detail is
/// recorded, never the pass/fail outcome.
pub struct AdjacencyProbe<'a> {
    profile: &'a DeviceProfile,
    limits: &'a TestLimits,
    store: &'a ReadingStore,
    tested_pairs: HashSet<(u8, u8)>,
}

impl<'a> AdjacencyProbe<'a> {
    pub fn new(profile: &'a DeviceProfile, limits: &'a TestLimits, store: &'a ReadingStore) -> Self {
        Self {
            profile,
            limits,
            store,
            tested_pairs: HashSet::new(),
        }
    }

    /// Probe every neighbor of `stimulated`, which must currently be ON.
    ///
    /// `suppress_arduino` drops drain-side comparisons when the stimulated
    /// channel itself showed no discernible electrical change: an unloaded
    /// or dead channel produces spurious neighbor readings on that sensor.
    pub async fn probe_stimulated(
        &mut self,
        stimulated: u8,
        suppress_arduino: bool,
        reader: &BatchReader<'_>,
    ) -> Result<ProbeOutcome, BatchError> {
        let mut outcome = ProbeOutcome::default();

        for neighbor in self.profile.neighbors_of(stimulated) {
            match neighbor {
                Neighbor::None => {}
                Neighbor::SupplyRail | Neighbor::GroundRail => {
                    outcome.notes.push(RailNote {
                        stimulated,
                        rail: neighbor,
                    });
                }
                Neighbor::Gpio(other) => {
                    let pair = ordered_pair(stimulated, other);
                    let first_time = self.tested_pairs.insert(pair);
                    if self.limits.skip_tested_pairs && !first_time {
                        trace!(?pair, "pair already tested, skipping");
                        continue;
                    }

                    let (fresh_arduino, fresh_stm32) = reader.probe_neighbor(other).await?;

                    if !suppress_arduino {
                        self.compare(
                            DeviceRole::Arduino,
                            stimulated,
                            other,
                            fresh_arduino,
                            &mut outcome,
                        );
                    }
                    self.compare(DeviceRole::Stm32, stimulated, other, fresh_stm32, &mut outcome);
                }
            }
        }
        Ok(outcome)
    }

    /// Compare one device's fresh neighbor value against that neighbor's
    /// first idle baseline. Either value missing means no comparison.
    fn compare(
        &self,
        device: DeviceRole,
        stimulated: u8,
        neighbor: u8,
        fresh: Option<i32>,
        outcome: &mut ProbeOutcome,
    ) {
        let baseline = self.store.first(device, ReadingState::Idle, neighbor);
        let shorted = match (baseline, fresh) {
            (Some(base), Some(new)) => (new - base).abs() > self.limits.adjacency_delta,
            _ => false,
        };
        outcome.comparisons.push(NeighborComparison {
            device,
            neighbor,
            baseline,
            fresh,
            shorted,
        });
        if shorted {
            let fault = AdjacencyFault {
                device,
                stimulated,
                neighbor,
                baseline: baseline.unwrap_or_default(),
                fresh: fresh.unwrap_or_default(),
            };
            debug!(fault = %fault, "adjacent channel shifted off baseline");
            outcome.faults.push(fault);
        }
    }
}

fn ordered_pair(a: u8, b: u8) -> (u8, u8) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
