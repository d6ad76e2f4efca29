//! Configuration matcher.
//!
//! Picks the supported capture configuration closest to what the caller
//! asked for. The ordering rules are deliberate and must stay stable:
//!
//! 1. A list with a single real entry returns it.
//! 2. An exact structural match wins.
//! 3. Candidates are grouped by pixel format. The group whose format equals
//!    the target's is tried first, then the groups of the fallback targets
//!    in the order given. Candidates in no group are ignored.
//! 4. Inside a group, relative to that group's reference resolution:
//!    equal resolution (first found) > closest larger resolution (smallest
//!    width, then smallest height, then highest fps) > anything else (first
//!    found, i.e. upstream order).

use crate::assert_invariant;
use crate::errors::CameraError;
use crate::invariant_ppt::Invariant;
use crate::types::{DeviceConfig, DeviceConfigList, FourCc};
use std::cmp::Reverse;

/// Candidates of one pixel format, split by resolution relative to the
/// group's reference target.
#[derive(Debug, Default)]
struct FormatGroup<'a> {
    equal: Vec<&'a DeviceConfig>,
    larger: Vec<&'a DeviceConfig>,
    smaller: Vec<&'a DeviceConfig>,
}

impl<'a> FormatGroup<'a> {
    fn push(&mut self, reference: &DeviceConfig, candidate: &'a DeviceConfig) {
        if candidate.same_resolution(reference) {
            self.equal.push(candidate);
        } else if candidate.width > reference.width && candidate.height > reference.height {
            self.larger.push(candidate);
        } else {
            self.smaller.push(candidate);
        }
    }

    fn pick(&self) -> Option<DeviceConfig> {
        // Frame rate is ignored on an equal resolution: first found wins.
        if let Some(first) = self.equal.first() {
            return Some(**first);
        }
        if let Some(closest) = self
            .larger
            .iter()
            .min_by_key(|c| (c.width, c.height, Reverse(c.fps)))
        {
            return Some(**closest);
        }
        self.smaller.first().map(|c| **c)
    }
}

/// Select the configuration from `available` that best matches `target`,
/// trying the formats of `fallbacks` in order when nothing of the target's
/// format is available.
pub fn select_best_match(
    available: &DeviceConfigList,
    target: &DeviceConfig,
    fallbacks: &[DeviceConfig],
) -> Result<DeviceConfig, CameraError> {
    let candidates: Vec<&DeviceConfig> = available.candidates().collect();

    if let [only] = candidates.as_slice() {
        return Ok(**only);
    }

    if let Some(exact) = candidates.iter().find(|c| ***c == *target) {
        return Ok(**exact);
    }

    let selected = best_in_format(&candidates, target.format, target)
        .or_else(|| {
            fallbacks.iter().find_map(|fallback| {
                let reference = reference_for(fallback.format, target, fallbacks);
                let found = best_in_format(&candidates, fallback.format, reference);
                if let Some(cfg) = &found {
                    log::debug!("Using fallback format {} for target {}: {}", fallback.format, target, cfg);
                }
                found
            })
        })
        .ok_or(CameraError::ConfigNotFound(*target))?;

    assert_invariant!(
        candidates.iter().any(|c| **c == selected),
        Invariant::SelectionIsCandidate,
        "matcher::select_best_match"
    );
    Ok(selected)
}

/// The resolution a format group is measured against: the target's own when
/// the formats agree, otherwise the last fallback declaring that format.
fn reference_for<'a>(
    format: FourCc,
    target: &'a DeviceConfig,
    fallbacks: &'a [DeviceConfig],
) -> &'a DeviceConfig {
    if format == target.format {
        return target;
    }
    fallbacks
        .iter()
        .rev()
        .find(|f| f.format == format)
        .unwrap_or(target)
}

fn best_in_format(
    candidates: &[&DeviceConfig],
    format: FourCc,
    reference: &DeviceConfig,
) -> Option<DeviceConfig> {
    let mut group = FormatGroup::default();
    for &candidate in candidates.iter().filter(|c| c.format == format) {
        group.push(reference, candidate);
    }
    group.pick()
}
