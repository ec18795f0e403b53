use std::collections::HashMap;

use crate::conn::{ConnId, Queued};
use crate::{TerminateReason, Teardown};


/// Returns `N` distinct connection handles.
pub(crate) fn ids<const N: usize>() -> [ConnId; N] {
    // Non-sequential indices and generations catch accidental index math
    #[allow(clippy::cast_possible_truncation)]
    std::array::from_fn(|i| ConnId::new(3 * i as u32 + 1, i as u32 % 2))
}

/// Queue markers for connections that live outside of a `ConnTable`.
#[derive(Debug, Default)]
pub(crate) struct FlagMap(HashMap<ConnId, Queued>);

impl FlagMap {
    pub(crate) fn get(&mut self, id: ConnId) -> &mut Queued {
        self.0.entry(id).or_default()
    }
}


/// A teardown hook remembering every terminated connection.
#[derive(Debug)]
pub(crate) struct Recorder<C> {
    reasons: Vec<(ConnId, TerminateReason)>,
    data: Vec<C>,
}

impl<C> Default for Recorder<C> {
    fn default() -> Self {
        Self { reasons: Vec::new(), data: Vec::new() }
    }
}

impl<C: Clone> Recorder<C> {
    pub(crate) fn reasons(&self) -> &[(ConnId, TerminateReason)] {
        &self.reasons
    }

    pub(crate) fn data(&self) -> Vec<C> {
        self.data.clone()
    }
}

impl<C> Teardown<C> for Recorder<C> {
    fn terminate(&mut self, id: ConnId, data: C, reason: TerminateReason) {
        self.reasons.push((id, reason));
        self.data.push(data);
    }
}
