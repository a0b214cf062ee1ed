//! Per-(host, class) fair-share slot grants.
//!
//! Grants are recomputed once per tick from the previous tick's unserved
//! droppable requests ("leftovers"), sorted by priority: the classes most
//! starved last tick get slots reserved first, while each grant stays under
//! the host's remaining capacity and the global remaining capacity.

use std::collections::HashMap;

use crate::config::SchedulerConfig;
use crate::host::{HostKey, HostTable};
use crate::request::RequestClass;

/// Slots granted and consumed for one (host, class) bucket this tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct Budget {
    pub total: usize,
    pub used: usize,
}

#[derive(Debug, Default)]
pub(crate) struct BudgetTable {
    grants: HashMap<(HostKey, RequestClass), Budget>,
}

impl BudgetTable {
    /// Recompute grants from the leftovers of the previous tick.
    ///
    /// `leftovers` must already be sorted by (priority, seq). Each leftover
    /// bumps its bucket's grant while the grant stays under the host's
    /// remaining slots and global capacity remains.
    pub(crate) fn allocate<'a>(
        &mut self,
        leftovers: impl IntoIterator<Item = (&'a HostKey, RequestClass)>,
        hosts: &HostTable,
        cfg: &SchedulerConfig,
        active_global: usize,
    ) {
        for grant in self.grants.values_mut() {
            grant.total = 0;
            grant.used = 0;
        }

        let mut available = cfg.maximum_requests.saturating_sub(active_global);
        for (host, class) in leftovers {
            if available == 0 {
                break;
            }
            let remaining = hosts.remaining_slots(host, cfg);
            let grant = self.grants.entry((host.clone(), class)).or_default();
            if grant.total < remaining {
                grant.total += 1;
                available -= 1;
            }
        }
    }

    /// True iff admission for this bucket is not blocked by its grant.
    /// Buckets holding no grant this tick are governed by capacity alone;
    /// a bucket with a grant is capped at it.
    pub(crate) fn allows(&self, host: &HostKey, class: RequestClass) -> bool {
        match self.grants.get(&(host.clone(), class)) {
            Some(grant) if grant.total > 0 => grant.used < grant.total,
            _ => true,
        }
    }

    /// Count one admission against the bucket's grant, if it holds one.
    pub(crate) fn consume(&mut self, host: &HostKey, class: RequestClass) {
        if let Some(grant) = self.grants.get_mut(&(host.clone(), class)) {
            if grant.total > 0 {
                grant.used += 1;
            }
        }
    }

    pub(crate) fn get(&self, host: &HostKey, class: RequestClass) -> Option<Budget> {
        self.grants.get(&(host.clone(), class)).copied()
    }

    pub(crate) fn clear(&mut self) {
        self.grants.clear();
    }
}
