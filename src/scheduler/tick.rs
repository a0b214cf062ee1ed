//! The per-tick scheduling algorithm: budget allocation, near-set
//! selection, supersession, and capacity-gated admission.

use crate::host::HostKey;
use crate::request::{RequestClass, RequestState};

use super::context::{Launch, SchedulerContext};

impl SchedulerContext {
    /// Advance scheduling by one period: flush statistics, reallocate
    /// budgets from last tick's leftovers, promote deferred requests into
    /// any capacity that appeared since the last pass (a withdrawal or a
    /// config raise frees slots without a completion), then run a
    /// scheduling pass.
    pub(crate) fn tick_inner(&mut self) -> Vec<Launch> {
        if self.cfg.debug_statistics {
            self.statistics().emit();
        }
        self.attempted_this_tick = 0;
        self.allocate_budgets();
        let mut launches = self.drain_deferred();
        launches.extend(self.schedule_pass());
        launches
    }

    /// Recompute per-(host, class) grants from the previous tick's unserved
    /// droppable requests, best priority first.
    fn allocate_budgets(&mut self) {
        if !self.cfg.prioritize || !self.cfg.throttle {
            self.leftovers.clear();
            return;
        }

        let mut leftovers: Vec<(f64, u64, HostKey, RequestClass)> = self
            .leftovers
            .iter()
            .filter_map(|id| self.requests.get(id))
            .filter(|req| req.state == RequestState::Pending)
            .map(|req| (req.priority, req.id.0, req.host.clone(), req.class))
            .collect();
        leftovers.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let hosts = self.hosts.lock().unwrap();
        self.budgets.allocate(
            leftovers.iter().map(|(_, _, host, class)| (host, *class)),
            &hosts,
            &self.cfg,
            self.active_global,
        );
        drop(hosts);
        self.leftovers.clear();
    }

    /// One scheduling pass over the heap. Also runs (without the budget
    /// reallocation) when a completion frees a slot mid-period.
    ///
    /// Pops the near set — the best entry plus everything within the
    /// nearness band of it — supersedes any active request left on the heap
    /// (it is strictly outranked), then admits near-set members that fit
    /// capacity and budget. Droppable members that don't fit become
    /// leftovers; non-droppable ones move to the deferred queue.
    pub(crate) fn schedule_pass(&mut self) -> Vec<Launch> {
        let mut launches = Vec::new();

        let best = match self.heap.peek() {
            Some(top) => top.key.priority,
            None => return launches,
        };

        let mut near = Vec::new();
        while let Some(top) = self.heap.peek() {
            // The best entry always qualifies; the band test alone would
            // exclude it for non-positive priorities.
            if !near.is_empty() && top.key.priority * self.cfg.nearness_factor > best {
                break;
            }
            match self.heap.pop() {
                Some(entry) => near.push(entry),
                None => break,
            }
        }

        let outranked: Vec<_> = self
            .heap
            .ids()
            .filter(|id| {
                self.requests
                    .get(id)
                    .map_or(false, |r| r.state == RequestState::Active)
            })
            .collect();
        for id in outranked {
            self.supersede(id);
        }

        for entry in near {
            let Some(req) = self.requests.get(&entry.id) else {
                // Entry for a vanished request; drop it.
                continue;
            };
            if req.state == RequestState::Active {
                self.heap.push(entry.key, entry.id);
                continue;
            }
            let host = req.host.clone();
            let class = req.class;
            let droppable = req.droppable;

            let capacity =
                self.hosts
                    .lock()
                    .unwrap()
                    .has_capacity(&host, &self.cfg, self.active_global);
            let within_budget = !self.cfg.prioritize
                || !self.cfg.throttle
                || self.budgets.allows(&host, class);

            if capacity && within_budget {
                if let Some(launch) = self.start(entry.id) {
                    self.budgets.consume(&host, class);
                    launches.push(launch);
                }
                self.heap.push(entry.key, entry.id);
            } else if droppable {
                // Completion passes rerun this; record each blocked request
                // once or its budget bucket gets counted twice.
                if !self.leftovers.contains(&entry.id) {
                    self.leftovers.push(entry.id);
                }
                self.heap.push(entry.key, entry.id);
            } else {
                self.deferred.push_back(entry.id);
            }
        }

        launches
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::config::SchedulerConfig;
    use crate::request::{Request, RequestClass, RequestId, RequestState, TransportFn};

    use super::super::context::{Launch, SchedulerContext};

    fn noop_invoker() -> TransportFn {
        Arc::new(|_task| Box::pin(async { Ok(Vec::new()) }))
    }

    fn counting_invoker(starts: Arc<AtomicUsize>) -> TransportFn {
        Arc::new(move |_task| {
            starts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Vec::new()) })
        })
    }

    fn cfg(max_total: usize, max_per_host: usize) -> SchedulerConfig {
        SchedulerConfig {
            maximum_requests: max_total,
            maximum_requests_per_host: max_per_host,
            ..SchedulerConfig::default()
        }
    }

    fn submit(
        ctx: &mut SchedulerContext,
        url: &str,
        priority: f64,
        droppable: bool,
    ) -> RequestId {
        let req = Request::new(url, noop_invoker())
            .priority(priority)
            .droppable(droppable);
        let (id, _handle) = ctx.submit_inner(req).expect("valid request");
        id
    }

    fn state(ctx: &SchedulerContext, id: RequestId) -> RequestState {
        ctx.requests.get(&id).expect("request tracked").state
    }

    fn ids(launches: &[Launch]) -> Vec<RequestId> {
        launches.iter().map(|l| l.id).collect()
    }

    #[test]
    fn per_host_ceiling_admits_two_then_third_after_completion() {
        // Three requests to one host with a per-host ceiling of two.
        let mut ctx = SchedulerContext::new(cfg(10, 2));
        let r1 = submit(&mut ctx, "https://h.example.com/1", 1.0, true);
        let r2 = submit(&mut ctx, "https://h.example.com/2", 2.0, true);
        let r3 = submit(&mut ctx, "https://h.example.com/3", 3.0, true);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![r1, r2]);
        assert_eq!(state(&ctx, r1), RequestState::Active);
        assert_eq!(state(&ctx, r2), RequestState::Active);
        assert_eq!(state(&ctx, r3), RequestState::Pending);
        assert_eq!(ctx.leftovers, vec![r3]);

        let follow_ups = ctx.on_settled(r1, 0, Ok(Vec::new()));
        assert_eq!(ids(&follow_ups), vec![r3]);
        assert_eq!(state(&ctx, r3), RequestState::Active);
        assert!(!ctx.requests.contains_key(&r1), "settled request is gone");

        // The external tick that follows is a no-op for admission.
        let launches = ctx.tick_inner();
        assert!(launches.is_empty());
        assert_eq!(ctx.active_global, 2);
    }

    #[test]
    fn throttle_disabled_admits_everything() {
        let mut config = cfg(10, 6);
        config.throttle = false;
        let mut ctx = SchedulerContext::new(config);
        for i in 0..100 {
            submit(&mut ctx, &format!("https://h.example.com/{i}"), 1.0, true);
        }
        let launches = ctx.tick_inner();
        assert_eq!(launches.len(), 100);
        assert_eq!(ctx.active_global, 100);
    }

    #[test]
    fn missing_invoker_is_rejected_and_heap_untouched() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        let mut req = Request::new("https://h.example.com/x", noop_invoker());
        req.invoker = None;
        let err = ctx.submit_inner(req).unwrap_err();
        assert!(matches!(err, crate::request::InvalidRequest::MissingInvoker));
        assert_eq!(ctx.heap.len(), 0);
        assert!(ctx.requests.is_empty());
    }

    #[test]
    fn missing_url_and_bad_priority_are_rejected() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        let err = ctx
            .submit_inner(Request::new("", noop_invoker()))
            .unwrap_err();
        assert!(matches!(err, crate::request::InvalidRequest::MissingUrl));

        let err = ctx
            .submit_inner(Request::new("https://h.example.com/x", noop_invoker()).priority(f64::NAN))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::request::InvalidRequest::NonFinitePriority(_)
        ));

        let err = ctx
            .submit_inner(Request::new("nonsense", noop_invoker()))
            .unwrap_err();
        assert!(matches!(err, crate::request::InvalidRequest::Host(_)));
        assert_eq!(ctx.heap.len(), 0);
    }

    #[test]
    fn best_priority_request_is_admitted_within_one_tick() {
        let mut ctx = SchedulerContext::new(cfg(1, 1));
        submit(&mut ctx, "https://h.example.com/far", 500.0, true);
        let near = submit(&mut ctx, "https://h.example.com/near", 1.0, true);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![near]);
        assert_eq!(state(&ctx, near), RequestState::Active);
    }

    #[test]
    fn near_set_spans_the_tolerance_band() {
        // With nearness_factor 0.1, everything within 10x of the best
        // priority competes; priority 20 stays out.
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        let p1 = submit(&mut ctx, "https://h.example.com/1", 1.0, true);
        let p9 = submit(&mut ctx, "https://h.example.com/9", 9.0, true);
        let p20 = submit(&mut ctx, "https://h.example.com/20", 20.0, true);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![p1, p9]);
        assert_eq!(state(&ctx, p20), RequestState::Pending);
        assert!(ctx.heap.contains(p20));
    }

    #[test]
    fn equal_priorities_admit_in_submit_order() {
        let mut ctx = SchedulerContext::new(cfg(2, 2));
        let a = submit(&mut ctx, "https://h.example.com/a", 5.0, true);
        let b = submit(&mut ctx, "https://h.example.com/b", 5.0, true);
        let _c = submit(&mut ctx, "https://h.example.com/c", 5.0, true);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![a, b]);
    }

    #[test]
    fn outranked_active_request_is_superseded_once_and_not_settled() {
        let mut ctx = SchedulerContext::new(cfg(1, 1));
        let starts = Arc::new(AtomicUsize::new(0));
        let req = Request::new("https://h.example.com/far", counting_invoker(Arc::clone(&starts)))
            .priority(100.0);
        let (far, mut far_handle) = ctx.submit_inner(req).unwrap();

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![far]);
        assert_eq!(starts.load(Ordering::SeqCst), 0, "invoker runs in the shell, not here");
        let far_token = launches[0].cancel.clone();

        // A strictly nearer request arrives; the far one is outranked
        // (100 * 0.1 > 1) and must give up its slot.
        let near = submit(&mut ctx, "https://h.example.com/near", 1.0, true);
        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![near]);

        assert!(far_token.is_cancelled(), "transport abort requested");
        assert_eq!(state(&ctx, far), RequestState::Pending);
        assert!(ctx.heap.contains(far), "superseded request re-enters the heap");
        assert!(
            far_handle.try_outcome().is_err(),
            "superseded handle must not settle"
        );

        // A settle from the aborted attempt arrives late: stale, ignored.
        let follow_ups = ctx.on_settled(far, 0, Ok(Vec::new()));
        assert!(follow_ups.is_empty());
        assert_eq!(state(&ctx, far), RequestState::Pending);
        assert!(far_handle.try_outcome().is_err());
    }

    #[test]
    fn leftover_request_restarts_on_completion_pass() {
        let mut ctx = SchedulerContext::new(cfg(1, 1));
        let far = submit(&mut ctx, "https://h.example.com/far", 8.0, true);
        let near = submit(&mut ctx, "https://h.example.com/near", 1.0, true);

        // near wins the slot; far is within the band (8 * 0.1 <= 1) so it
        // is a leftover, not superseded.
        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![near]);
        assert_eq!(ctx.leftovers, vec![far]);

        // near completes; far restarts on the completion pass.
        let follow_ups = ctx.on_settled(near, 0, Ok(Vec::new()));
        assert_eq!(ids(&follow_ups), vec![far]);
        assert_eq!(follow_ups[0].generation, 0);
        assert_eq!(state(&ctx, far), RequestState::Active);
    }

    #[test]
    fn non_droppable_requests_defer_and_promote_fifo() {
        let mut ctx = SchedulerContext::new(cfg(10, 1));
        let active = submit(&mut ctx, "https://h.example.com/a", 1.0, true);
        let n1 = submit(&mut ctx, "https://h.example.com/n1", 5.0, false);
        let n2 = submit(&mut ctx, "https://h.example.com/n2", 6.0, false);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![active]);
        assert_eq!(ctx.deferred, [n1, n2]);
        assert!(!ctx.heap.contains(n1), "deferred requests leave the heap");

        // Slot frees: the deferred head goes first, ahead of heap admission.
        let follow_ups = ctx.on_settled(active, 0, Ok(Vec::new()));
        assert_eq!(ids(&follow_ups), vec![n1]);
        assert_eq!(ctx.deferred, [n2]);

        let follow_ups = ctx.on_settled(n1, 0, Ok(Vec::new()));
        assert_eq!(ids(&follow_ups), vec![n2]);
        assert!(ctx.deferred.is_empty());
    }

    #[test]
    fn deferred_head_blocks_until_its_host_has_capacity() {
        let mut ctx = SchedulerContext::new(cfg(2, 1));
        let a1 = submit(&mut ctx, "https://a.example.com/1", 1.0, true);
        let b1 = submit(&mut ctx, "https://b.example.com/1", 1.5, true);
        let a2 = submit(&mut ctx, "https://a.example.com/2", 2.0, false);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![a1, b1]);
        assert_eq!(ctx.deferred, [a2]);

        // b finishing frees a global slot, but a2's host is still full:
        // strict FIFO means it keeps waiting.
        let follow_ups = ctx.on_settled(b1, 0, Ok(Vec::new()));
        assert!(follow_ups.is_empty());
        assert_eq!(ctx.deferred, [a2]);

        let follow_ups = ctx.on_settled(a1, 0, Ok(Vec::new()));
        assert_eq!(ids(&follow_ups), vec![a2]);
    }

    #[test]
    fn failed_transport_settles_with_the_error() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        let req = Request::new("https://h.example.com/x", noop_invoker()).priority(1.0);
        let (id, mut handle) = ctx.submit_inner(req).unwrap();
        ctx.tick_inner();

        ctx.on_settled(id, 0, Err(anyhow::anyhow!("boom")));
        let outcome = handle.try_outcome().expect("handle settled");
        assert!(outcome.is_err());
        assert_eq!(ctx.active_global, 0);
    }

    #[test]
    fn withdraw_is_idempotent_and_never_settles() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        let req = Request::new("https://h.example.com/x", noop_invoker()).priority(1.0);
        let (id, mut handle) = ctx.submit_inner(req).unwrap();

        ctx.withdraw(id);
        ctx.withdraw(id);
        assert!(ctx.tick_inner().is_empty());
        assert!(matches!(
            handle.try_outcome(),
            Err(tokio::sync::oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn withdraw_active_request_aborts_and_frees_the_slot() {
        let mut ctx = SchedulerContext::new(cfg(1, 1));
        let id = submit(&mut ctx, "https://h.example.com/x", 1.0, true);
        let launches = ctx.tick_inner();
        let token = launches[0].cancel.clone();

        ctx.withdraw(id);
        assert!(token.is_cancelled());
        assert_eq!(ctx.active_global, 0);

        // The freed slot is usable immediately.
        let next = submit(&mut ctx, "https://h.example.com/y", 1.0, true);
        assert_eq!(ids(&ctx.tick_inner()), vec![next]);
    }

    #[test]
    fn deferred_request_starts_when_withdraw_frees_the_slot() {
        let mut ctx = SchedulerContext::new(cfg(10, 1));
        let a = submit(&mut ctx, "https://h.example.com/a", 1.0, true);
        let b = submit(&mut ctx, "https://h.example.com/b", 2.0, false);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![a]);
        assert_eq!(ctx.deferred, [b]);

        // Withdrawing the active request frees its slot without any
        // completion; the deferred head takes it right away.
        let follow_ups = ctx.withdraw(a);
        assert_eq!(ids(&follow_ups), vec![b]);
        assert_eq!(state(&ctx, b), RequestState::Active);
        assert!(ctx.deferred.is_empty());
        assert_eq!(ctx.active_global, 1);
    }

    #[test]
    fn deferred_request_promotes_on_tick_once_capacity_exists() {
        let mut ctx = SchedulerContext::new(cfg(10, 1));
        submit(&mut ctx, "https://h.example.com/a", 1.0, true);
        let b = submit(&mut ctx, "https://h.example.com/b", 2.0, false);
        ctx.tick_inner();
        assert_eq!(ctx.deferred, [b]);

        // A config raise creates capacity between passes; the next tick
        // must promote the deferred head, not leave it stranded.
        ctx.cfg.maximum_requests_per_host = 2;
        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![b]);
        assert_eq!(state(&ctx, b), RequestState::Active);
        assert!(ctx.deferred.is_empty());
    }

    #[test]
    fn blocked_leftover_is_recorded_once_across_passes() {
        let mut ctx = SchedulerContext::new(cfg(10, 1));
        let x1 = submit(&mut ctx, "https://x.example.com/1", 1.0, true);
        let x2 = submit(&mut ctx, "https://x.example.com/2", 2.0, true);
        let y1 = submit(&mut ctx, "https://y.example.com/1", 3.0, true);

        let launches = ctx.tick_inner();
        assert_eq!(ids(&launches), vec![x1, y1]);
        assert_eq!(ctx.leftovers, vec![x2]);

        // y settling reruns the scheduling pass; x2 is still blocked on its
        // host but must not earn a second leftover entry, which would
        // double-count its bucket in the next budget allocation.
        let follow_ups = ctx.on_settled(y1, 0, Ok(Vec::new()));
        assert!(follow_ups.is_empty());
        assert_eq!(ctx.leftovers, vec![x2]);
    }

    #[test]
    fn reset_does_not_recycle_request_ids() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        let old = submit(&mut ctx, "https://h.example.com/old", 1.0, true);
        ctx.tick_inner();
        ctx.reset();

        let req = Request::new("https://h.example.com/new", noop_invoker()).priority(1.0);
        let (new, mut handle) = ctx.submit_inner(req).unwrap();
        assert_ne!(new, old);

        // A settle racing in from the pre-reset attempt finds nothing to
        // match and cannot touch the new request's handle.
        let follow_ups = ctx.on_settled(old, 0, Ok(Vec::new()));
        assert!(follow_ups.is_empty());
        assert_eq!(state(&ctx, new), RequestState::Pending);
        assert!(handle.try_outcome().is_err(), "new handle stays unsettled");
    }

    #[test]
    fn ceilings_hold_across_many_hosts_and_ticks() {
        let config = cfg(5, 2);
        let mut ctx = SchedulerContext::new(config.clone());
        for i in 0..20 {
            let host = ["a", "b", "c"][i % 3];
            submit(
                &mut ctx,
                &format!("https://{host}.example.com/{i}"),
                1.0 + (i % 7) as f64,
                true,
            );
        }
        for _ in 0..4 {
            ctx.tick_inner();
            let stats = ctx.statistics();
            assert!(stats.active_global <= config.maximum_requests);
            for (_, count) in &stats.active_by_host {
                assert!(*count <= config.maximum_requests_per_host);
            }
        }
    }

    #[test]
    fn budget_allocation_favors_starved_buckets() {
        // One host, one slot. Class 1 holds the slot; class 2 leftovers
        // from tick 1 earn the grant for tick 2.
        let mut ctx = SchedulerContext::new(cfg(10, 1));
        let first = submit(&mut ctx, "https://h.example.com/1", 1.0, true);
        let req = Request::new("https://h.example.com/2", noop_invoker())
            .priority(2.0)
            .class(RequestClass(2));
        let (second, _h) = ctx.submit_inner(req).unwrap();

        ctx.tick_inner();
        assert_eq!(state(&ctx, first), RequestState::Active);
        assert_eq!(ctx.leftovers, vec![second]);

        // Next tick: the leftover seeds a grant for (host, class 2).
        ctx.tick_inner();
        let host = ctx.requests.get(&second).unwrap().host.clone();
        let grant = ctx.budgets.get(&host, RequestClass(2)).unwrap();
        assert_eq!(grant.total, 0, "host had no remaining slots to grant");

        // After the active request settles, the next allocation can grant.
        ctx.on_settled(first, 0, Ok(Vec::new()));
        assert_eq!(state(&ctx, second), RequestState::Active);
    }

    #[test]
    fn attempted_counter_resets_each_tick() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        submit(&mut ctx, "https://h.example.com/1", 1.0, true);
        submit(&mut ctx, "https://h.example.com/2", 1.0, true);
        assert_eq!(ctx.statistics().attempted_this_tick, 2);
        ctx.tick_inner();
        assert_eq!(ctx.statistics().attempted_this_tick, 0);
    }

    #[test]
    fn reset_clears_everything_and_aborts_transports() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        submit(&mut ctx, "https://h.example.com/1", 1.0, true);
        submit(&mut ctx, "https://h.example.com/2", 5.0, false);
        let launches = ctx.tick_inner();
        let token = launches[0].cancel.clone();

        ctx.reset();
        assert!(token.is_cancelled());
        assert!(ctx.requests.is_empty());
        assert_eq!(ctx.heap.len(), 0);
        assert!(ctx.deferred.is_empty());
        let stats = ctx.statistics();
        assert_eq!(stats.active_global, 0);
        assert!(stats.active_by_host.is_empty());
    }

    #[test]
    fn empty_tick_is_a_no_op() {
        let mut ctx = SchedulerContext::new(cfg(10, 6));
        assert!(ctx.tick_inner().is_empty());
    }
}
