//! Stress tests for long listener chains, deep retry chains and crowded
//! issuer queues.

#[cfg(test)]
mod stress_tests {
    use crate::dispatch::Dispatcher;
    use crate::error::RetryError;
    use crate::promise::{all_settled, Promise};
    use crate::reactor::Reactor;
    use crate::retry::retry;
    use crate::scheduler::SchedulerKind;
    use crate::time_issuer::{TimeIssuer, TimeIssuerOptions};
    use anyhow::anyhow;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    // ==========================================================================
    // Dispatch
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_demand_chain_of_ten_thousand_listeners() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<u64>::new(&reactor, SchedulerKind::Demand);
        let max_in_flight = Rc::new(Cell::new(0));

        for _ in 0..10_000 {
            let reactor2 = reactor.clone();
            let max_in_flight = max_in_flight.clone();
            dispatcher.add_listener_fn("bulk", 0, move |event: &Rc<crate::Event<u64>>, _, _| {
                max_in_flight.set(max_in_flight.get().max(reactor2.pending_ticks()));
                *event.detail_mut() += 1;
                Ok(None)
            });
        }

        let (event, done) = dispatcher.dispatch("bulk", 0_u64);
        reactor.run().await;

        assert_eq!(*event.detail(), 10_000);
        assert_eq!(max_in_flight.get(), 0);
        assert!(done.try_take().unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_concurrent_dispatches_all_resolve() {
        for kind in [SchedulerKind::Eager, SchedulerKind::Demand] {
            let reactor = Reactor::new();
            let dispatcher = Dispatcher::<()>::new(&reactor, kind);
            let invoked = Rc::new(Cell::new(0_u32));

            for priority in 0..3 {
                let invoked = invoked.clone();
                let reactor2 = reactor.clone();
                dispatcher.add_listener_fn("job", priority, move |_: &Rc<crate::Event<()>>, _, _| {
                    invoked.set(invoked.get() + 1);
                    Ok(Some(reactor2.delay(Duration::from_millis(10))))
                });
            }

            let completions: Vec<Promise<()>> =
                (0..500).map(|_| dispatcher.dispatch("job", ()).1).collect();
            let all = all_settled(completions);
            reactor.run().await;

            let outcomes = all.try_take().unwrap().unwrap();
            assert_eq!(outcomes.len(), 500, "{kind} scheduler");
            assert!(outcomes.iter().all(|o| o.is_ok()), "{kind} scheduler");
            assert_eq!(invoked.get(), 1500, "{kind} scheduler");
        }
    }

    // ==========================================================================
    // Retry
    // ==========================================================================

    #[test]
    fn test_deep_retry_chain_keeps_every_layer() {
        let err = retry(
            |attempt| Ok(Promise::<()>::rejected(anyhow!("attempt {attempt}"))),
            200,
        )
        .try_take()
        .unwrap()
        .unwrap_err();

        let layers = err
            .chain()
            .filter(|layer| layer.downcast_ref::<RetryError>().is_some())
            .count();
        assert_eq!(layers, 201);
        assert_eq!(err.root_cause().to_string(), "attempt 200");
    }

    // ==========================================================================
    // Time Issuer
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_thousand_waiters_granted_in_order() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(
            &reactor,
            TimeIssuerOptions {
                actions_per_second: 100.0,
                concurrent_actions: 4,
                seed: Some(7),
                ..TimeIssuerOptions::default()
            },
        );

        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        for index in 0..1000 {
            let order = order.clone();
            issuer.get_time().on_settle(move |turn| {
                if let Ok(issuer) = turn {
                    order.borrow_mut().push(index);
                    issuer.release();
                }
            });
        }

        let reactor2 = reactor.clone();
        let watched = issuer.clone();
        reactor.add_periodic_timer(Duration::from_secs(1), move || {
            if watched.pending() == 0 {
                reactor2.stop();
            }
        });
        reactor.run_for(Duration::from_secs(30)).await;

        assert_eq!(issuer.pending(), 0);
        assert_eq!(issuer.active(), 0);
        assert_eq!(*order.borrow(), (0..1000).collect::<Vec<_>>());
    }
}
