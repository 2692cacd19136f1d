/// Concurrent node events against a single manager.
///
/// Handlers sleep inside every callback, so wall time shows whether
/// updates serialize on each other.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use node_manager::mock::{MockHandler, MockHandlerConfig, MockIpCache, MockIpSet};
    use node_manager::{Address, HealthReporter, Manager, ManagerConfig, Node, Source};

    const DELAY: Duration = Duration::from_millis(200);

    fn slow_manager() -> (Arc<Manager>, Arc<MockHandler>) {
        let manager = Arc::new(Manager::new(
            ManagerConfig::default(),
            Arc::new(MockIpCache::new()),
            Arc::new(MockIpSet::new()),
            None,
            Arc::new(HealthReporter::new()),
        ));
        let handler = Arc::new(MockHandler::with_config(
            "slow",
            MockHandlerConfig {
                delay: Some(DELAY),
                ..Default::default()
            },
        ));
        manager.subscribe(handler.clone());
        (manager, handler)
    }

    fn node(name: &str, ip: &str) -> Node {
        Node::new("c1", name, Source::Kubernetes).with_address(Address::internal(ip.parse().unwrap()))
    }

    #[test]
    fn distinct_identities_update_in_parallel() {
        let (manager, handler) = slow_manager();

        let started = Instant::now();
        let workers: Vec<_> = (1..=4)
            .map(|i| {
                let manager = manager.clone();
                thread::spawn(move || manager.node_updated(node(&format!("n{i}"), &format!("10.0.0.{i}"))))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let elapsed = started.elapsed();

        assert_eq!(handler.tracker().add_count(), 4);
        assert!(
            elapsed < DELAY * 3,
            "4 adds took {elapsed:?}, expected close to {DELAY:?}"
        );
    }

    #[test]
    fn same_identity_updates_serialize() {
        let (manager, handler) = slow_manager();
        manager.node_updated(node("n1", "10.0.0.1"));

        let started = Instant::now();
        let workers: Vec<_> = ["10.0.0.2", "10.0.0.3"]
            .into_iter()
            .map(|ip| {
                let manager = manager.clone();
                thread::spawn(move || manager.node_updated(node("n1", ip)))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(started.elapsed() >= DELAY * 2);
        assert_eq!(handler.tracker().update_count(), 2);
        assert_eq!(manager.get_nodes().len(), 1);
    }

    #[test]
    fn readers_see_consistent_snapshots_during_writes() {
        let (manager, _) = slow_manager();

        let writer = {
            let manager = manager.clone();
            thread::spawn(move || {
                for i in 1..=3 {
                    manager.node_updated(node(&format!("n{i}"), &format!("10.0.0.{i}")));
                }
            })
        };

        while !writer.is_finished() {
            for (identity, node) in manager.get_nodes() {
                assert_eq!(identity, node.identity());
            }
            thread::sleep(Duration::from_millis(10));
        }
        writer.join().unwrap();
        assert_eq!(manager.get_node_identities().len(), 3);
    }
}
