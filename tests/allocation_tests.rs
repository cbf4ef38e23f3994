#[cfg(test)]
mod allocation_tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    use clusterset_ipam::ip::cidr::{nets_overlap, parse_cidr};
    use clusterset_ipam::ip::{AddressPool, AllocationRegistry, ClusterAllocation, RegistryKind};
    use clusterset_ipam::orchestrator::{AllocateError, JoinRequest, Orchestrator, RetryPolicy};
    use clusterset_ipam::store::{FileStore, InMemoryStore, RecordStore, RegistryStore};

    const NS: &str = "submariner-broker";

    fn bootstrap<S: RecordStore>(store: S, pool: &str, size: u64, clusters: &[(&str, &str)]) {
        let mut registry = AllocationRegistry::new(AddressPool::new(pool, size).unwrap(), true);
        for (id, cidr) in clusters {
            registry.upsert_cluster(ClusterAllocation::new(*id, *cidr));
        }
        RegistryStore::new(store, RegistryKind::Globalnet)
            .ensure_created(NS, &registry)
            .unwrap();
    }

    fn allocate<S: RecordStore>(store: S, cluster_id: &str) -> Result<Option<String>, AllocateError> {
        Orchestrator::new(store, RegistryKind::Globalnet)
            .allocate_cidr(NS, &JoinRequest::new(cluster_id))
            .map(|outcome| outcome.cidr)
    }

    fn assert_pairwise_disjoint(cidrs: &[String]) {
        let nets: Vec<_> = cidrs.iter().map(|c| parse_cidr(c).unwrap()).collect();
        for (i, a) in nets.iter().enumerate() {
            for b in nets.iter().skip(i + 1) {
                assert!(!nets_overlap(a, b), "{} overlaps {}", a, b);
            }
        }
    }

    /// Allocation scenarios against 169.254.0.0/16 with /19 blocks
    #[test]
    fn test_first_fit_scenarios() {
        let cases: Vec<(Vec<(&str, &str)>, &str)> = vec![
            (vec![], "169.254.0.0/19"),
            (vec![("cluster1", "169.254.0.0/19")], "169.254.32.0/19"),
            (
                vec![("cluster1", "169.254.0.0/19"), ("cluster2", "169.254.64.0/19")],
                "169.254.32.0/19",
            ),
            (vec![("cluster1", "169.254.32.0/19")], "169.254.0.0/19"),
        ];

        for (existing, expected) in cases {
            let store = InMemoryStore::new();
            bootstrap(&store, "169.254.0.0/16", 8192, &existing);
            let cidr = allocate(&store, "new-cluster").unwrap();
            assert_eq!(cidr.as_deref(), Some(expected), "existing allocations: {:?}", existing);
        }
    }

    /// A full pool reports exhaustion rather than an overlap
    #[test]
    fn test_exhausted_pool() {
        let store = InMemoryStore::new();
        bootstrap(
            &store,
            "169.254.0.0/16",
            32768,
            &[("cluster1", "169.254.0.0/17"), ("cluster2", "169.254.128.0/17")],
        );

        let err = allocate(&store, "cluster3").unwrap_err();
        assert!(matches!(err, AllocateError::Allocation { .. }));
        assert!(err.to_string().contains("allocation not available"));
    }

    /// Rejoining returns the stored block and leaves the record untouched
    #[test]
    fn test_rejoin_is_idempotent() {
        let store = InMemoryStore::new();
        bootstrap(&store, "242.0.0.0/8", 65536, &[]);

        let first = allocate(&store, "east").unwrap();
        let version = store.get(NS, RegistryKind::Globalnet.record_name()).unwrap().version;

        for _ in 0..3 {
            let request = JoinRequest::new("east").with_size(256);
            let outcome = Orchestrator::new(&store, RegistryKind::Globalnet)
                .allocate_cidr(NS, &request)
                .unwrap();
            assert_eq!(outcome.cidr, first);
            assert!(outcome.preconfigured);
        }

        let after = store.get(NS, RegistryKind::Globalnet.record_name()).unwrap().version;
        assert_eq!(version, after);
    }

    /// Random mixes of sizes and explicit requests never produce overlapping blocks
    #[test]
    fn test_random_sequences_never_overlap() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for round in 0..20 {
            let store = InMemoryStore::new();
            bootstrap(&store, "242.0.0.0/16", 1024, &[]);
            let orchestrator = Orchestrator::new(&store, RegistryKind::Globalnet);

            let mut granted = Vec::new();
            for i in 0..40 {
                let mut request = JoinRequest::new(format!("r{}-c{}", round, i));
                if rng.gen_bool(0.25) {
                    let third: u8 = rng.gen();
                    request = request.with_cidr(format!("242.0.{}.0/24", third));
                } else {
                    request = request.with_size(rng.gen_range(1..=4096));
                }

                match orchestrator.allocate_cidr(NS, &request) {
                    Ok(outcome) => granted.extend(outcome.cidr),
                    Err(AllocateError::Overlap { .. }) | Err(AllocateError::Allocation { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }

            assert!(!granted.is_empty());
            assert_pairwise_disjoint(&granted);

            let (registry, _) = orchestrator.registry_store().get(NS).unwrap();
            let stored: Vec<String> = registry
                .allocated_blocks(None)
                .into_iter()
                .map(|(_, cidr)| cidr.to_string())
                .collect();
            assert_eq!(stored.len(), granted.len());
        }
    }

    /// Clusters joining at the same time all get distinct blocks
    #[test]
    fn test_concurrent_joins() {
        const CLUSTERS: usize = 8;

        let store = Arc::new(InMemoryStore::new());
        bootstrap(Arc::clone(&store), "242.0.0.0/8", 65536, &[]);

        let handles: Vec<_> = (0..CLUSTERS)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    // Each conflict means another cluster's write landed, so CLUSTERS attempts always suffice
                    Orchestrator::new(store, RegistryKind::Globalnet)
                        .with_retry_policy(RetryPolicy {
                            max_attempts: CLUSTERS as u32,
                        })
                        .allocate_cidr(NS, &JoinRequest::new(format!("cluster{}", i)))
                        .map(|outcome| outcome.cidr)
                })
            })
            .collect();

        let mut granted = Vec::new();
        for handle in handles {
            let cidr = handle.join().unwrap().unwrap().unwrap();
            granted.push(cidr);
        }

        assert_pairwise_disjoint(&granted);

        let (registry, _) = RegistryStore::new(&*store, RegistryKind::Globalnet).get(NS).unwrap();
        assert_eq!(registry.clusters.len(), CLUSTERS);

        // First-fit with no gaps: exactly the lowest CLUSTERS blocks are used
        let mut sorted = granted.clone();
        sorted.sort_by_key(|c| parse_cidr(c).unwrap().network());
        let expected: Vec<String> = (0..CLUSTERS).map(|i| format!("242.{}.0.0/16", i)).collect();
        assert_eq!(sorted, expected);
    }

    /// End to end through the file store, as the CLI runs it
    #[test]
    fn test_file_store_join_flow() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        bootstrap(&store, "242.0.0.0/8", 65536, &[]);

        assert_eq!(allocate(&store, "east").unwrap().as_deref(), Some("242.0.0.0/16"));
        assert_eq!(allocate(&store, "west").unwrap().as_deref(), Some("242.1.0.0/16"));
        assert_eq!(allocate(&store, "east").unwrap().as_deref(), Some("242.0.0.0/16"));

        let record = store.get(NS, RegistryKind::Globalnet.record_name()).unwrap();
        assert_eq!(record.data["globalnetCidrRange"], "\"242.0.0.0/8\"");
        assert!(record.data["clusterinfo"].contains("\t\t\"cluster_id\": \"west\""));

        let expected: BTreeMap<String, ClusterAllocation> = [
            ("east".to_string(), ClusterAllocation::new("east", "242.0.0.0/16")),
            ("west".to_string(), ClusterAllocation::new("west", "242.1.0.0/16")),
        ]
        .into_iter()
        .collect();
        let (registry, _) = RegistryStore::new(&store, RegistryKind::Globalnet).get(NS).unwrap();
        assert_eq!(registry.clusters, expected);
    }

    /// Without a bootstrapped record the join fails instead of creating one
    #[test]
    fn test_join_without_registry() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let err = allocate(&store, "east").unwrap_err();
        assert!(matches!(err, AllocateError::RegistryMissing { .. }));
        assert!(!dir.path().join(NS).exists());
    }
}
