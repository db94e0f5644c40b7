#[cfg(test)]
mod tests_impl {
    use crate::audit::{AuditLog, EventType};
    use crate::core::backend::InstanceStatus;
    use crate::core::driver::{PacketFilter, RemoveOutcome};
    use crate::core::error::Error;
    use crate::core::lifecycle::BootstrapOutcome;
    use crate::core::rule::{NatRule, Protocol, RuleKey};
    use crate::core::sync::{KernelState, NatSettings, RuleSynchronizer};
    use crate::core::test_helpers::{Harness, LISTEN_IP, UPLINK};
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    const WEB1_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 3, 15);
    const DB_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 3, 16);

    fn harness() -> Harness {
        let h = Harness::new();
        h.backend.add_instance("web1", WEB1_IP);
        h.backend.add_instance("db", DB_IP);
        h
    }

    #[tokio::test]
    async fn test_add_creates_both_kernel_rules_and_one_record() {
        let h = harness();
        let record = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();

        assert_eq!(record.rule_id, "drnat_web1_tcp_8080");
        assert_eq!(record.instance_ip, WEB1_IP);

        let rules = h.filter.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], record.dnat_rule(LISTEN_IP));
        assert_eq!(rules[1], record.masquerade_rule(UPLINK));

        let listed = h.sync.list_rules("web1").await;
        assert_eq!(listed, vec![record]);
        assert!(h.sync.list_rules("db").await.is_empty());
    }

    #[tokio::test]
    async fn test_web1_duplicate_key_conflicts_and_ledger_unchanged() {
        let h = harness();
        h.sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();
        let before = h.ledger_bytes().await.unwrap();

        let err = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 81)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { ref rule_id, .. } if rule_id == "drnat_web1_tcp_8080"));

        assert_eq!(h.ledger_bytes().await.unwrap(), before);
        assert_eq!(h.filter.rules().len(), 2);
    }

    #[tokio::test]
    async fn test_external_port_collision_across_instances() {
        let h = harness();
        h.sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();

        let err = h
            .sync
            .add_rule("db", Protocol::Tcp, 8080, 5432)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { ref reason, .. } if reason.contains("web1")));

        // Same number on the other protocol is a separate forward
        h.sync
            .add_rule("db", Protocol::Udp, 8080, 5432)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quota_one_scenario() {
        let h = harness();
        h.backend.set_quota("web1", 1);

        h.sync
            .add_rule("web1", Protocol::Tcp, 9000, 90)
            .await
            .unwrap();

        // The limit counts forwards of both protocols
        let err = h
            .sync
            .add_rule("web1", Protocol::Udp, 9001, 91)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { limit: 1, .. }));

        // tcp -> 22 is always admitted
        let ssh = h
            .sync
            .add_rule("web1", Protocol::Tcp, 9002, 22)
            .await
            .unwrap();
        assert!(ssh.is_bootstrap());
        assert_eq!(h.sync.list_rules("web1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_configured_quota_applies_without_backend_quota() {
        let h = Harness::with_settings(
            NatSettings::new(LISTEN_IP)
                .with_default_quota(2)
                .with_quota("db", 1),
        );
        h.backend.add_instance("web1", WEB1_IP);
        h.backend.add_instance("db", DB_IP);

        h.sync.add_rule("db", Protocol::Tcp, 5432, 5432).await.unwrap();
        assert!(matches!(
            h.sync.add_rule("db", Protocol::Tcp, 5433, 5433).await,
            Err(Error::QuotaExceeded { limit: 1, .. })
        ));

        h.sync.add_rule("web1", Protocol::Tcp, 80, 80).await.unwrap();
        h.sync.add_rule("web1", Protocol::Tcp, 443, 443).await.unwrap();
        assert!(matches!(
            h.sync.add_rule("web1", Protocol::Udp, 443, 443).await,
            Err(Error::QuotaExceeded { limit: 2, .. })
        ));

        // Backend quota wins over configuration; 0 means unlimited
        h.backend.set_quota("web1", 0);
        h.sync.add_rule("web1", Protocol::Udp, 443, 443).await.unwrap();
    }

    #[tokio::test]
    async fn test_masquerade_failure_rolls_back_dnat() {
        let h = harness();
        h.filter.fail_apply_on("POSTROUTING");

        let err = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command(_)));

        assert!(!h.filter.has_tag_prefix("drnat_web1_tcp_8080"));
        assert!(h.filter.rules().is_empty());
        assert!(h.ledger_bytes().await.is_none());
        assert!(h.sync.list_rules("web1").await.is_empty());
    }

    #[tokio::test]
    async fn test_dnat_failure_leaves_nothing() {
        let h = harness();
        h.filter.fail_apply_on("PREROUTING");

        assert!(h.sync.add_rule("web1", Protocol::Udp, 5000, 5000).await.is_err());
        assert!(h.filter.rules().is_empty());
        assert!(h.sync.list_rules("web1").await.is_empty());
    }

    #[tokio::test]
    async fn test_masquerade_disabled_applies_dnat_only() {
        let h = Harness::with_settings(NatSettings::new(LISTEN_IP));
        h.backend.add_instance("web1", WEB1_IP);

        let record = h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        assert_eq!(h.filter.rules(), vec![record.dnat_rule(LISTEN_IP)]);

        let report = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 8080, 80, None)
            .await
            .unwrap();
        assert!(report.masquerade.is_none());
        assert!(matches!(report.dnat, Some(RemoveOutcome::Removed)));
    }

    #[tokio::test]
    async fn test_add_validation_and_missing_instance() {
        let h = harness();
        assert!(matches!(
            h.sync.add_rule("web1", Protocol::Tcp, 0, 80).await,
            Err(Error::Validation { ref field, .. }) if field == "external_port"
        ));
        assert!(matches!(
            h.sync.add_rule("bad name", Protocol::Tcp, 80, 80).await,
            Err(Error::Validation { ref field, .. }) if field == "instance_id"
        ));
        assert!(matches!(
            h.sync.add_rule("ghost", Protocol::Tcp, 80, 80).await,
            Err(Error::InstanceNotFound(_))
        ));
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_address_is_upstream_unavailable() {
        let h = harness();
        h.backend.set_address("web1", None);

        assert!(matches!(
            h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await,
            Err(Error::UpstreamUnavailable(_))
        ));
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_write_failure_rolls_back_both_kernel_rules() {
        let h = harness();
        // A directory where the ledger file should be makes every write fail
        tokio::fs::create_dir_all(h.sync.ledger().path()).await.unwrap();

        let err = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_find_rule_by_id() {
        let h = harness();
        let record = h.sync.add_rule("web1", Protocol::Udp, 5353, 53).await.unwrap();

        assert_eq!(h.sync.find_rule(&record.rule_id).await.unwrap(), record);
        assert!(matches!(
            h.sync.find_rule("drnat_web1_udp_1").await,
            Err(Error::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let h = harness();
        h.sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();

        let first = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 8080, 80, None)
            .await
            .unwrap();
        assert!(first.ledger_removed);
        assert!(matches!(first.dnat, Some(RemoveOutcome::Removed)));
        assert!(matches!(first.masquerade, Some(RemoveOutcome::Removed)));
        assert!(h.filter.rules().is_empty());

        for _ in 0..2 {
            let again = h
                .sync
                .remove_rule("web1", Protocol::Tcp, 8080, 80, None)
                .await
                .unwrap();
            assert!(!again.ledger_removed);
            assert!(again.is_clean());
            assert!(again.was_noop());
        }
    }

    #[tokio::test]
    async fn test_remove_unknown_rule_without_address_is_noop() {
        let h = harness();
        h.backend.set_status("web1", InstanceStatus::Stopped);

        let report = h
            .sync
            .remove_rule("web1", Protocol::Udp, 7000, 70, None)
            .await
            .unwrap();
        assert!(report.dnat.is_none());
        assert!(report.masquerade.is_none());
        assert!(report.was_noop());
        assert_eq!(h.backend.address_lookups(), 0);
    }

    #[tokio::test]
    async fn test_remove_without_record_uses_known_ip_then_live_lookup() {
        let h = harness();
        let key = RuleKey::new("web1", Protocol::Tcp, 2222);
        let stray = NatRule::dnat(LISTEN_IP, &key, Ipv4Addr::new(10, 0, 3, 99), 22);
        h.filter.apply(&stray).await.unwrap();

        // Caller-supplied address reaches the stray rule
        let report = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 2222, 22, Some(Ipv4Addr::new(10, 0, 3, 99)))
            .await
            .unwrap();
        assert!(matches!(report.dnat, Some(RemoveOutcome::Removed)));
        assert!(!report.ledger_removed);

        // Without one, a running instance's live address is used
        let live = NatRule::dnat(LISTEN_IP, &key, WEB1_IP, 22);
        h.filter.apply(&live).await.unwrap();
        let report = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 2222, 22, None)
            .await
            .unwrap();
        assert!(matches!(report.dnat, Some(RemoveOutcome::Removed)));
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_remove_uses_snapshot_even_if_address_changed() {
        let h = harness();
        let record = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();
        h.backend.set_address("web1", Some(Ipv4Addr::new(10, 0, 3, 200)));

        let report = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 8080, 80, Some(Ipv4Addr::new(1, 2, 3, 4)))
            .await
            .unwrap();
        assert!(matches!(report.dnat, Some(RemoveOutcome::Removed)));
        assert!(!h.filter.has_tag_prefix(&record.rule_id));
    }

    #[tokio::test]
    async fn test_remove_drops_record_even_when_kernel_fails() {
        let h = harness();
        h.sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();
        h.filter.fail_removals(true);

        let report = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 8080, 80, None)
            .await
            .unwrap();
        assert!(report.ledger_removed);
        assert!(!report.is_clean());
        assert!(h.sync.list_rules("web1").await.is_empty());
    }

    #[tokio::test]
    async fn test_drifted_kernel_rule_reports_already_absent() {
        let h = harness();
        let record = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();
        h.filter.drop_rule(&record.dnat_rule(LISTEN_IP));

        let report = h
            .sync
            .remove_rule("web1", Protocol::Tcp, 8080, 80, None)
            .await
            .unwrap();
        assert!(matches!(report.dnat, Some(RemoveOutcome::AlreadyAbsent)));
        assert!(matches!(report.masquerade, Some(RemoveOutcome::Removed)));
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_verify_reports_missing_rules_and_stale_snapshots() {
        let h = harness();
        let web = h
            .sync
            .add_rule("web1", Protocol::Tcp, 8080, 80)
            .await
            .unwrap();
        h.sync.add_rule("db", Protocol::Tcp, 5432, 5432).await.unwrap();

        let reports = h.sync.verify_rules(None).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_in_sync()));

        h.filter.drop_rule(&web.masquerade_rule(UPLINK));
        h.backend.set_address("db", Some(Ipv4Addr::new(10, 0, 3, 42)));

        let reports = h.sync.verify_rules(None).await;
        let web_report = reports.iter().find(|r| r.record.instance_id == "web1").unwrap();
        assert_eq!(web_report.dnat, KernelState::Present);
        assert_eq!(web_report.masquerade, Some(KernelState::Missing));
        assert!(!web_report.snapshot_stale());

        let db_report = reports.iter().find(|r| r.record.instance_id == "db").unwrap();
        assert!(db_report.snapshot_stale());

        let only_db = h.sync.verify_rules(Some("db")).await;
        assert_eq!(only_db.len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_removes_all_records_despite_failures() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        h.sync.add_rule("web1", Protocol::Udp, 9000, 90).await.unwrap();
        h.sync.add_rule("db", Protocol::Tcp, 5432, 5432).await.unwrap();
        h.filter.fail_removals(true);

        let report = h.lifecycle.teardown("web1").await;
        assert_eq!(report.removed_count(), 2);
        assert_eq!(report.discrepancies(), 2);
        assert!(report.failures.is_empty());
        assert!(!report.is_clean());

        assert!(h.sync.list_rules("web1").await.is_empty());
        assert_eq!(h.sync.list_rules("db").await.len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_of_vanished_instance_uses_snapshots() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        h.backend.remove_instance("web1");

        let report = h.lifecycle.teardown("web1").await;
        assert!(report.is_clean());
        assert_eq!(report.removed_count(), 1);
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_decommission_tears_down_before_destroy() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();

        let sync = h.sync.clone();
        let destroyed = h
            .lifecycle
            .decommission("web1", || async move {
                assert!(sync.list_rules("web1").await.is_empty());
                Ok("deleted")
            })
            .await
            .unwrap();
        assert_eq!(destroyed, "deleted");
    }

    #[tokio::test]
    async fn test_decommission_returns_destroy_error() {
        let h = harness();
        let result: crate::core::error::Result<()> = h
            .lifecycle
            .decommission("web1", || async {
                Err(Error::UpstreamUnavailable("lxd down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_add_waits_for_running_teardown() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        h.filter.delay_removals(Duration::from_millis(100));

        let add = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.sync.add_rule("web1", Protocol::Tcp, 9090, 90).await
        };
        let (report, added) = tokio::join!(h.lifecycle.teardown("web1"), add);

        assert_eq!(report.removed_count(), 1);
        let added = added.unwrap();
        // The late add landed after teardown, not in the middle of it
        assert_eq!(h.sync.list_rules("web1").await, vec![added]);
        assert!(!h.filter.has_tag_prefix("drnat_web1_tcp_8080"));
    }

    #[tokio::test]
    async fn test_add_racing_decommission_finds_no_instance() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        h.filter.delay_removals(Duration::from_millis(100));

        let backend = h.backend.clone();
        let decommission = h.lifecycle.decommission("web1", || async move {
            backend.remove_instance("web1");
            Ok(())
        });
        let add = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.sync.add_rule("web1", Protocol::Tcp, 9090, 90).await
        };
        let (destroyed, added) = tokio::join!(decommission, add);

        destroyed.unwrap();
        assert!(matches!(added, Err(Error::InstanceNotFound(_))));
        assert!(h.sync.list_rules("web1").await.is_empty());
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_provisions_ssh_forward_after_retries() {
        let h = harness();
        h.backend.delay_address("web1", 2);

        let outcome = h.lifecycle.on_first_boot_with_port("web1", 23456).await;
        let record = match outcome {
            BootstrapOutcome::Provisioned(record) => record,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(record.internal_port, 22);
        assert_eq!(record.external_port, 23456);
        // two misses, one hit, then the lookup inside add_rule
        assert_eq!(h.backend.address_lookups(), 4);
    }

    #[tokio::test]
    async fn test_bootstrap_gives_up_after_max_attempts() {
        let h = harness();
        h.backend.set_address("web1", None);

        let outcome = h.lifecycle.on_first_boot_with_port("web1", 23456).await;
        assert!(matches!(outcome, BootstrapOutcome::AddressUnresolved));
        assert_eq!(h.backend.address_lookups(), 3);
        assert!(h.sync.list_rules("web1").await.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_port_collision() {
        let h = harness();
        h.sync.add_rule("db", Protocol::Tcp, 23456, 22).await.unwrap();

        let outcome = h.lifecycle.on_first_boot_with_port("web1", 23456).await;
        assert!(matches!(outcome, BootstrapOutcome::PortCollision(23456)));
    }

    #[tokio::test]
    async fn test_bootstrap_random_port_in_range() {
        let h = harness();
        let outcome = h.lifecycle.on_first_boot("web1").await;
        let record = outcome.record().unwrap();
        assert!(record.external_port >= 10000);
        assert!(record.is_bootstrap());
    }

    #[tokio::test]
    async fn test_bootstrap_bypasses_exhausted_quota() {
        let h = harness();
        h.backend.set_quota("web1", 1);
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();

        let outcome = h.lifecycle.on_first_boot_with_port("web1", 30000).await;
        assert!(matches!(outcome, BootstrapOutcome::Provisioned(_)));
    }

    #[tokio::test]
    async fn test_reimage_tears_down_then_bootstraps() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        h.sync.add_rule("web1", Protocol::Tcp, 2200, 22).await.unwrap();

        let backend = h.backend.clone();
        let report = h
            .lifecycle
            .reimage("web1", || async move {
                backend.set_address("web1", Some(Ipv4Addr::new(10, 0, 3, 77)));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(report.teardown.removed_count(), 2);
        let bootstrap = report.bootstrap.unwrap();
        let record = bootstrap.record().unwrap();
        assert_eq!(record.instance_ip, Ipv4Addr::new(10, 0, 3, 77));

        let rules = h.sync.list_rules("web1").await;
        assert_eq!(rules.len(), 1);
        assert!(rules[0].is_bootstrap());
    }

    #[tokio::test]
    async fn test_reimage_rebuild_failure_skips_bootstrap() {
        let h = harness();
        h.sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();

        let result = h
            .lifecycle
            .reimage("web1", || async {
                Err::<(), _>(Error::Internal("image missing".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(h.sync.list_rules("web1").await.is_empty());
        assert!(h.filter.rules().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_for_one_port_admit_exactly_one() {
        let h = harness();
        let mut handles = Vec::new();
        for instance in ["web1", "db", "web1", "db"] {
            let sync: Arc<RuleSynchronizer> = h.sync.clone();
            handles.push(tokio::spawn(async move {
                sync.add_rule(instance, Protocol::Tcp, 8443, 443).await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(h.filter.rules().len(), 2);
        assert_eq!(h.sync.ledger().load().await.len(), 1);
    }

    #[tokio::test]
    async fn test_operations_are_audited() {
        let h = harness();
        let audit = AuditLog::at(h.dir.path().join("audit.log"));
        let sync = Arc::new(
            RuleSynchronizer::new(
                h.sync.ledger().clone(),
                h.filter.clone(),
                h.backend.clone(),
                NatSettings::new(LISTEN_IP).with_masquerade(UPLINK),
            )
            .with_audit(audit.clone()),
        );

        sync.add_rule("web1", Protocol::Tcp, 8080, 80).await.unwrap();
        let _ = sync.add_rule("web1", Protocol::Tcp, 8080, 80).await;
        sync.remove_rule("web1", Protocol::Tcp, 8080, 80, None)
            .await
            .unwrap();

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::RemoveRule);
        assert!(!events[1].success);
        assert!(events[1].error.as_deref().unwrap().contains("already exists"));
        assert!(events[2].success);
    }
}
