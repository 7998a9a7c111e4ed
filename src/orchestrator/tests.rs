//! Deployment scenarios driven through the scripted provider, port table and
//! executor.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::cluster::{ServiceAddress, Timings};
use crate::provider::InstanceState;
use crate::test_support::{ScriptedExecutor, ScriptedPorts, ScriptedProvider, sample_cluster};

type TestOrchestrator = Orchestrator<ScriptedProvider, ScriptedExecutor, ScriptedPorts>;

struct Harness {
    provider: ScriptedProvider,
    executor: ScriptedExecutor,
    ports: ScriptedPorts,
}

impl Harness {
    fn orchestrator(&self, config: ClusterConfig) -> TestOrchestrator {
        Orchestrator::new(
            Arc::new(config),
            self.provider.clone(),
            self.executor.clone(),
            self.ports.clone(),
        )
    }
}

#[fixture]
fn harness() -> Harness {
    Harness {
        provider: ScriptedProvider::new(),
        executor: ScriptedExecutor::new(),
        ports: ScriptedPorts::all_open(),
    }
}

fn fast(mut config: ClusterConfig) -> ClusterConfig {
    config.timings = Timings {
        poll_interval: Duration::from_millis(1),
        infra_timeout: Duration::from_millis(200),
        service_timeout: Duration::from_millis(30),
        dependent_timeout: Duration::from_millis(30),
        seconds_per_attempt: 300,
    };
    config
}

fn multi_node() -> ClusterConfig {
    fast(sample_cluster(Topology::MultiNode, 3))
}

fn single_node() -> ClusterConfig {
    fast(sample_cluster(Topology::SingleNode, 1))
}

#[rstest]
#[tokio::test]
async fn healthy_multi_node_cluster_deploys_without_retries(harness: Harness) {
    let results = harness
        .orchestrator(multi_node())
        .deploy()
        .await
        .expect("deployment should succeed");

    let shape: Vec<_> = results
        .iter()
        .map(|result| (result.role, result.container_index, result.status, result.attempts))
        .collect();
    assert_eq!(
        shape,
        vec![
            (Role::Admin, None, DeploymentStatus::Success, 1),
            (Role::Container, Some(1), DeploymentStatus::Success, 1),
            (Role::Container, Some(2), DeploymentStatus::Success, 1),
            (Role::Container, Some(3), DeploymentStatus::Success, 1),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn container_scripts_point_at_the_admin(harness: Harness) {
    harness
        .orchestrator(multi_node())
        .deploy()
        .await
        .expect("deployment should succeed");

    for container in ["srv-2", "srv-3", "srv-4"] {
        let execs = harness.executor.execs_for(container);
        let script = &execs.first().expect("container script should run").script;
        assert!(
            script.contains("export ADMIN_HOST=srv-1.pub.example"),
            "{container} script: {script}"
        );
    }
    assert_eq!(harness.executor.copies().len(), 4);
}

#[rstest]
#[tokio::test]
async fn container_with_closed_port_fails_after_exhausting_retries(harness: Harness) {
    harness.ports.close("srv-3.pub.example", 9394);

    let results = harness
        .orchestrator(multi_node())
        .deploy()
        .await
        .expect("node failures are not fatal");

    assert_eq!(results.len(), 4);
    let failed: Vec<_> = results.iter().filter(|result| !result.is_success()).collect();
    let [second] = failed.as_slice() else {
        panic!("expected exactly one failure, got {failed:?}");
    };
    assert_eq!(second.container_index, Some(2));
    assert_eq!(second.instance_id, "srv-3");
    assert_eq!(second.attempts, 3);
    assert!(
        second
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("srv-3.pub.example:9394")),
        "{second:?}"
    );
    assert_eq!(harness.executor.execs_for("srv-3").len(), 3);
    assert_eq!(harness.executor.execs_for("srv-2").len(), 1);
    assert_eq!(harness.executor.execs_for("srv-4").len(), 1);

    let tags = harness.provider.tags_for("srv-3");
    assert_eq!(tags.get(NAME_TAG), Some("demo"));
    assert_eq!(tags.get(OWNER_TAG), Some("ops"));
    assert_eq!(tags.get(CONTAINER_INDEX_TAG), Some("2"));
}

#[rstest]
#[tokio::test]
async fn failing_scripts_are_retried_and_still_tagged(harness: Harness) {
    harness.executor.exit_with("srv-1.pub.example", 1);

    let results = harness
        .orchestrator(single_node())
        .deploy()
        .await
        .expect("node failures are not fatal");

    let [node] = results.as_slice() else {
        panic!("expected one result, got {results:?}");
    };
    assert_eq!(node.status, DeploymentStatus::Failure);
    assert_eq!(node.attempts, 3);
    assert!(
        node.detail
            .as_deref()
            .is_some_and(|detail| detail.contains("status 1")),
        "{node:?}"
    );
    // One initialising write followed by a final write per attempt.
    let history = harness.provider.tag_history("srv-1");
    assert_eq!(history.len(), 4);
    assert_eq!(
        history.first().and_then(|tags| tags.get(NAME_TAG)),
        Some("Initializing instance for ops")
    );
    assert_eq!(harness.provider.tags_for("srv-1").get(NAME_TAG), Some("demo"));
}

#[rstest]
#[tokio::test]
async fn single_node_cluster_returns_one_result(harness: Harness) {
    let results = harness
        .orchestrator(single_node())
        .deploy()
        .await
        .expect("deployment should succeed");

    let [node] = results.as_slice() else {
        panic!("expected one result, got {results:?}");
    };
    assert_eq!(node.role, Role::SingleNode);
    assert!(node.is_success());
    assert_eq!(node.dns_name, "srv-1.pub.example");
    let tags = harness.provider.tags_for("srv-1");
    assert_eq!(tags.get(ROLE_TAG), Some("SingleNode"));
    assert_eq!(tags.get(DESCRIPTION_TAG), Some("stratus cluster"));
    assert_eq!(tags.get(CONTAINER_INDEX_TAG), None);
}

#[rstest]
#[tokio::test]
async fn unreachable_cache_aborts_before_any_script(harness: Harness) {
    harness.ports.close("cache.internal", 6379);

    let err = harness
        .orchestrator(single_node())
        .deploy()
        .await
        .expect_err("cache outage is fatal");

    assert!(
        matches!(err, DeployError::DependentServiceTimeout { service: "cache", .. }),
        "{err}"
    );
    assert!(harness.executor.execs().is_empty());
    assert!(harness.executor.copies().is_empty());
}

#[rstest]
#[tokio::test]
async fn one_reachable_broker_is_enough(harness: Harness) {
    harness.ports.close("mq1.internal", 5672);

    let results = harness
        .orchestrator(single_node())
        .deploy()
        .await
        .expect("one broker replica is sufficient");

    assert!(results.iter().all(DeploymentResult::is_success));
}

#[rstest]
#[tokio::test]
async fn one_reachable_cache_replica_is_enough(harness: Harness) {
    let mut config = single_node();
    config.services.cache = vec![
        ServiceAddress::new("c1.internal", 6379),
        ServiceAddress::new("c2.internal", 6379),
    ];
    harness.ports.close("c1.internal", 6379);

    let results = harness
        .orchestrator(config)
        .deploy()
        .await
        .expect("the second cache replica satisfies the gate");

    assert!(results.iter().all(DeploymentResult::is_success));
    assert!(harness.ports.attempts("c2.internal", 6379) >= 1);
}

#[rstest]
#[tokio::test]
async fn failed_admin_does_not_stop_the_containers(harness: Harness) {
    harness.executor.exit_with("srv-1.pub.example", 1);

    let results = harness
        .orchestrator(multi_node())
        .deploy()
        .await
        .expect("an admin failure is reported, not raised");

    let shape: Vec<_> = results
        .iter()
        .map(|result| (result.role, result.status, result.attempts))
        .collect();
    assert_eq!(
        shape,
        vec![
            (Role::Admin, DeploymentStatus::Failure, 3),
            (Role::Container, DeploymentStatus::Success, 1),
            (Role::Container, DeploymentStatus::Success, 1),
            (Role::Container, DeploymentStatus::Success, 1),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn admin_checks_the_coordination_service(harness: Harness) {
    harness.ports.close("zk1.internal", 2181);
    harness.ports.close("zk2.internal", 2181);

    let err = harness
        .orchestrator(multi_node())
        .deploy()
        .await
        .expect_err("coordination outage is fatal");

    assert!(
        matches!(err, DeployError::DependentServiceTimeout { service: "coordination", .. }),
        "{err}"
    );
    assert_eq!(harness.provider.instance_ids(), vec![String::from("srv-1")]);
}

#[rstest]
#[tokio::test]
async fn instances_that_never_run_are_fatal(harness: Harness) {
    harness.provider.launch_in_state(InstanceState::Starting);

    let err = harness
        .orchestrator(single_node())
        .deploy()
        .await
        .expect_err("instance never runs");

    assert!(
        matches!(err, DeployError::ProvisionTimeout { ref instance_id, .. } if instance_id == "srv-1"),
        "{err}"
    );
}

#[rstest]
#[tokio::test]
async fn closed_ssh_port_is_fatal(harness: Harness) {
    harness.ports.close("srv-1.pub.example", 22);

    let err = harness
        .orchestrator(single_node())
        .deploy()
        .await
        .expect_err("ssh never opens");

    assert!(matches!(err, DeployError::ProvisionTimeout { .. }), "{err}");
    assert!(harness.executor.execs().is_empty());
}

#[rstest]
#[tokio::test]
async fn short_container_batch_is_fatal(harness: Harness) {
    harness.provider.limit_batch(2);

    let err = harness
        .orchestrator(multi_node())
        .deploy()
        .await
        .expect_err("short batch is fatal");

    assert!(
        matches!(err, DeployError::ProvisionShortfall { requested: 3, received: 2 }),
        "{err}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_containers_trip_the_aggregate_deadline(harness: Harness) {
    harness.ports.close("srv-2.pub.example", 9394);
    let mut config = multi_node();
    config.timings.service_timeout = Duration::from_secs(600);
    config.timings.seconds_per_attempt = 1;

    let err = harness
        .orchestrator(config)
        .deploy()
        .await
        .expect_err("deadline should expire");

    assert!(
        matches!(err, DeployError::AggregateTimeout { deadline } if deadline == Duration::from_secs(9)),
        "{err}"
    );
}
