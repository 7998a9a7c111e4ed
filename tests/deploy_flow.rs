//! End-to-end deployment flows driven through the public test doubles:
//! deploy, report, and tear the cluster down again.

#[path = "common/fixtures.rs"]
mod fixtures;

use std::sync::Arc;

use rstest::{fixture, rstest};
use stratus::test_support::{ScriptedExecutor, ScriptedPorts, ScriptedProvider};
use stratus::{
    ARTIFACT_FILE_NAME, ClusterConfig, ClusterTeardown, DeployError, DeploymentReport,
    Orchestrator, Role, Topology, remove_stale_artifact,
};
use tempfile::TempDir;

use fixtures::{fast_cluster, utf8_dir};

struct Doubles {
    provider: ScriptedProvider,
    executor: ScriptedExecutor,
    ports: ScriptedPorts,
}

impl Doubles {
    fn orchestrator(
        &self,
        config: ClusterConfig,
    ) -> Orchestrator<ScriptedProvider, ScriptedExecutor, ScriptedPorts> {
        Orchestrator::new(
            Arc::new(config),
            self.provider.clone(),
            self.executor.clone(),
            self.ports.clone(),
        )
    }
}

#[fixture]
fn doubles() -> Doubles {
    Doubles {
        provider: ScriptedProvider::new(),
        executor: ScriptedExecutor::new(),
        ports: ScriptedPorts::all_open(),
    }
}

#[rstest]
#[tokio::test]
async fn multi_node_deploy_report_and_teardown(doubles: Doubles) {
    let config = fast_cluster(Topology::MultiNode, 2);
    let ports = config.ports;
    let results = doubles
        .orchestrator(config)
        .deploy()
        .await
        .unwrap_or_else(|err| panic!("deploy: {err}"));

    let roles: Vec<_> = results.iter().map(|result| result.role).collect();
    assert_eq!(roles, vec![Role::Admin, Role::Container, Role::Container]);

    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let dir = utf8_dir(&tmp);
    let report = DeploymentReport::new(&results, &ports);
    assert!(report.all_succeeded());
    let path = report
        .write_artifact(&dir)
        .unwrap_or_else(|err| panic!("artifact: {err}"));
    let listing = std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));
    assert_eq!(
        listing,
        "adminNode,srv-1.pub.example,9000,9393\n\
         containerNode,srv-2.pub.example,9000,9394\n\
         containerNode,srv-3.pub.example,9000,9394\n"
    );

    let summary = ClusterTeardown::new(doubles.provider.clone(), "fr-par-1")
        .run("demo")
        .await
        .unwrap_or_else(|err| panic!("teardown: {err}"));
    assert_eq!(summary.terminated.len(), 3);
    assert_eq!(doubles.provider.terminated().len(), 3);

    remove_stale_artifact(&dir).unwrap_or_else(|err| panic!("cleanup: {err}"));
    assert!(!dir.join(ARTIFACT_FILE_NAME).exists());
}

#[rstest]
#[tokio::test]
async fn container_startup_scripts_are_minimal(doubles: Doubles) {
    doubles
        .orchestrator(fast_cluster(Topology::MultiNode, 1))
        .deploy()
        .await
        .unwrap_or_else(|err| panic!("deploy: {err}"));

    let user_data = doubles.provider.user_data();
    let [admin, container] = user_data.as_slice() else {
        panic!("expected one admin and one container launch, got {user_data:?}");
    };
    assert!(admin.contains("systemctl start redis-server"), "{admin}");
    assert!(!container.contains("systemctl"), "{container}");
}

#[rstest]
#[tokio::test]
async fn container_overrides_reach_only_their_node(doubles: Doubles) {
    doubles
        .orchestrator(fast_cluster(Topology::MultiNode, 2))
        .deploy()
        .await
        .unwrap_or_else(|err| panic!("deploy: {err}"));

    let script_for = |id: &str| {
        doubles
            .executor
            .execs_for(id)
            .first()
            .map(|record| record.script.clone())
            .unwrap_or_else(|| panic!("{id} ran no script"))
    };
    let first = script_for("srv-2");
    let second = script_for("srv-3");
    assert!(first.contains("export APP_ROLE=sink"), "{first}");
    assert!(!first.contains("APP_ROLE=ingest"), "{first}");
    assert!(second.contains("export APP_ROLE=ingest"), "{second}");
}

#[rstest]
#[tokio::test]
async fn rejected_launch_surfaces_the_provider_error(doubles: Doubles) {
    doubles.provider.reject_launches();

    let err = doubles
        .orchestrator(fast_cluster(Topology::SingleNode, 1))
        .deploy()
        .await
        .expect_err("launch rejection is fatal");

    assert!(matches!(err, DeployError::Provider(_)), "{err}");
    assert!(doubles.executor.execs().is_empty());
}

#[rstest]
#[tokio::test]
async fn transport_failures_are_retried_then_reported(doubles: Doubles) {
    doubles.executor.fail_host("srv-1.pub.example");

    let results = doubles
        .orchestrator(fast_cluster(Topology::SingleNode, 1))
        .deploy()
        .await
        .unwrap_or_else(|err| panic!("node failures are not fatal: {err}"));

    let [node] = results.as_slice() else {
        panic!("expected one result, got {results:?}");
    };
    assert!(!node.is_success());
    assert_eq!(node.attempts, 3);
}
