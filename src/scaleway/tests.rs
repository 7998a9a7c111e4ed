//! Unit tests for the Scaleway provider helpers that do not touch the API.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use rstest::{fixture, rstest};
use scaleway_rs::{ScalewayApiError, ScalewayImage};

use super::server::{PublicIp, ServerRecord, server_url, user_data_url, CLOUD_INIT_USER_DATA_KEY};
use super::*;
use crate::provider::InstanceState;
use crate::test_support::{sample_launch_spec, sample_scaleway};

#[derive(Copy, Clone)]
struct ImageSpec {
    id: &'static str,
    arch: &'static str,
    state: &'static str,
    creation_date: &'static str,
}

fn image(spec: ImageSpec) -> ScalewayImage {
    ScalewayImage {
        id: spec.id.to_owned(),
        name: String::new(),
        arch: spec.arch.to_owned(),
        creation_date: spec.creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: spec.state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn available(id: &'static str, creation_date: &'static str) -> ScalewayImage {
    image(ImageSpec {
        id,
        arch: "x86_64",
        state: "available",
        creation_date,
    })
}

fn record(state: &str, allowed: &[&str], address: Option<&str>, raw_tags: &[&str]) -> ServerRecord {
    ServerRecord {
        id: String::from("srv-abc"),
        state: state.to_owned(),
        allowed_actions: allowed.iter().map(|action| (*action).to_owned()).collect(),
        public_ip: address.map(|value| PublicIp {
            address: value.to_owned(),
        }),
        tags: raw_tags.iter().map(|tag| (*tag).to_owned()).collect(),
    }
}

#[fixture]
fn provider() -> ScalewayProvider {
    ScalewayProvider::new(&sample_scaleway()).expect("sample config is valid")
}

#[test]
fn rejects_config_without_secret() {
    let mut config = sample_scaleway();
    config.secret_key.clear();

    let Err(err) = ScalewayProvider::new(&config) else {
        panic!("missing secret should be rejected");
    };
    assert!(matches!(err, ScalewayProviderError::Config(_)), "{err}");
}

#[test]
fn newest_image_wins() {
    let spec = sample_launch_spec();
    let images = vec![
        available("older", "2025-01-01T00:00:00Z"),
        available("newest", "2025-02-01T00:00:00Z"),
    ];

    let id = ScalewayProvider::newest_image_id(images, &spec).expect("image selected");
    assert_eq!(id, "newest");
}

#[test]
fn unusable_images_are_filtered() {
    let spec = sample_launch_spec();
    let images = vec![
        image(ImageSpec {
            id: "arm",
            arch: "arm64",
            state: "available",
            creation_date: "2025-03-01T00:00:00Z",
        }),
        image(ImageSpec {
            id: "building",
            arch: "x86_64",
            state: "creating",
            creation_date: "2025-03-01T00:00:00Z",
        }),
        available("ok", "2024-01-01T00:00:00Z"),
    ];

    let ids: Vec<_> = ScalewayProvider::usable_images(images, &spec)
        .into_iter()
        .map(|candidate| candidate.id)
        .collect();
    assert_eq!(ids, vec![String::from("ok")]);
}

#[rstest]
#[tokio::test]
async fn project_images_skip_the_public_lookup(provider: ScalewayProvider) {
    let spec = sample_launch_spec();
    let public_called = Rc::new(Cell::new(false));
    let flag = Rc::clone(&public_called);

    let id = provider
        .resolve_image_id_with(
            &spec,
            || async { Ok(vec![available("project", "2025-01-01T00:00:00Z")]) },
            move || {
                flag.set(true);
                async { Ok(vec![available("public", "2025-06-01T00:00:00Z")]) }
            },
        )
        .await
        .expect("image resolved");

    assert_eq!(id, "project");
    assert!(!public_called.get());
}

#[rstest]
#[tokio::test]
async fn empty_sources_report_image_not_found(provider: ScalewayProvider) {
    let spec = sample_launch_spec();

    let err = provider
        .resolve_image_id_with(&spec, || async { Ok(Vec::new()) }, || async {
            Ok(Vec::new())
        })
        .await
        .expect_err("no images available");

    assert!(matches!(err, ScalewayProviderError::ImageNotFound { .. }), "{err}");
}

#[test]
fn describe_derives_dns_name_from_public_ip() {
    let description = record("running", &[], Some("51.15.0.7"), &["stratus", "Name=demo"])
        .describe("fr-par-1");

    assert_eq!(description.state, InstanceState::Running);
    assert_eq!(
        description.public_ip,
        Some(IpAddr::V4(Ipv4Addr::new(51, 15, 0, 7)))
    );
    assert_eq!(
        description.dns_name.as_deref(),
        Some("srv-abc.pub.instances.scw.cloud")
    );
    assert_eq!(description.tags.get("Name"), Some("demo"));
}

#[test]
fn describe_without_address_has_no_dns_name() {
    let description = record("starting", &[], None, &[]).describe("fr-par-1");

    assert_eq!(description.state, InstanceState::Starting);
    assert_eq!(description.public_ip, None);
    assert_eq!(description.dns_name, None);
}

#[rstest]
#[tokio::test]
async fn running_servers_need_no_power_on(provider: ScalewayProvider) {
    let server = record("running", &["poweron"], None, &[]);
    assert!(provider.power_on_if_needed("fr-par-1", &server).await.is_ok());
}

#[rstest]
#[tokio::test]
async fn power_on_requires_the_allowed_action(provider: ScalewayProvider) {
    let server = record("locked", &[], None, &[]);
    let result = provider.power_on_if_needed("fr-par-1", &server).await;
    assert!(matches!(
        result,
        Err(ScalewayProviderError::PowerOnNotAllowed { .. })
    ));
}

#[test]
fn creation_tags_mark_the_instance_and_record_the_key() {
    let spec = sample_launch_spec();
    assert_eq!(
        ScalewayProvider::creation_tags(&spec),
        vec![String::from("stratus"), String::from("KeyName=ops-key")]
    );
}

#[rstest]
#[case::resource(r#"{"type":"not_found","message":"","resource":"commercial_type"}"#)]
#[case::resource_id(r#"{"type":"not_found","message":"","resource_id":"DEV1-M"}"#)]
#[case::message(r#"{"type":"invalid_arguments","message":"Invalid commercial_type"}"#)]
fn detects_instance_type_errors(#[case] body: &str) {
    let mut value: serde_json::Value = serde_json::from_str(body).expect("valid json");
    // The SDK names the error kind `etype`; accept either spelling.
    if let Some(kind) = value.get("type").cloned() {
        value["etype"] = kind;
    }
    let api_err: ScalewayApiError = serde_json::from_value(value).expect("api error parses");

    assert!(ScalewayProvider::is_instance_type_error(
        &api_err,
        &sample_launch_spec()
    ));
}

#[test]
fn builds_api_urls() {
    assert_eq!(
        server_url("fr-par-1", "server-123"),
        "https://api.scaleway.com/instance/v1/zones/fr-par-1/servers/server-123"
    );
    assert_eq!(
        user_data_url("fr-par-1", "server-123", CLOUD_INIT_USER_DATA_KEY),
        "https://api.scaleway.com/instance/v1/zones/fr-par-1/servers/server-123/user_data/cloud-init"
    );
}

fn handle(id: &str) -> InstanceHandle {
    InstanceHandle {
        id: id.to_owned(),
        zone: String::from("fr-par-1"),
    }
}

#[tokio::test]
async fn failed_launch_discards_the_servers_already_created() {
    let attempts = Cell::new(0_u32);
    let discarded: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&discarded);

    let result = ScalewayProvider::launch_batch_with(
        3,
        || {
            let attempt = attempts.get() + 1;
            attempts.set(attempt);
            async move {
                if attempt == 3 {
                    Err(ScalewayProviderError::provider(&"quota exceeded"))
                } else {
                    Ok(handle(&format!("srv-{attempt}")))
                }
            }
        },
        |launched, cause| async move {
            sink.borrow_mut()
                .extend(launched.into_iter().map(|instance| instance.id));
            cause
        },
    )
    .await;

    assert_eq!(
        result,
        Err(ScalewayProviderError::Provider {
            message: String::from("quota exceeded")
        })
    );
    assert_eq!(attempts.get(), 3);
    assert_eq!(
        *discarded.borrow(),
        vec![String::from("srv-1"), String::from("srv-2")]
    );
}

#[tokio::test]
async fn complete_batches_discard_nothing() {
    let attempts = Cell::new(0_u32);
    let discarded = Cell::new(false);

    let handles = ScalewayProvider::launch_batch_with(
        2,
        || {
            let attempt = attempts.get() + 1;
            attempts.set(attempt);
            async move { Ok(handle(&format!("srv-{attempt}"))) }
        },
        |_, cause| {
            discarded.set(true);
            async move { cause }
        },
    )
    .await
    .expect("every launch succeeds");

    assert_eq!(handles, vec![handle("srv-1"), handle("srv-2")]);
    assert!(!discarded.get());
}
