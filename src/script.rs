//! Rendering of node setup scripts.
//!
//! Scripts are assembled from an ordered list of [`Statement`]s and rendered
//! to bash. Rendering is a pure function of the role, the cluster
//! configuration and the [`HostContext`]: identical inputs always produce
//! byte-identical output.

use shell_escape::unix::escape;

use crate::cluster::{ClusterConfig, Role};

/// Application property prefixes forwarded to nodes.
pub const RECOGNISED_PREFIXES: [&str; 8] = [
    "server.",
    "management.",
    "spring.",
    "endpoints.",
    "messaging.",
    "mqtt.",
    "APP_",
    "PORT",
];

const SHEBANG: &str = "#!/usr/bin/env bash";

/// Returns `true` when `key` is forwarded to nodes.
#[must_use]
pub fn is_recognised_key(key: &str) -> bool {
    RECOGNISED_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

/// Converts a property key into an environment variable name.
#[must_use]
pub fn env_name(key: &str) -> String {
    key.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Role-specific substitutions resolved before rendering.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostContext {
    admin_host: Option<String>,
    container_index: Option<u32>,
    overrides: Vec<(String, String)>,
}

impl HostContext {
    /// Context for a node that is its own admin (admin and single-node).
    #[must_use]
    pub fn for_self(host: impl Into<String>) -> Self {
        Self {
            admin_host: Some(host.into()),
            ..Self::default()
        }
    }

    /// Context for container `index`, resolving its overrides once.
    #[must_use]
    pub fn for_container(config: &ClusterConfig, admin_host: impl Into<String>, index: u32) -> Self {
        Self {
            admin_host: Some(admin_host.into()),
            container_index: Some(index),
            overrides: config.overrides_for(index).to_vec(),
        }
    }

    /// Resolved admin address, if any.
    #[must_use]
    pub fn admin_host(&self) -> Option<&str> {
        self.admin_host.as_deref()
    }

    /// Container index, for container contexts.
    #[must_use]
    pub const fn container_index(&self) -> Option<u32> {
        self.container_index
    }

    /// Overrides scoped to this context.
    #[must_use]
    pub fn overrides(&self) -> &[(String, String)] {
        &self.overrides
    }
}

/// A single line of a rendered script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Statement {
    /// `export NAME=value` with the value shell-escaped.
    Export {
        /// Variable name.
        name: String,
        /// Unescaped value.
        value: String,
    },
    /// A command line emitted verbatim.
    Exec(String),
}

impl Statement {
    fn export(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Export {
            name: name.into(),
            value: value.into(),
        }
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Self::Export { name, value } => {
                out.push_str("export ");
                out.push_str(name);
                out.push('=');
                out.push_str(&quote(value));
            }
            Self::Exec(line) => out.push_str(line),
        }
        out.push('\n');
    }
}

fn quote(value: &str) -> String {
    escape(value.into()).into_owned()
}

/// Builds setup and startup scripts for cluster nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptBuilder;

impl ScriptBuilder {
    /// Renders the setup script for `role`.
    ///
    /// Statements are emitted in a fixed order: base environment, per-index
    /// overrides, distribution fetch and unpack, configuration command and
    /// finally the backgrounded launcher.
    ///
    /// The base environment is the install directory, the dependent-service
    /// addresses and the admin host, followed by every recognised application
    /// property. Properties are exported here as well as handed to the
    /// configuration command so the launcher started by the same shell sees
    /// them; per-index overrides come after them and therefore win.
    #[must_use]
    pub fn render(role: Role, config: &ClusterConfig, context: &HostContext) -> String {
        render_statements(&Self::statements(role, config, context))
    }

    /// Returns the ordered statements behind [`ScriptBuilder::render`].
    #[must_use]
    pub fn statements(role: Role, config: &ClusterConfig, context: &HostContext) -> Vec<Statement> {
        let base = base_environment(config, context);
        let mut statements: Vec<Statement> = base
            .iter()
            .map(|(name, value)| Statement::export(name.as_str(), value.as_str()))
            .collect();
        statements.extend(
            recognised_properties(config)
                .map(|(key, value)| Statement::export(env_name(key), value)),
        );
        statements.extend(
            context
                .overrides()
                .iter()
                .map(|(key, value)| Statement::export(env_name(key), value.as_str())),
        );
        statements.extend(fetch_statements(config));
        statements.push(Statement::Exec(configure_command(config, context, &base)));
        statements.push(Statement::Exec(launch_command(role, config)));
        statements
    }

    /// Renders the first-boot user-data script for `role`.
    ///
    /// Admin and single-node instances start the local cache and broker and,
    /// unless the embedded coordination service is used, the coordination
    /// service. Containers only run a minimal bootstrap.
    #[must_use]
    pub fn startup(role: Role, config: &ClusterConfig) -> String {
        let mut statements = Vec::new();
        match role {
            Role::SingleNode | Role::Admin => {
                statements.push(Statement::Exec(String::from("systemctl start redis-server")));
                statements.push(Statement::Exec(String::from(
                    "systemctl start rabbitmq-server",
                )));
                if config.services.coordination.is_some() {
                    statements.push(Statement::Exec(String::from("systemctl start zookeeper")));
                }
            }
            Role::Container => {
                statements.push(Statement::Exec(format!(
                    "mkdir -p {}",
                    quote(&config.remote_home)
                )));
            }
        }
        render_statements(&statements)
    }
}

fn render_statements(statements: &[Statement]) -> String {
    let mut out = String::from(SHEBANG);
    out.push('\n');
    for statement in statements {
        statement.render_into(&mut out);
    }
    out
}

fn base_environment(config: &ClusterConfig, context: &HostContext) -> Vec<(String, String)> {
    let services = &config.services;
    let mut env = vec![
        (String::from("APP_HOME"), config.app_home()),
        (String::from("CACHE_ADDRESSES"), join_addresses(&services.cache)),
        (String::from("BROKER_ADDRESSES"), join_addresses(&services.brokers)),
    ];
    if let Some(primary) = services.cache.first() {
        env.push((String::from("CACHE_HOST"), primary.host.clone()));
        env.push((String::from("CACHE_PORT"), primary.port.to_string()));
    }
    if let Some(coordination) = &services.coordination {
        env.push((
            String::from("COORDINATION_CONNECT"),
            join_addresses(coordination),
        ));
    }
    if let Some(admin) = context.admin_host() {
        env.push((String::from("ADMIN_HOST"), admin.to_owned()));
    }
    env
}

fn join_addresses(addresses: &[crate::cluster::ServiceAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn recognised_properties(config: &ClusterConfig) -> impl Iterator<Item = (&str, &str)> {
    config
        .properties
        .iter()
        .filter(|(key, _)| is_recognised_key(key))
        .map(|(key, value)| (key.as_str(), value.as_str()))
}

fn fetch_statements(config: &ClusterConfig) -> Vec<Statement> {
    let distribution = &config.distribution;
    let home = quote(&config.remote_home);
    let mut statements = Vec::new();
    if !distribution.skip_fetch {
        statements.push(Statement::Exec(format!(
            "wget -q -P {home} {}",
            quote(&distribution.url)
        )));
    }
    let archive = format!("{}/{}", config.remote_home, distribution.archive_name());
    statements.push(Statement::Exec(format!(
        "unzip -o -q {} -d {home}",
        quote(&archive)
    )));
    let lib_dir = quote(&format!("{}/lib", config.app_home()));
    for url in &distribution.extra_library_urls {
        statements.push(Statement::Exec(format!(
            "wget -q -P {lib_dir} {}",
            quote(url)
        )));
    }
    statements
}

fn configure_command(
    config: &ClusterConfig,
    context: &HostContext,
    base: &[(String, String)],
) -> String {
    let home = &config.remote_home;
    let mut command = format!(
        "{} apply-env --profile {}",
        quote(&config.remote_payload_path()),
        quote(&format!("{home}/.bashrc"))
    );
    let entries = base
        .iter()
        .map(|(name, value)| (name.clone(), value.as_str()))
        .chain(recognised_properties(config).map(|(key, value)| (env_name(key), value)))
        .chain(
            context
                .overrides()
                .iter()
                .map(|(key, value)| (env_name(key), value.as_str())),
        );
    for (name, value) in entries {
        command.push(' ');
        command.push_str(&quote(&format!("--{name}={value}")));
    }
    command.push_str(&format!(
        " > {} 2> {}",
        quote(&format!("{home}/config.txt")),
        quote(&format!("{home}/configError.txt"))
    ));
    command
}

fn launch_command(role: Role, config: &ClusterConfig) -> String {
    let distribution = &config.distribution;
    let launcher = format!("{}-{}", distribution.launcher_prefix, role.launcher_suffix());
    let mut command = format!(
        "nohup {}",
        quote(&format!("{}/bin/{launcher}", config.app_home()))
    );
    if let Some(distro) = &distribution.launch_distro
        && matches!(role, Role::SingleNode | Role::Container)
    {
        command.push_str(" --distro ");
        command.push_str(&quote(distro));
    }
    command.push_str(&format!(
        " > {} 2>&1 &",
        quote(&format!("{}/{launcher}.log", config.remote_home))
    ));
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ServiceAddress, Topology};
    use crate::test_support::sample_cluster;

    fn container_script(index: u32) -> String {
        let config = sample_cluster(Topology::MultiNode, 3);
        let context = HostContext::for_container(&config, "admin.example", index);
        ScriptBuilder::render(Role::Container, &config, &context)
    }

    #[test]
    fn statement_order_is_fixed() {
        let config = sample_cluster(Topology::SingleNode, 0);
        let script =
            ScriptBuilder::render(Role::SingleNode, &config, &HostContext::for_self("node.example"));

        let positions: Vec<usize> = [
            "export APP_HOME=",
            "wget -q -P /root 'https://",
            "unzip -o -q /root/app-1.0.zip -d /root",
            "/root/stratus apply-env",
            "nohup /root/app-1.0/bin/app-singlenode",
        ]
        .iter()
        .map(|needle| {
            script
                .find(needle)
                .unwrap_or_else(|| panic!("missing {needle} in:\n{script}"))
        })
        .collect();

        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "statements out of order:\n{script}");
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.trim_end().ends_with('&'), "launch must be backgrounded");
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(container_script(2), container_script(2));
    }

    #[test]
    fn container_overrides_are_scoped_to_their_index() {
        let second = container_script(2);
        let first = container_script(1);

        assert!(second.contains("export APP_ROLE=ingest"), "{second}");
        assert!(second.contains("--APP_ROLE=ingest"), "{second}");
        assert!(!second.contains("APP_ROLE=sink"), "{second}");
        assert!(first.contains("export APP_ROLE=sink"), "{first}");
        assert!(!first.contains("ingest"), "{first}");
    }

    #[test]
    fn skip_fetch_only_drops_the_download() {
        let mut config = sample_cluster(Topology::SingleNode, 0);
        config.distribution.skip_fetch = true;
        let script =
            ScriptBuilder::render(Role::SingleNode, &config, &HostContext::for_self("node"));

        assert!(!script.contains("wget -q -P /root "), "{script}");
        assert!(script.contains("unzip -o -q"), "{script}");
    }

    #[test]
    fn forwards_only_recognised_properties() {
        let script = container_script(1);

        assert!(script.contains("export server_port=9000"), "{script}");
        assert!(script.contains("--server_port=9000"), "{script}");
        assert!(!script.contains("internal_secret"), "{script}");
    }

    #[test]
    fn admin_launcher_ignores_distro_argument() {
        let mut config = sample_cluster(Topology::MultiNode, 1);
        config.distribution.launch_distro = Some(String::from("hadoop27"));

        let admin = ScriptBuilder::render(Role::Admin, &config, &HostContext::for_self("admin"));
        let container = ScriptBuilder::render(
            Role::Container,
            &config,
            &HostContext::for_container(&config, "admin", 1),
        );

        assert!(!admin.contains("--distro"), "{admin}");
        assert!(container.contains("app-container --distro hadoop27"), "{container}");
    }

    #[test]
    fn container_script_points_at_admin() {
        let script = container_script(3);
        assert!(script.contains("export ADMIN_HOST=admin.example"), "{script}");
    }

    #[test]
    fn values_are_shell_escaped() {
        let mut config = sample_cluster(Topology::SingleNode, 0);
        config
            .properties
            .insert(String::from("APP_GREETING"), String::from("hello world"));
        let script =
            ScriptBuilder::render(Role::SingleNode, &config, &HostContext::for_self("node"));

        assert!(script.contains("export APP_GREETING='hello world'"), "{script}");
        assert!(script.contains("'--APP_GREETING=hello world'"), "{script}");
    }

    #[test]
    fn startup_scripts_depend_on_role_and_coordination() {
        let multi = sample_cluster(Topology::MultiNode, 1);
        let single = sample_cluster(Topology::SingleNode, 0);

        let admin = ScriptBuilder::startup(Role::Admin, &multi);
        assert!(admin.contains("systemctl start redis-server"));
        assert!(admin.contains("systemctl start zookeeper"));

        let embedded = ScriptBuilder::startup(Role::SingleNode, &single);
        assert!(embedded.contains("systemctl start rabbitmq-server"));
        assert!(!embedded.contains("zookeeper"));

        let container = ScriptBuilder::startup(Role::Container, &multi);
        assert_eq!(container, "#!/usr/bin/env bash\nmkdir -p /root\n");
    }

    #[test]
    fn properties_follow_base_exports_and_precede_overrides() {
        let script = container_script(1);
        let position = |needle: &str| {
            script
                .find(needle)
                .unwrap_or_else(|| panic!("missing {needle} in:\n{script}"))
        };

        assert!(position("export ADMIN_HOST=") < position("export server_port=9000"));
        assert!(position("export server_port=9000") < position("export APP_ROLE=sink"));
    }

    #[test]
    fn every_cache_replica_is_exported() {
        let mut config = sample_cluster(Topology::SingleNode, 0);
        config.services.cache = vec![
            ServiceAddress::new("c1.internal", 6379),
            ServiceAddress::new("c2.internal", 6380),
        ];
        let script =
            ScriptBuilder::render(Role::SingleNode, &config, &HostContext::for_self("node"));

        assert!(
            script.contains("export CACHE_ADDRESSES='c1.internal:6379,c2.internal:6380'"),
            "{script}"
        );
        assert!(script.contains("export CACHE_HOST=c1.internal"), "{script}");
        assert!(script.contains("export CACHE_PORT=6379"), "{script}");
    }

    #[test]
    fn env_names_replace_separators() {
        assert_eq!(env_name("spring.redis-host"), "spring_redis_host");
        assert!(is_recognised_key("PORT"));
        assert!(!is_recognised_key("internal.secret"));
    }
}
