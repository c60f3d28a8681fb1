//! lodestar configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default coordination ensemble
    pub static DEFAULT_COORDINATION_HOSTS: &str = "127.0.0.1:2181";
    /// Default coordination session timeout (ms)
    pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;
    /// Default root of service names in the coordination service
    pub static DEFAULT_NAMING_ROOT: &str = naming::DEFAULT_NAMING_ROOT;
    /// Default naming type routers resolve their names with
    pub static DEFAULT_NAMING: &str = "coordination";
    /// Default period of the self-stats timer (ms)
    pub const DEFAULT_STAT_TIMER_MS: u64 = 1_000;
    /// Default ticks per statistics window
    pub const DEFAULT_STAT_REPORT_CYCLE: u32 = 10;
    /// Default RPC call timeout (ms)
    pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 3_000;
    /// Default max transport events per tick
    pub const DEFAULT_POLL_BATCH: usize = 256;
    /// Default sleep after a tick that handled nothing (ms)
    pub const DEFAULT_IDLE_SLEEP_MS: u64 = 10;
    /// default log level. Can use this argument or LODESTAR_LOG env var
    pub const DEFAULT_LODESTAR_LOG: &str = "info";

    use std::{path::PathBuf, time::Duration};

    pub use clap::Parser;
    use coordination::SessionConfig;
    use naming::{NamingConfig, NamingType};

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "lodestar", bin_name = "lodestar", about, long_about = None)]
    /// parses from cli & environment var. lodestar will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// comma separated coordination ensemble
        #[clap(long, env, value_parser, default_value = DEFAULT_COORDINATION_HOSTS)]
        pub coordination_hosts: String,
        /// coordination session timeout in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SESSION_TIMEOUT_MS)]
        pub session_timeout_ms: u64,
        /// prefix applied to every coordination path, e.g. `/prod`
        #[clap(long, env, value_parser)]
        pub chroot: Option<String>,
        /// node under which service names live
        #[clap(long, env, value_parser, default_value = DEFAULT_NAMING_ROOT)]
        pub naming_root: String,
        /// naming type routers resolve their names with
        #[clap(long, env, value_parser, default_value = DEFAULT_NAMING)]
        pub default_naming: NamingType,
        /// period of the self-stats timer in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STAT_TIMER_MS)]
        pub stat_timer_ms: u64,
        /// ticks per statistics window
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STAT_REPORT_CYCLE)]
        pub stat_report_cycle: u32,
        /// RPC call timeout in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CALL_TIMEOUT_MS)]
        pub call_timeout_ms: u64,
        /// max transport events handled per tick
        #[clap(long, env, value_parser, default_value_t = DEFAULT_POLL_BATCH)]
        pub poll_batch: usize,
        /// sleep after a tick that handled nothing, in ms
        #[clap(long, env, value_parser, default_value_t = DEFAULT_IDLE_SLEEP_MS)]
        pub idle_sleep_ms: u64,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_LODESTAR_LOG)]
        pub lodestar_log: String,
        /// yaml file of static routes and routers to create at startup
        #[clap(short, long, env, value_parser)]
        pub routes_path: Option<PathBuf>,
    }

    impl Config {
        /// coordination session timeout
        pub fn session_timeout(&self) -> Duration {
            Duration::from_millis(self.session_timeout_ms)
        }

        /// period of the self-stats timer
        pub fn stat_interval(&self) -> Duration {
            Duration::from_millis(self.stat_timer_ms)
        }

        /// RPC call timeout
        pub fn call_timeout(&self) -> Duration {
            Duration::from_millis(self.call_timeout_ms)
        }

        /// idle sleep
        pub fn idle_sleep(&self) -> Duration {
            Duration::from_millis(self.idle_sleep_ms)
        }

        /// coordination session parameters
        pub fn session_config(&self) -> SessionConfig {
            SessionConfig::new(self.coordination_hosts.clone())
                .with_timeout(self.session_timeout())
                .with_chroot(self.chroot.clone())
        }

        /// settings handed to naming factories
        pub fn naming_config(&self) -> NamingConfig {
            NamingConfig {
                session: self.session_config(),
                root: self.naming_root.clone(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let config = Config::parse_from(["lodestar"]);
            assert_eq!(config.default_naming, NamingType::Coordination);
            assert_eq!(config.session_timeout(), Duration::from_secs(10));
            assert_eq!(config.naming_config().root, "/lodestar/services");
            assert_eq!(config.routes_path, None);
        }

        #[test]
        fn test_flags() {
            let config = Config::parse_from([
                "lodestar",
                "--default-naming",
                "static",
                "--chroot",
                "/prod",
                "--poll-batch",
                "8",
            ]);
            assert_eq!(config.default_naming, NamingType::Static);
            assert_eq!(config.session_config().chroot.as_deref(), Some("/prod"));
            assert_eq!(config.poll_batch, 8);
            assert!(Config::try_parse_from(["lodestar", "--default-naming", "dns"]).is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Logging setup
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. The filter comes from `lodestar_log`,
        /// the format from `LOG_FORMAT`.
        pub fn parse(lodestar_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(lodestar_log).or_else(|_| EnvFilter::try_new("info"))?;

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}

pub mod routes {
    //! startup routes file
    //!
    //! ```yaml
    //! static_routes:
    //!   echo:
    //!     - mem://echo-1
    //!     - mem://echo-2
    //! routers:
    //!   echo: round_robin
    //! ```
    use std::{collections::BTreeMap, fs, path::Path};

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};

    use crate::driver::routing::RouterType;

    /// Parsed routes file
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RoutesFile {
        /// name -> urls, registered on the default naming type at startup
        #[serde(default)]
        pub static_routes: BTreeMap<String, Vec<String>>,
        /// routers to create at startup, by name
        #[serde(default)]
        pub routers: BTreeMap<String, RouterType>,
    }

    impl RoutesFile {
        /// Parse yaml text
        pub fn parse(yaml: &str) -> Result<Self> {
            serde_yaml::from_str(yaml).context("failed to parse routes file")
        }

        /// Read and parse `path`
        pub fn load(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read routes file {}", path.display()))?;
            Self::parse(&text)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse() {
            let routes = RoutesFile::parse(
                "static_routes:\n  echo:\n    - mem://a\n    - mem://b\nrouters:\n  echo: hash\n",
            )
            .unwrap();
            assert_eq!(routes.static_routes["echo"], vec!["mem://a", "mem://b"]);
            assert_eq!(routes.routers["echo"], RouterType::Hash);
            assert_eq!(RoutesFile::parse("{}").unwrap(), RoutesFile::default());
            assert!(RoutesFile::parse("routers:\n  echo: sticky\n").is_err());
        }

        #[test]
        fn test_missing_file() {
            let err = RoutesFile::load("/nonexistent/routes.yaml").unwrap_err();
            assert!(err.to_string().contains("/nonexistent/routes.yaml"));
        }
    }
}
