//! fipd process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3334";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "fipd-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/fipd/config.yaml";
    /// default log level. Can use this argument or FIPD_LOG env var
    pub const DEFAULT_FIPD_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "fipd", bin_name = "fipd", about, long_about = None)]
    /// parses from cli & environment var. fipd will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to fipd's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// name of this manager host, overrides `host` in the config file
        #[clap(long, env = "FIPD_HOST", value_parser)]
        pub host: Option<String>,
        /// address for the health/metrics api
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of tokio worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_FIPD_LOG)]
        pub fipd_log: String,
    }

    impl Config {
        /// host name to run as: the cli/env value wins over the file value
        pub fn effective_host<'a>(&'a self, configured: &'a str) -> &'a str {
            self.host.as_deref().unwrap_or(configured)
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::{Context, Result};
    use tracing_subscriber::{
        Layer, Registry,
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

    /// Configuration for the global tracing subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// install the global subscriber, the format comes from LOG_FORMAT
        pub fn parse(fipd_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // level comes from --fipd-log / FIPD_LOG, nats client chatter is capped
            let filter = EnvFilter::try_new(fipd_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("async_nats=warn".parse()?);

            tracing_subscriber::registry()
                .with(format_layer(&log_frmt))
                .with(filter)
                .try_init()
                .context("global tracing subscriber already set")?;

            Ok(Self { log_frmt })
        }
    }

    fn format_layer(log_frmt: &str) -> Box<dyn Layer<Registry> + Send + Sync> {
        match log_frmt {
            "json" => fmt::layer().json().boxed(),
            "pretty" => fmt::layer()
                .event_format(Format::default().pretty().with_source_location(false))
                .fmt_fields(PrettyFields::new())
                .boxed(),
            _ => fmt::layer().boxed(),
        }
    }
}
