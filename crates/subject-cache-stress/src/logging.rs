use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use subject_cache::config::Config as ServiceConfig;
use subject_cache::metrics;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

#[derive(Debug)]
pub struct Config<'a> {
    pub backtraces: bool,
    pub sentry_dsn: Option<Dsn>,
    pub verbose: bool,
    pub metrics: bool,
    pub service_config: &'a ServiceConfig,
}

#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up sentry, logging and metrics for the stresstest.
///
/// # Safety
/// This modifies the environment, see [`subject_cache::logging::init_logging`].
pub unsafe fn init(config: Config<'_>) -> Result<Guard> {
    let mut guard = Guard::default();

    if let Some(dsn) = config.sentry_dsn {
        guard._sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        }));
    }

    if config.verbose {
        // SAFETY: Forwarded to our caller.
        unsafe { subject_cache::logging::init_logging(config.service_config) };
    } else {
        if config.backtraces {
            // SAFETY: Forwarded to our caller.
            unsafe { env::set_var("RUST_BACKTRACE", "1") };
        }

        let subscriber = fmt()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_env_filter("INFO");

        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        let subscriber = subscriber.with_writer(|| NoopWriter);

        // this should mimic the settings used in production:
        subscriber
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .with(sentry::integrations::tracing::layer())
            .init();
    }

    let metrics_config = &config.service_config.metrics;
    if let Some(statsd) = &metrics_config.statsd {
        metrics::configure_statsd(
            &metrics_config.prefix,
            statsd.as_str(),
            metrics_config.custom_tags.clone(),
        )?;
    } else if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind local statsd sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    break;
                }
            }
        }));

        let host = format!("127.0.0.1:{}", socket.port());

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd(&metrics_config.prefix, host, tags)?;
    }

    Ok(guard)
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
