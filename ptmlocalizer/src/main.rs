use std::fs;
use std::io;
use std::path::Path;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ptmlocalizer::{PtmLocalizer, PtmLocalizerError};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy()
}

fn configure_log(log_file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .compact()
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .with_writer(io::stderr)
        .with_filter(env_filter());

    match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(fs::File::create(path)?);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_timer(fmt::time::ChronoLocal::rfc_3339())
                .with_writer(writer)
                .with_filter(env_filter());
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            Ok(None)
        }
    }
}

fn main() -> Result<(), PtmLocalizerError> {
    let args = PtmLocalizer::parse();
    let config_file = args.config_file.clone();

    let mut config = Figment::new()
        .merge(Serialized::defaults(args))
        .merge(Toml::file("ptmlocalizer.toml"));
    if let Some(path) = config_file {
        config = config.merge(Toml::file_exact(path));
    }
    let args: PtmLocalizer = config.merge(Env::prefixed("PTMLOCALIZER_")).extract()?;

    let _guard = configure_log(args.log_file.as_deref())?;

    if let Some(path) = args.write_config.as_ref() {
        info!("Writing configuration to {}", path.display());
        fs::write(path, toml::to_string_pretty(&args)?)?;
    }

    args.main().map_err(|e| {
        error!("{e}");
        e
    })
}
