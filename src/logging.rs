use std::path::Path;

use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log::LevelFilter;

/// Builds the log4rs config used by every subcommand. `component` is the
/// short token (e.g. "decode", "spatial-filter") printed on every line so
/// stderr output can be attributed per §7 of the design.
pub fn init_logging(
    component: &'static str,
    log_filepath: Option<&Path>,
    verbose: bool,
) -> anyhow::Result<log4rs::Handle> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let pattern = format!("[{component}] {{d(%H:%M:%S)}} {{l}} - {{m}}{{n}}");

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&pattern)))
        .target(log4rs::append::console::Target::Stderr)
        .build();

    let mut builder = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)));
    let mut root_appenders = vec!["console".to_string()];

    if let Some(fp) = log_filepath {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&pattern)))
            .build(fp)?;
        builder =
            builder.appender(Appender::builder().build("file", Box::new(file)));
        root_appenders.push("file".to_string());
    }

    let root = root_appenders
        .iter()
        .fold(Root::builder(), |b, name| b.appender(name))
        .build(level);

    let config = builder
        .logger(Logger::builder().build("rust_htslib", LevelFilter::Warn))
        .build(root)?;

    Ok(log4rs::init_config(config)?)
}
