use std::io::Write;

use env_logger::fmt::style::{AnsiColor, Style};
use log::LevelFilter;

/// Filter directives read from this variable are applied after the defaults.
pub const LOG_FILTER_ENV: &str = "RUST_LOG";

/// Initializes the global logger.
///
/// Records of other crates are shown from the `warn` level. Without `debug` the output
/// is the short `<time> <level> <message>` form, with it records carry milliseconds and
/// the module path.
pub fn setup_logging(debug: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module(
        "clusterq",
        if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
    );

    if debug {
        builder.format_timestamp_millis().format_module_path(true);
    } else {
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let time_style = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
            writeln!(
                buf,
                "{time_style}{}{time_style:#} {level_style}{:<5}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_env(LOG_FILTER_ENV);
    builder.init();
}
